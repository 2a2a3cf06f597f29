use rusqlite::Connection;
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::types::{now_ms, MemoryItem, MemoryKind, ScopeType};

use super::{json_col, Store};

/// Storage-level upsert request for one memory item. The consolidator and
/// the immediate-capture path both reduce their extraction ops to this.
#[derive(Debug, Clone)]
pub struct ItemUpsert {
    pub user_id: String,
    pub agent_id: String,
    pub kind: MemoryKind,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub key: String,
    pub content: String,
    pub confidence: f64,
    /// Epoch ms; 0 means never expires.
    pub expires_at: i64,
    pub source_event_id: String,
    pub metadata: serde_json::Value,
}

impl Store {
    /// Upsert one item. On conflict with a live row the content, confidence,
    /// weight, and last_seen are refreshed in place; no duplicate is created.
    /// Returns `(item_id, was_insert)`.
    pub fn upsert_memory_item(&self, item: &ItemUpsert) -> Result<(i64, bool)> {
        let conn = self.conn.lock().unwrap();
        Ok(upsert_item_tx(&conn, item, now_ms())?)
    }

    pub fn get_memory_item(&self, id: i64) -> Result<Option<MemoryItem>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            &format!("SELECT {ITEM_COLS} FROM memory_items WHERE id = ?1"),
            rusqlite::params![id],
            row_to_item,
        ) {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    /// Tombstone an item and drop it from the FTS index. The row survives
    /// for audit; recall never sees it again.
    pub fn tombstone_memory_item(&self, id: i64, at: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let row: Option<String> = conn
            .query_row(
                "SELECT content FROM memory_items WHERE id = ?1 AND deleted_at = 0",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .ok();
        let Some(content) = row else {
            return Ok(false);
        };
        conn.execute(
            "INSERT INTO memory_items_fts(memory_items_fts, rowid, content)
             VALUES('delete', ?1, ?2)",
            rusqlite::params![id, content],
        )?;
        conn.execute(
            "UPDATE memory_items SET deleted_at = ?1 WHERE id = ?2",
            rusqlite::params![at, id],
        )?;
        debug!(item_id = id, "memory item tombstoned");
        Ok(true)
    }

    /// Live, unexpired candidates visible under the scope triple.
    pub fn load_candidates(
        &self,
        session_key: &str,
        user_id: &str,
        agent_id: &str,
        include_session: bool,
        include_user: bool,
        include_global: bool,
        now: i64,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let conn = self.conn.lock().unwrap();
        let mut scopes: Vec<String> = Vec::new();
        if include_session {
            scopes.push("(scope_type = 'session' AND scope_id = ?2)".into());
        }
        if include_user {
            scopes.push("(scope_type = 'user' AND scope_id = ?3)".into());
        }
        if include_global {
            scopes.push("scope_type = 'global'".into());
        }
        if scopes.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ITEM_COLS} FROM memory_items
             WHERE agent_id = ?1
               AND deleted_at = 0
               AND (expires_at = 0 OR expires_at > ?4)
               AND ({})
             ORDER BY last_seen_at DESC
             LIMIT ?5",
            scopes.join(" OR ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![agent_id, session_key, user_id, now, limit as i64],
            row_to_item,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// BM25-ranked FTS over item content. `match_expr` is a prebuilt FTS5
    /// expression (quoted tokens joined with OR). Tombstoned and expired
    /// rows are filtered after the join.
    pub fn search_items_fts(
        &self,
        match_expr: &str,
        user_id: &str,
        agent_id: &str,
        now: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.id
             FROM memory_items m
             JOIN memory_items_fts f ON m.id = f.rowid
             WHERE memory_items_fts MATCH ?1
               AND m.user_id = ?2 AND m.agent_id = ?3
               AND m.deleted_at = 0
               AND (m.expires_at = 0 OR m.expires_at > ?4)
             ORDER BY rank
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![match_expr, user_id, agent_id, now, limit as i64],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Upsert a co-occurrence edge; weight accumulates on conflict.
    pub fn upsert_memory_link(
        &self,
        from_item_id: i64,
        to_item_id: i64,
        relation: &str,
        weight: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO memory_links (from_item_id, to_item_id, relation, weight)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(from_item_id, to_item_id, relation)
             DO UPDATE SET weight = memory_links.weight + excluded.weight",
            rusqlite::params![from_item_id, to_item_id, relation, weight],
        )?;
        Ok(())
    }

    pub fn count_memory_links(&self, relation: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM memory_links WHERE relation = ?1",
            rusqlite::params![relation],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn count_live_items(&self, user_id: &str, agent_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM memory_items
             WHERE user_id = ?1 AND agent_id = ?2 AND deleted_at = 0",
            rusqlite::params![user_id, agent_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Stored vector for an item, if one exists under any model id.
    pub fn get_embedding(&self, item_id: i64) -> Result<Option<(String, Vec<f32>)>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT model_id, vector FROM embeddings WHERE item_id = ?1",
            rusqlite::params![item_id],
            |row| {
                let model: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((model, blob))
            },
        ) {
            Ok((model, blob)) => Ok(Some((model, blob_to_vec(&blob)))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    /// One row per item; re-embedding under a new model replaces the row.
    pub fn upsert_embedding(&self, item_id: i64, model_id: &str, vector: &[f32]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        conn.execute(
            "INSERT INTO embeddings (item_id, model_id, dim, norm, vector)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(item_id) DO UPDATE SET
                 model_id = excluded.model_id,
                 dim      = excluded.dim,
                 norm     = excluded.norm,
                 vector   = excluded.vector",
            rusqlite::params![
                item_id,
                model_id,
                vector.len() as i64,
                norm as f64,
                vec_to_blob(vector),
            ],
        )?;
        Ok(())
    }
}

const ITEM_COLS: &str = "id, user_id, agent_id, kind, scope_type, scope_id, key, content, \
                         confidence, weight, first_seen_at, last_seen_at, expires_at, \
                         deleted_at, source_event_id, metadata";

/// Transaction-scoped upsert shared by the direct path and the atomic
/// append-event-plus-items path. Keeps the FTS index in sync.
pub(crate) fn upsert_item_tx(
    conn: &Connection,
    item: &ItemUpsert,
    now: i64,
) -> rusqlite::Result<(i64, bool)> {
    let existing: Option<(i64, String, f64)> = conn
        .query_row(
            "SELECT id, content, weight FROM memory_items
             WHERE user_id = ?1 AND agent_id = ?2 AND kind = ?3 AND key = ?4
               AND deleted_at = 0",
            rusqlite::params![
                item.user_id,
                item.agent_id,
                item.kind.to_string(),
                item.key
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .ok();

    match existing {
        Some((id, old_content, old_weight)) => {
            conn.execute(
                "UPDATE memory_items
                 SET content = ?1, confidence = MAX(confidence, ?2),
                     weight = ?3, last_seen_at = ?4, expires_at = ?5,
                     source_event_id = ?6, metadata = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    item.content,
                    item.confidence,
                    old_weight + 1.0,
                    now,
                    item.expires_at,
                    item.source_event_id,
                    serde_json::to_string(&item.metadata).unwrap_or_else(|_| "null".into()),
                    id,
                ],
            )?;
            // Sync FTS: delete old row, insert refreshed content.
            conn.execute(
                "INSERT INTO memory_items_fts(memory_items_fts, rowid, content)
                 VALUES('delete', ?1, ?2)",
                rusqlite::params![id, old_content],
            )?;
            conn.execute(
                "INSERT INTO memory_items_fts(rowid, content) VALUES(?1, ?2)",
                rusqlite::params![id, item.content],
            )?;
            Ok((id, false))
        }
        None => {
            conn.execute(
                "INSERT INTO memory_items
                     (user_id, agent_id, kind, scope_type, scope_id, key, content,
                      confidence, weight, first_seen_at, last_seen_at, expires_at,
                      deleted_at, source_event_id, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9, ?10, 0, ?11, ?12)",
                rusqlite::params![
                    item.user_id,
                    item.agent_id,
                    item.kind.to_string(),
                    item.scope_type.to_string(),
                    item.scope_id,
                    item.key,
                    item.content,
                    item.confidence,
                    now,
                    item.expires_at,
                    item.source_event_id,
                    serde_json::to_string(&item.metadata).unwrap_or_else(|_| "null".into()),
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO memory_items_fts(rowid, content) VALUES(?1, ?2)",
                rusqlite::params![id, item.content],
            )?;
            Ok((id, true))
        }
    }
}

/// f32 slice <-> little-endian byte blob. The store never interprets the
/// payload beyond this framing.
pub(crate) fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub(crate) fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryItem> {
    let kind_str: String = row.get(3)?;
    let scope_str: String = row.get(4)?;
    let metadata_raw: String = row.get(15)?;
    Ok(MemoryItem {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agent_id: row.get(2)?,
        kind: kind_str.parse().unwrap_or(MemoryKind::SemanticFact),
        scope_type: scope_str.parse().unwrap_or(ScopeType::User),
        scope_id: row.get(5)?,
        key: row.get(6)?,
        content: row.get(7)?,
        confidence: row.get(8)?,
        weight: row.get(9)?,
        first_seen_at: row.get(10)?,
        last_seen_at: row.get(11)?,
        expires_at: row.get(12)?,
        deleted_at: row.get(13)?,
        source_event_id: row.get(14)?,
        metadata: json_col(metadata_raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(key: &str, content: &str) -> ItemUpsert {
        ItemUpsert {
            user_id: "u1".into(),
            agent_id: "valet".into(),
            kind: MemoryKind::UserPreference,
            scope_type: ScopeType::User,
            scope_id: "u1".into(),
            key: key.into(),
            content: content.into(),
            confidence: 0.7,
            expires_at: 0,
            source_event_id: "ev1".into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn upsert_is_idempotent_on_key() {
        let store = Store::open_in_memory().unwrap();
        let (id1, inserted1) = store.upsert_memory_item(&upsert("pref:x", "likes tea")).unwrap();
        let (id2, inserted2) = store.upsert_memory_item(&upsert("pref:x", "likes tea")).unwrap();
        assert!(inserted1);
        assert!(!inserted2);
        assert_eq!(id1, id2);
        assert_eq!(store.count_live_items("u1", "valet").unwrap(), 1);

        let item = store.get_memory_item(id1).unwrap().unwrap();
        assert!(item.weight > 0.0, "re-capture bumps weight");
    }

    #[test]
    fn tombstone_hides_from_fts() {
        let store = Store::open_in_memory().unwrap();
        let (id, _) = store
            .upsert_memory_item(&upsert("pref:coffee", "prefers dark roast coffee"))
            .unwrap();

        let hits = store
            .search_items_fts("\"dark\" OR \"roast\"", "u1", "valet", now_ms(), 5)
            .unwrap();
        assert_eq!(hits, vec![id]);

        assert!(store.tombstone_memory_item(id, now_ms()).unwrap());
        let hits = store
            .search_items_fts("\"dark\" OR \"roast\"", "u1", "valet", now_ms(), 5)
            .unwrap();
        assert!(hits.is_empty());

        // Second tombstone is a no-op.
        assert!(!store.tombstone_memory_item(id, now_ms()).unwrap());
    }

    #[test]
    fn embeddings_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let (id, _) = store.upsert_memory_item(&upsert("fact:v", "vector test")).unwrap();
        let vector = vec![0.6f32, 0.8, 0.0];
        store.upsert_embedding(id, "gram-v1-384", &vector).unwrap();
        let (model, loaded) = store.get_embedding(id).unwrap().unwrap();
        assert_eq!(model, "gram-v1-384");
        assert_eq!(loaded, vector);
    }

    #[test]
    fn links_accumulate_weight() {
        let store = Store::open_in_memory().unwrap();
        let (a, _) = store.upsert_memory_item(&upsert("a", "item a")).unwrap();
        let mut b_up = upsert("b", "item b");
        b_up.kind = MemoryKind::SemanticFact;
        let (b, _) = store.upsert_memory_item(&b_up).unwrap();
        store.upsert_memory_link(a, b, "cooccurred_turn", 0.5).unwrap();
        store.upsert_memory_link(a, b, "cooccurred_turn", 0.5).unwrap();
        assert_eq!(store.count_memory_links("cooccurred_turn").unwrap(), 1);
    }
}
