use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;
use crate::types::{now_ms, Event, EventRole};

use super::items::{upsert_item_tx, ItemUpsert};
use super::{json_col, Store};

impl Store {
    /// Append one event and bump the owning session's message_count in a
    /// single transaction. A reader never sees the bump without the event.
    pub fn append_event(&self, event: &Event) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        insert_event_tx(&tx, event)?;
        bump_session_tx(&tx, &event.session_key)?;
        tx.commit()?;
        debug!(event_id = %event.id, session = %event.session_key, "event appended");
        Ok(())
    }

    /// Append the event and apply derived memory upserts atomically.
    /// Returns how many memory items were written (inserted or refreshed).
    pub fn append_event_and_upsert_items(
        &self,
        event: &Event,
        items: &[ItemUpsert],
    ) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let now = now_ms();
        let tx = conn.transaction()?;
        insert_event_tx(&tx, event)?;
        bump_session_tx(&tx, &event.session_key)?;
        let mut applied = 0usize;
        for item in items {
            upsert_item_tx(&tx, item, now)?;
            applied += 1;
        }
        tx.commit()?;
        Ok(applied)
    }

    /// Most recent `limit` non-archived events, oldest first. The result is
    /// a suffix of the session log in `(created_at, seq)` order.
    pub fn list_recent_events(&self, session_key: &str, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_key, turn_id, seq, role, content, tool_call_id,
                    tool_name, metadata, created_at, archived
             FROM events
             WHERE session_key = ?1 AND archived = 0
             ORDER BY created_at DESC, seq DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_key, limit as i64], row_to_event)?;
        let mut events: Vec<Event> = rows.filter_map(|r| r.ok()).collect();
        events.reverse();
        Ok(events)
    }

    /// Events of one turn in `seq` order, capped at `limit`.
    pub fn list_turn_events(
        &self,
        session_key: &str,
        turn_id: &str,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_key, turn_id, seq, role, content, tool_call_id,
                    tool_name, metadata, created_at, archived
             FROM events
             WHERE session_key = ?1 AND turn_id = ?2
             ORDER BY created_at, seq
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![session_key, turn_id, limit as i64],
            row_to_event,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_active_events(&self, session_key: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE session_key = ?1 AND archived = 0",
            rusqlite::params![session_key],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Archive every non-archived event whose turn is NOT in `keep`.
    /// One bulk flag flip; returns the number of archived events.
    pub fn archive_events_outside_turns(
        &self,
        session_key: &str,
        keep: &[String],
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        if keep.is_empty() {
            let n = conn.execute(
                "UPDATE events SET archived = 1 WHERE session_key = ?1 AND archived = 0",
                rusqlite::params![session_key],
            )?;
            return Ok(n);
        }
        let placeholders: Vec<String> = (0..keep.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "UPDATE events SET archived = 1
             WHERE session_key = ?1 AND archived = 0 AND turn_id NOT IN ({})",
            placeholders.join(", ")
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&session_key];
        for turn in keep {
            params.push(turn);
        }
        let n = conn.execute(&sql, params.as_slice())?;
        Ok(n)
    }

    /// Fallback strategy for single-turn sessions: archive the oldest `n`
    /// non-archived events regardless of turn grouping.
    pub fn archive_oldest_events(&self, session_key: &str, n: usize) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE events SET archived = 1
             WHERE id IN (
                 SELECT id FROM events
                 WHERE session_key = ?1 AND archived = 0
                 ORDER BY created_at, seq
                 LIMIT ?2
             )",
            rusqlite::params![session_key, n as i64],
        )?;
        Ok(changed)
    }
}

fn insert_event_tx(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO events
             (id, session_key, turn_id, seq, role, content, tool_call_id,
              tool_name, metadata, created_at, archived)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
        rusqlite::params![
            event.id,
            event.session_key,
            event.turn_id,
            event.seq,
            event.role.to_string(),
            event.content,
            event.tool_call_id,
            event.tool_name,
            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "null".into()),
            event.created_at,
        ],
    )?;
    Ok(())
}

fn bump_session_tx(conn: &Connection, session_key: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sessions
         SET message_count = message_count + 1, updated_at = ?1
         WHERE session_key = ?2",
        rusqlite::params![now_ms(), session_key],
    )?;
    Ok(())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let role_str: String = row.get(4)?;
    let metadata_raw: String = row.get(8)?;
    Ok(Event {
        id: row.get(0)?,
        session_key: row.get(1)?,
        turn_id: row.get(2)?,
        seq: row.get(3)?,
        role: role_str.parse().unwrap_or(EventRole::System),
        content: row.get(5)?,
        tool_call_id: row.get(6)?,
        tool_name: row.get(7)?,
        metadata: json_col(metadata_raw),
        created_at: row.get(9)?,
        archived: row.get::<_, i64>(10)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session: &str, id: &str, turn: &str, seq: i64, at: i64) -> Event {
        let mut ev = Event::new(session, EventRole::User, &format!("content {id}"));
        ev.id = id.into();
        ev.turn_id = turn.into();
        ev.seq = seq;
        ev.created_at = at;
        ev
    }

    #[test]
    fn append_bumps_message_count_atomically() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_session("cli:1", "cli", "1", "u1").unwrap();
        store.append_event(&event("cli:1", "e1", "t1", 0, 10)).unwrap();
        store.append_event(&event("cli:1", "e2", "t1", 1, 11)).unwrap();
        let session = store.get_session("cli:1").unwrap().unwrap();
        assert_eq!(session.message_count, 2);
    }

    #[test]
    fn recent_events_are_an_ordered_suffix() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_session("cli:2", "cli", "2", "u1").unwrap();
        for i in 0..5 {
            store
                .append_event(&event("cli:2", &format!("e{i}"), "t1", i, 100 + i))
                .unwrap();
        }
        let recent = store.list_recent_events("cli:2", 3).unwrap();
        let ids: Vec<&str> = recent.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn archive_outside_turns_is_single_flip() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_session("cli:3", "cli", "3", "u1").unwrap();
        store.append_event(&event("cli:3", "a", "old", 0, 1)).unwrap();
        store.append_event(&event("cli:3", "b", "old", 1, 2)).unwrap();
        store.append_event(&event("cli:3", "c", "new", 0, 3)).unwrap();

        let archived = store
            .archive_events_outside_turns("cli:3", &["new".to_string()])
            .unwrap();
        assert_eq!(archived, 2);
        let remaining = store.list_recent_events("cli:3", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "c");

        // Second pass archives nothing: the flag flips at most once.
        let again = store
            .archive_events_outside_turns("cli:3", &["new".to_string()])
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn archive_oldest_fallback() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_session("cli:4", "cli", "4", "u1").unwrap();
        for i in 0..6 {
            store
                .append_event(&event("cli:4", &format!("e{i}"), "single-turn", i, 50 + i))
                .unwrap();
        }
        let archived = store.archive_oldest_events("cli:4", 4).unwrap();
        assert_eq!(archived, 4);
        let remaining = store.list_recent_events("cli:4", 10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, "e4");
    }
}
