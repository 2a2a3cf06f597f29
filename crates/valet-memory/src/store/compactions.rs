use crate::error::{MemoryError, Result};
use crate::types::{now_ms, Compaction, CompactionStatus, SessionSnapshot};

use super::{json_col, Store};

impl Store {
    /// Open a compaction row in `started` state.
    pub fn insert_compaction(
        &self,
        id: &str,
        session_key: &str,
        source_event_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO session_compactions
                 (id, session_key, started_at, status, source_event_count, checkpoint)
             VALUES (?1, ?2, ?3, 'started', ?4, 'null')",
            rusqlite::params![id, session_key, now_ms(), source_event_count],
        )?;
        Ok(())
    }

    /// Advance the state machine, recording a checkpoint for the phase.
    pub fn transition_compaction(
        &self,
        id: &str,
        status: CompactionStatus,
        checkpoint: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE session_compactions SET status = ?1, checkpoint = ?2 WHERE id = ?3",
            rusqlite::params![status.to_string(), serde_json::to_string(checkpoint)?, id],
        )?;
        Ok(())
    }

    pub fn complete_compaction(
        &self,
        id: &str,
        summary: &str,
        retained_event_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE session_compactions
             SET status = 'completed', completed_at = ?1, summary = ?2,
                 retained_event_count = ?3
             WHERE id = ?4",
            rusqlite::params![now_ms(), summary, retained_event_count, id],
        )?;
        Ok(())
    }

    /// Mark failed, keeping the last checkpoint for diagnostics.
    pub fn fail_compaction(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE session_compactions
             SET status = 'failed', completed_at = ?1, error = ?2
             WHERE id = ?3",
            rusqlite::params![now_ms(), error, id],
        )?;
        Ok(())
    }

    pub fn get_compaction(&self, id: &str) -> Result<Option<Compaction>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, session_key, started_at, completed_at, status,
                    source_event_count, retained_event_count, summary, checkpoint, error
             FROM session_compactions WHERE id = ?1",
            rusqlite::params![id],
            row_to_compaction,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    /// Write the snapshot for `revision = latest + 1`. Older revisions are
    /// retained for rollback. Returns the new revision.
    pub fn insert_snapshot(&self, snapshot: &SessionSnapshot) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM session_snapshots
             WHERE session_key = ?1",
            rusqlite::params![snapshot.session_key],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO session_snapshots
                 (session_key, revision, created_at, facts, preferences, tasks,
                  open_loops, constraints, summary, compaction_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                snapshot.session_key,
                next,
                now_ms(),
                serde_json::to_string(&snapshot.facts)?,
                serde_json::to_string(&snapshot.preferences)?,
                serde_json::to_string(&snapshot.tasks)?,
                serde_json::to_string(&snapshot.open_loops)?,
                serde_json::to_string(&snapshot.constraints)?,
                snapshot.summary,
                snapshot.compaction_id,
            ],
        )?;
        Ok(next)
    }

    pub fn get_latest_snapshot(&self, session_key: &str) -> Result<Option<SessionSnapshot>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT session_key, revision, created_at, facts, preferences, tasks,
                    open_loops, constraints, summary, compaction_id
             FROM session_snapshots
             WHERE session_key = ?1
             ORDER BY revision DESC
             LIMIT 1",
            rusqlite::params![session_key],
            row_to_snapshot,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }
}

fn row_to_compaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Compaction> {
    let status_str: String = row.get(4)?;
    let checkpoint_raw: String = row.get(8)?;
    Ok(Compaction {
        id: row.get(0)?,
        session_key: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        status: status_str.parse().unwrap_or(CompactionStatus::Failed),
        source_event_count: row.get(5)?,
        retained_event_count: row.get(6)?,
        summary: row.get(7)?,
        checkpoint: json_col(checkpoint_raw),
        error: row.get(9)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSnapshot> {
    fn list(raw: String) -> Vec<String> {
        serde_json::from_str(&raw).unwrap_or_default()
    }
    Ok(SessionSnapshot {
        session_key: row.get(0)?,
        revision: row.get(1)?,
        created_at: row.get(2)?,
        facts: list(row.get(3)?),
        preferences: list(row.get(4)?),
        tasks: list(row.get(5)?),
        open_loops: list(row.get(6)?),
        constraints: list(row.get(7)?),
        summary: row.get(8)?,
        compaction_id: row.get(9)?,
    })
}
