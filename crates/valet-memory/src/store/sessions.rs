use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::types::{now_ms, Session};

use super::Store;

impl Store {
    /// Upsert the session record. Existing non-empty channel/chat_id/user_id
    /// values are never overwritten by later ensures.
    pub fn ensure_session(
        &self,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Session> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "INSERT INTO sessions (session_key, channel, chat_id, user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(session_key) DO UPDATE SET
                 channel    = CASE WHEN sessions.channel    = '' THEN excluded.channel    ELSE sessions.channel    END,
                 chat_id    = CASE WHEN sessions.chat_id    = '' THEN excluded.chat_id    ELSE sessions.chat_id    END,
                 user_id    = CASE WHEN sessions.user_id    = '' THEN excluded.user_id    ELSE sessions.user_id    END,
                 updated_at = excluded.updated_at",
            rusqlite::params![session_key, channel, chat_id, user_id, now],
        )?;
        debug!(session_key, "session ensured");
        self.get_session_locked(&conn, session_key)?
            .ok_or_else(|| MemoryError::SessionNotFound {
                key: session_key.to_string(),
            })
    }

    pub fn get_session(&self, session_key: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        self.get_session_locked(&conn, session_key)
    }

    pub fn get_session_summary(&self, session_key: &str) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT summary FROM sessions WHERE session_key = ?1",
            rusqlite::params![session_key],
            |row| row.get(0),
        ) {
            Ok(s) => Ok(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(String::new()),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    pub fn set_session_summary(&self, session_key: &str, summary: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sessions SET summary = ?1, updated_at = ?2 WHERE session_key = ?3",
            rusqlite::params![summary, now_ms(), session_key],
        )?;
        if changed == 0 {
            return Err(MemoryError::SessionNotFound {
                key: session_key.to_string(),
            });
        }
        Ok(())
    }

    pub fn mark_session_consolidated(&self, session_key: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET last_consolidated_at = ?1, updated_at = ?1
             WHERE session_key = ?2",
            rusqlite::params![at, session_key],
        )?;
        Ok(())
    }

    /// Most-recently-updated sessions for a user, newest first.
    pub fn list_sessions_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_key, channel, chat_id, user_id, created_at, updated_at,
                    message_count, summary, last_consolidated_at
             FROM sessions
             WHERE user_id = ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, limit as i64], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn get_session_locked(
        &self,
        conn: &rusqlite::Connection,
        session_key: &str,
    ) -> Result<Option<Session>> {
        match conn.query_row(
            "SELECT session_key, channel, chat_id, user_id, created_at, updated_at,
                    message_count, summary, last_consolidated_at
             FROM sessions WHERE session_key = ?1",
            rusqlite::params![session_key],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_key: row.get(0)?,
        channel: row.get(1)?,
        chat_id: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        message_count: row.get(6)?,
        summary: row.get(7)?,
        last_consolidated_at: row.get(8)?,
    })
}
