//! Persistence layer: sessions, events, memory items, snapshots,
//! compactions, retrieval cache, and the leased job queue.
//!
//! Single writer process; concurrent readers are fine. All multi-statement
//! writes (event append + session bump, compaction transitions) run inside
//! one SQLite transaction.

mod cache;
mod compactions;
mod events;
mod items;
mod jobs;
mod sessions;

pub use items::ItemUpsert;
pub use jobs::job_id;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::db;
use crate::error::Result;
use crate::types::now_ms;

/// Thread-safe handle over the single SQLite connection.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path`, applying pragmas and running
    /// schema init + legacy migrations before any read is served.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            // Startup wiring failure is fatal for the caller; surface it.
            std::fs::create_dir_all(parent).map_err(|e| {
                rusqlite::Error::InvalidPath(format!("{}: {e}", parent.display()).into())
            })?;
        }
        let conn = Connection::open(path)?;
        db::apply_pragmas(&conn)?;
        db::init_db(&conn)?;
        info!(path = %path.display(), "memory store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for unit tests. Same schema, no file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Delete events past the event-retention horizon and audit rows
    /// (finished jobs, expired cache entries, old compaction rows) past the
    /// audit horizon. Deletion runs in bounded batches so a neglected store
    /// cannot stall the worker tick.
    pub fn sweep_retention(
        &self,
        event_cutoff: i64,
        audit_cutoff: i64,
        batch: usize,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();

        let events = conn.execute(
            "DELETE FROM events WHERE id IN (
                 SELECT id FROM events WHERE created_at < ?1 LIMIT ?2
             )",
            rusqlite::params![event_cutoff, batch as i64],
        )?;
        let jobs = conn.execute(
            "DELETE FROM jobs WHERE id IN (
                 SELECT id FROM jobs
                 WHERE status IN ('completed', 'failed') AND updated_at < ?1
                 LIMIT ?2
             )",
            rusqlite::params![audit_cutoff, batch as i64],
        )?;
        let compactions = conn.execute(
            "DELETE FROM session_compactions WHERE id IN (
                 SELECT id FROM session_compactions
                 WHERE status IN ('completed', 'failed') AND started_at < ?1
                 LIMIT ?2
             )",
            rusqlite::params![audit_cutoff, batch as i64],
        )?;
        let cache = conn.execute(
            "DELETE FROM retrieval_cache WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;

        let total = events + jobs + compactions + cache;
        if total > 0 {
            debug!(events, jobs, compactions, cache, "retention sweep");
        }
        Ok(total)
    }
}

/// Parse a JSON text column, treating corrupt data as null rather than
/// failing the whole row read.
pub(crate) fn json_col(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, EventRole};

    #[test]
    fn sweep_deletes_old_events_and_finished_jobs() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_session("cli:sweep", "cli", "sweep", "u1").unwrap();

        let mut ev = Event::new("cli:sweep", EventRole::User, "ancient history");
        ev.id = "ev-old".into();
        ev.turn_id = "t-old".into();
        ev.created_at = 1_000;
        store.append_event(&ev).unwrap();

        let removed = store.sweep_retention(2_000, 2_000, 100).unwrap();
        assert!(removed >= 1);
        assert!(store.list_recent_events("cli:sweep", 10).unwrap().is_empty());
    }
}
