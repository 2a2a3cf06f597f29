use rusqlite::{Connection, Result};
use tracing::info;

/// Open-time pragmas. WAL keeps concurrent readers off the writer's back;
/// the busy timeout covers the single-writer handoff between the service
/// thread and the worker task.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=3000;",
    )
}

/// Initialise all memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    migrate_provider_state(conn)?;
    create_sessions_table(conn)?;
    create_events_table(conn)?;
    create_memory_items_table(conn)?;
    create_fts_index(conn)?;
    create_memory_links_table(conn)?;
    create_embeddings_table(conn)?;
    create_snapshots_table(conn)?;
    create_compactions_table(conn)?;
    create_retrieval_cache_table(conn)?;
    create_jobs_table(conn)?;
    Ok(())
}

fn create_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_key          TEXT    NOT NULL PRIMARY KEY,
            channel              TEXT    NOT NULL DEFAULT '',
            chat_id              TEXT    NOT NULL DEFAULT '',
            user_id              TEXT    NOT NULL DEFAULT '',
            created_at           INTEGER NOT NULL,
            updated_at           INTEGER NOT NULL,
            message_count        INTEGER NOT NULL DEFAULT 0,
            summary              TEXT    NOT NULL DEFAULT '',
            last_consolidated_at INTEGER NOT NULL DEFAULT 0
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id, updated_at DESC);",
    )
}

fn create_events_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id           TEXT    NOT NULL PRIMARY KEY,
            session_key  TEXT    NOT NULL,
            turn_id      TEXT    NOT NULL,
            seq          INTEGER NOT NULL,
            role         TEXT    NOT NULL,
            content      TEXT    NOT NULL,
            tool_call_id TEXT,
            tool_name    TEXT,
            metadata     TEXT    NOT NULL DEFAULT 'null',
            created_at   INTEGER NOT NULL,
            archived     INTEGER NOT NULL DEFAULT 0
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_events_session
            ON events(session_key, created_at, seq);
        CREATE INDEX IF NOT EXISTS idx_events_turn
            ON events(session_key, turn_id);",
    )
}

fn create_memory_items_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_items (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         TEXT    NOT NULL,
            agent_id        TEXT    NOT NULL,
            kind            TEXT    NOT NULL,
            scope_type      TEXT    NOT NULL,
            scope_id        TEXT    NOT NULL DEFAULT '',
            key             TEXT    NOT NULL,
            content         TEXT    NOT NULL,
            confidence      REAL    NOT NULL DEFAULT 0.5,
            weight          REAL    NOT NULL DEFAULT 0,
            first_seen_at   INTEGER NOT NULL,
            last_seen_at    INTEGER NOT NULL,
            expires_at      INTEGER NOT NULL DEFAULT 0,
            deleted_at      INTEGER NOT NULL DEFAULT 0,
            source_event_id TEXT    NOT NULL DEFAULT '',
            metadata        TEXT    NOT NULL DEFAULT 'null'
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_items_identity
            ON memory_items(user_id, agent_id, kind, key)
            WHERE deleted_at = 0;
        CREATE INDEX IF NOT EXISTS idx_items_scope
            ON memory_items(scope_type, scope_id)
            WHERE deleted_at = 0;",
    )
}

/// FTS5 virtual table over memory item content. content='' external-content
/// form: rows are synced manually on every write and tombstone.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_items_fts
            USING fts5(content, content='memory_items', content_rowid='id');",
    )
}

fn create_memory_links_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_links (
            from_item_id INTEGER NOT NULL,
            to_item_id   INTEGER NOT NULL,
            relation     TEXT    NOT NULL,
            weight       REAL    NOT NULL DEFAULT 0,
            PRIMARY KEY (from_item_id, to_item_id, relation)
        ) STRICT;",
    )
}

fn create_embeddings_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS embeddings (
            item_id  INTEGER NOT NULL PRIMARY KEY,
            model_id TEXT    NOT NULL,
            dim      INTEGER NOT NULL,
            norm     REAL    NOT NULL,
            vector   BLOB    NOT NULL
        ) STRICT;",
    )
}

fn create_snapshots_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS session_snapshots (
            session_key   TEXT    NOT NULL,
            revision      INTEGER NOT NULL,
            created_at    INTEGER NOT NULL,
            facts         TEXT    NOT NULL DEFAULT '[]',
            preferences   TEXT    NOT NULL DEFAULT '[]',
            tasks         TEXT    NOT NULL DEFAULT '[]',
            open_loops    TEXT    NOT NULL DEFAULT '[]',
            constraints   TEXT    NOT NULL DEFAULT '[]',
            summary       TEXT    NOT NULL DEFAULT '',
            compaction_id TEXT    NOT NULL DEFAULT '',
            PRIMARY KEY (session_key, revision)
        ) STRICT;",
    )
}

fn create_compactions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS session_compactions (
            id                   TEXT    NOT NULL PRIMARY KEY,
            session_key          TEXT    NOT NULL,
            started_at           INTEGER NOT NULL,
            completed_at         INTEGER NOT NULL DEFAULT 0,
            status               TEXT    NOT NULL,
            source_event_count   INTEGER NOT NULL DEFAULT 0,
            retained_event_count INTEGER NOT NULL DEFAULT 0,
            summary              TEXT    NOT NULL DEFAULT '',
            checkpoint           TEXT    NOT NULL DEFAULT 'null',
            error                TEXT    NOT NULL DEFAULT ''
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_compactions_session
            ON session_compactions(session_key, started_at DESC);",
    )
}

fn create_retrieval_cache_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS retrieval_cache (
            cache_key   TEXT    NOT NULL PRIMARY KEY,
            result_json TEXT    NOT NULL,
            created_at  INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL
        ) STRICT;",
    )
}

fn create_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            id           TEXT    NOT NULL PRIMARY KEY,
            job_type     TEXT    NOT NULL,
            session_key  TEXT    NOT NULL,
            status       TEXT    NOT NULL DEFAULT 'pending',
            priority     INTEGER NOT NULL DEFAULT 50,
            payload      TEXT    NOT NULL DEFAULT 'null',
            error        TEXT    NOT NULL DEFAULT '',
            run_after    INTEGER NOT NULL DEFAULT 0,
            lease_until  INTEGER NOT NULL DEFAULT 0,
            created_at   INTEGER NOT NULL,
            updated_at   INTEGER NOT NULL,
            completed_at INTEGER NOT NULL DEFAULT 0
        ) STRICT;
        -- Claim query: eligible rows ordered by priority, then age.
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(status, priority, created_at);",
    )
}

/// Rewrite the legacy single-provider `session_provider_state` table into the
/// provider-keyed form. Old shape: `(session_key PRIMARY KEY, state)`. Rows
/// migrate under provider 'default'. Runs before any read is served.
fn migrate_provider_state(conn: &Connection) -> Result<()> {
    let legacy: bool = {
        let mut stmt = conn.prepare(
            "SELECT COUNT(*) FROM pragma_table_info('session_provider_state')
             WHERE name = 'provider'",
        )?;
        let has_provider: i64 = stmt.query_row([], |row| row.get(0))?;
        let mut stmt = conn.prepare(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name = 'session_provider_state'",
        )?;
        let table_exists: i64 = stmt.query_row([], |row| row.get(0))?;
        table_exists > 0 && has_provider == 0
    };

    if legacy {
        info!("migrating legacy session_provider_state table");
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE session_provider_state_new (
                 session_key TEXT NOT NULL,
                 provider    TEXT NOT NULL DEFAULT 'default',
                 state       TEXT NOT NULL,
                 updated_at  INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (session_key, provider)
             );
             INSERT INTO session_provider_state_new (session_key, provider, state)
                 SELECT session_key, 'default', state FROM session_provider_state;
             DROP TABLE session_provider_state;
             ALTER TABLE session_provider_state_new RENAME TO session_provider_state;
             COMMIT;",
        )?;
    } else {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_provider_state (
                session_key TEXT NOT NULL,
                provider    TEXT NOT NULL DEFAULT 'default',
                state       TEXT NOT NULL,
                updated_at  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (session_key, provider)
            );",
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn legacy_provider_state_migrates() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE session_provider_state (
                 session_key TEXT NOT NULL PRIMARY KEY,
                 state       TEXT NOT NULL
             );
             INSERT INTO session_provider_state VALUES ('cli:1', '{\"cursor\":3}');",
        )
        .unwrap();

        init_db(&conn).unwrap();

        let (provider, state): (String, String) = conn
            .query_row(
                "SELECT provider, state FROM session_provider_state WHERE session_key = 'cli:1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(provider, "default");
        assert_eq!(state, "{\"cursor\":3}");
    }
}
