use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session not found: {key}")]
    SessionNotFound { key: String },

    #[error("continuity unavailable: session has prior turns but no history, summary, or recall")]
    ContinuityUnavailable,

    #[error("memory service is closed")]
    Closed,

    #[error("compaction failed: {0}")]
    Compaction(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
