use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Process died, pipe closed, HTTP non-2xx. Retried per policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object from the server. Never retried.
    #[error("mcp rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing desync; the stdio transport resets and re-initializes.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("call timed out after {0}s")]
    Timeout(u64),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("connector misconfigured: {0}")]
    Config(String),
}

impl ConnectorError {
    /// Only transport-level failures are worth retrying; protocol errors
    /// and cancellation are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Transport(_)
                | ConnectorError::Http(_)
                | ConnectorError::Io(_)
                | ConnectorError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
