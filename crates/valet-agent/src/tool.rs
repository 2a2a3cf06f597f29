//! The tool contract. Tools read per-call state (channel, chat, async
//! completion callback) from `ToolContext` rather than from fields on the
//! shared instance, so concurrent calls never interfere.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Callback an async tool invokes once its deferred work finishes. The
/// channel layer routes the text back to the originating chat.
pub type AsyncCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Per-call ambient state, built fresh for each dispatch.
#[derive(Clone)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    /// Present when the host supports deferred tool completion.
    pub async_callback: Option<AsyncCallback>,
    /// Cancelled when the caller's turn is abandoned.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            async_callback: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_async_callback(mut self, callback: AsyncCallback) -> Self {
        self.async_callback = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "read_file").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn parameters(&self) -> serde_json::Value;
    /// Execute the tool with the given input.
    async fn execute(&self, ctx: &ToolContext, args: serde_json::Value) -> ToolResult;

    /// Whether the tool completes out-of-band via `ctx.async_callback`.
    /// Such tools return an acknowledgement from `execute` immediately.
    fn is_async(&self) -> bool {
        false
    }

    /// Release held resources on shutdown (processes, pipes, sockets).
    fn close(&self) {}
}
