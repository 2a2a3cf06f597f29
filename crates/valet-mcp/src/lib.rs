//! Connector runtimes: remote tools over MCP (JSON-RPC 2.0 on framed stdio
//! or streamable HTTP) and OpenAPI operation dispatch, behind a shared
//! concurrency gate and retry policy.

pub mod error;
pub mod http;
pub mod openapi;
pub mod retry;
pub mod rpc;
pub mod runtime;
pub mod stdio;

pub use error::ConnectorError;
pub use openapi::{OpenApiRuntime, OpenApiTool};
pub use retry::{with_retry, RetryPolicy};
pub use runtime::{CallOutcome, McpRuntime, McpTool, ToolDescriptor};
