//! Agent core: the LLM provider contract, the tool system, and the
//! tool-calling loop with its circuit-breakers.

pub mod error;
pub mod provider;
pub mod registry;
pub mod tool;
pub mod tool_loop;

pub use error::AgentError;
pub use provider::{
    ChatMessage, ChatResponse, LlmOptions, LlmProvider, ProviderError, Role, ToolCall,
    ToolDefinition,
};
pub use registry::ToolRegistry;
pub use tool::{AsyncCallback, Tool, ToolContext, ToolResult};
pub use tool_loop::{run_tool_loop, StopReason, ToolLoopConfig, ToolLoopOutcome};
