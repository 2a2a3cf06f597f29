//! Central registry holding all available tools.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::provider::{ToolCall, ToolDefinition};
use crate::tool::{Tool, ToolContext, ToolResult};

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. A second registration under the same name is a
    /// wiring bug and is rejected rather than silently replacing.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let mut tools = self.tools.write().unwrap();
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            return Err(AgentError::DuplicateTool { name });
        }
        debug!(tool = %name, "tool registered");
        tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for all registered tools, sorted by name so the emitted
    /// tool list is stable across runs.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap();
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Dispatch one tool call under the per-call context. An unknown tool
    /// comes back as an error tool-result for the LLM, never a panic or an
    /// exception to the channel.
    pub async fn dispatch(&self, ctx: &ToolContext, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            return ToolResult::error(format!("unknown tool: {}", call.name));
        };
        debug!(
            tool = %call.name,
            channel = %ctx.channel,
            args = %sanitize_args(&call.arguments),
            "executing tool"
        );
        tool.execute(ctx, call.arguments.clone()).await
    }

    /// Release resources of every closable tool. Called on shutdown.
    pub fn close_all(&self) {
        for tool in self.tools.read().unwrap().values() {
            tool.close();
        }
    }
}

/// Render arguments for logging with secret-looking values redacted.
pub fn sanitize_args(args: &serde_json::Value) -> String {
    fn scrub(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        if secret_key_re().is_match(k) {
                            (k.clone(), serde_json::Value::String("[redacted]".into()))
                        } else {
                            (k.clone(), scrub(v))
                        }
                    })
                    .collect(),
            ),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(scrub).collect())
            }
            other => other.clone(),
        }
    }
    scrub(args).to_string()
}

fn secret_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(token|secret|password|passphrase|api[_-]?key|authorization)").unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, _ctx: &ToolContext, args: serde_json::Value) -> ToolResult {
            match args.get("text").and_then(|v| v.as_str()) {
                Some(text) => ToolResult::success(text),
                None => ToolResult::error("missing required field 'text'"),
            }
        }
    }

    #[tokio::test]
    async fn dispatch_routes_and_rejects_unknown() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();

        let ctx = ToolContext::new("cli", "42");
        let ok = registry
            .dispatch(
                &ctx,
                &ToolCall {
                    id: "c1".into(),
                    name: "echo".into(),
                    arguments: serde_json::json!({ "text": "hello" }),
                },
            )
            .await;
        assert!(!ok.is_error);
        assert_eq!(ok.content, "hello");

        let missing = registry
            .dispatch(
                &ctx,
                &ToolCall {
                    id: "c2".into(),
                    name: "nope".into(),
                    arguments: serde_json::json!({}),
                },
            )
            .await;
        assert!(missing.is_error);
        assert!(missing.content.contains("unknown tool"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(EchoTool)),
            Err(AgentError::DuplicateTool { .. })
        ));
    }

    #[test]
    fn definitions_are_sorted_and_complete() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert!(defs[0].parameters["required"][0] == "text");
    }

    struct SlowNotifyTool;

    #[async_trait]
    impl Tool for SlowNotifyTool {
        fn name(&self) -> &str {
            "slow_notify"
        }
        fn description(&self) -> &str {
            "Acknowledge now, deliver the real result via the async callback"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }
        fn is_async(&self) -> bool {
            true
        }
        async fn execute(&self, ctx: &ToolContext, _args: serde_json::Value) -> ToolResult {
            if let Some(callback) = ctx.async_callback.clone() {
                tokio::spawn(async move {
                    callback("deferred result".to_string());
                });
            }
            ToolResult::success("working on it")
        }
    }

    #[tokio::test]
    async fn async_tool_acknowledges_and_calls_back() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowNotifyTool)).unwrap();
        assert!(registry.get("slow_notify").unwrap().is_async());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let ctx = ToolContext::new("discord", "99")
            .with_async_callback(Arc::new(move |text| {
                let _ = tx.send(text);
            }));

        let ack = registry
            .dispatch(
                &ctx,
                &ToolCall {
                    id: "c9".into(),
                    name: "slow_notify".into(),
                    arguments: serde_json::json!({}),
                },
            )
            .await;
        assert_eq!(ack.content, "working on it");
        assert_eq!(rx.recv().await.unwrap(), "deferred result");
    }

    #[test]
    fn sanitized_logging_redacts_secrets() {
        let rendered = sanitize_args(&serde_json::json!({
            "query": "coffee",
            "api_key": "sk-live-abcdef",
            "nested": { "authorization": "Bearer xyz" }
        }));
        assert!(rendered.contains("coffee"));
        assert!(!rendered.contains("sk-live-abcdef"));
        assert!(!rendered.contains("Bearer xyz"));
        assert!(rendered.contains("[redacted]"));
    }
}
