//! MCP connector runtime: concurrency gate, retry, descriptor cache, and
//! the `tools/list` / `tools/call` surface. `McpTool` adapts a remote tool
//! to the local `Tool` trait so connector tools register like any other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use valet_agent::{Tool, ToolContext, ToolResult};
use valet_core::config::{McpConnectorConfig, McpTransport};

use crate::error::{ConnectorError, Result};
use crate::http::HttpTransport;
use crate::retry::{with_retry, RetryPolicy};
use crate::stdio::StdioTransport;

/// One remote tool as reported by `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result of one `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub content: String,
    pub is_error: bool,
}

enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

pub struct McpRuntime {
    name: String,
    transport: Transport,
    /// Gates in-flight calls; default 1 for stdio, 4 for HTTP.
    semaphore: Semaphore,
    retry: RetryPolicy,
    descriptors: Mutex<Option<HashMap<String, ToolDescriptor>>>,
}

impl McpRuntime {
    pub fn new(config: McpConnectorConfig) -> Result<Self> {
        let concurrency = config.effective_concurrency();
        let retry = RetryPolicy {
            max_attempts: config.retry_max_attempts,
            backoff_ms: config.retry_backoff_ms,
        };
        let name = config.name.clone();
        let transport = match config.transport {
            McpTransport::Stdio => Transport::Stdio(StdioTransport::new(config)),
            McpTransport::StreamableHttp => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| ConnectorError::Config("http connector without url".into()))?;
                Transport::Http(HttpTransport::new(
                    url,
                    config.headers.clone(),
                    config.timeout_s,
                )?)
            }
        };
        Ok(Self {
            name,
            transport,
            semaphore: Semaphore::new(concurrency.max(1)),
            retry,
            descriptors: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Liveness probe: forces a `tools/list` round trip.
    pub async fn health(&self, cancel: &CancellationToken) -> Result<()> {
        self.rpc("tools/list", json!({}), cancel).await.map(|_| ())
    }

    /// Descriptors for every remote tool, fetched once and cached.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<ToolDescriptor>> {
        let mut cache = self.descriptors.lock().await;
        if cache.is_none() {
            let result = self.rpc("tools/list", json!({}), cancel).await?;
            let mut map = HashMap::new();
            for tool in result["tools"].as_array().cloned().unwrap_or_default() {
                let Some(name) = tool["name"].as_str() else { continue };
                map.insert(
                    name.to_string(),
                    ToolDescriptor {
                        name: name.to_string(),
                        description: tool["description"].as_str().unwrap_or("").to_string(),
                        input_schema: tool
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({ "type": "object" })),
                    },
                );
            }
            debug!(connector = %self.name, tools = map.len(), "tool descriptors cached");
            *cache = Some(map);
        }
        let mut tools: Vec<ToolDescriptor> =
            cache.as_ref().unwrap().values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    /// Description and JSON schema of one remote tool.
    pub async fn tool_schema(
        &self,
        cancel: &CancellationToken,
        tool_name: &str,
    ) -> Result<(String, Value)> {
        self.list_tools(cancel).await?;
        let cache = self.descriptors.lock().await;
        cache
            .as_ref()
            .and_then(|map| map.get(tool_name))
            .map(|d| (d.description.clone(), d.input_schema.clone()))
            .ok_or_else(|| ConnectorError::UnknownTool(tool_name.to_string()))
    }

    /// `tools/call`. Text content parts are joined with newlines; servers
    /// returning only structured content get it serialized; anything else
    /// falls back to the raw result JSON.
    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        tool_name: &str,
        args: Value,
    ) -> Result<CallOutcome> {
        let result = self
            .rpc(
                "tools/call",
                json!({ "name": tool_name, "arguments": args }),
                cancel,
            )
            .await?;
        Ok(extract_outcome(&result))
    }

    pub async fn close(&self) {
        if let Transport::Stdio(stdio) = &self.transport {
            stdio.close().await;
        }
    }

    async fn rpc(&self, method: &str, params: Value, cancel: &CancellationToken) -> Result<Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ConnectorError::Transport("connector shut down".into()))?;
        with_retry(self.retry, cancel, || {
            let params = params.clone();
            async move {
                match &self.transport {
                    Transport::Stdio(t) => t.call(method, params, cancel).await,
                    Transport::Http(t) => t.call(method, params, cancel).await,
                }
            }
        })
        .await
    }
}

/// Map a `tools/call` result payload to `{content, is_error}`.
fn extract_outcome(result: &Value) -> CallOutcome {
    let is_error = result["isError"].as_bool().unwrap_or(false);

    let texts: Vec<&str> = result["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p["type"] == "text")
                .filter_map(|p| p["text"].as_str())
                .collect()
        })
        .unwrap_or_default();
    if !texts.is_empty() {
        return CallOutcome {
            content: texts.join("\n"),
            is_error,
        };
    }

    if let Some(structured) = result.get("structuredContent") {
        return CallOutcome {
            content: structured.to_string(),
            is_error,
        };
    }

    CallOutcome {
        content: result.to_string(),
        is_error,
    }
}

/// A remote MCP tool registered into the local tool registry. The exposed
/// name is `<connector>__<tool>` so connectors never shadow local tools.
pub struct McpTool {
    runtime: Arc<McpRuntime>,
    qualified_name: String,
    remote_name: String,
    description: String,
    parameters: Value,
}

impl McpTool {
    /// Discover every tool of a runtime, ready for registration.
    pub async fn discover(
        runtime: Arc<McpRuntime>,
        cancel: &CancellationToken,
    ) -> Result<Vec<McpTool>> {
        let descriptors = runtime.list_tools(cancel).await?;
        Ok(descriptors
            .into_iter()
            .map(|d| McpTool {
                qualified_name: format!("{}__{}", runtime.name(), d.name),
                remote_name: d.name,
                description: d.description,
                parameters: d.input_schema,
                runtime: Arc::clone(&runtime),
            })
            .collect())
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        match self.runtime.invoke(&ctx.cancel, &self.remote_name, args).await {
            Ok(outcome) if outcome.is_error => ToolResult::error(outcome.content),
            Ok(outcome) => ToolResult::success(outcome.content),
            Err(e) => {
                warn!(tool = %self.qualified_name, error = %e, "connector call failed");
                ToolResult::error(e.to_string())
            }
        }
    }

    fn close(&self) {
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move { runtime.close().await });
    }
}
