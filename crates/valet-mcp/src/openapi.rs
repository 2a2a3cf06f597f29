//! OpenAPI connector runtime: compile a JSON spec into an operation table
//! once, then dispatch `invoke(operation_id, args)` as plain HTTP calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use valet_agent::{Tool, ToolContext, ToolResult};
use valet_core::config::OpenApiConnectorConfig;

use crate::error::{ConnectorError, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::runtime::CallOutcome;

/// `$ref` chains deeper than this indicate a pathological spec.
const MAX_REF_DEPTH: usize = 12;
/// Response bodies are capped at this many bytes before formatting.
const MAX_RESPONSE_BYTES: usize = 512 * 1024;

const HTTP_METHODS: [&str; 7] = ["get", "put", "post", "delete", "options", "head", "patch"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    location: ParamLocation,
    required: bool,
}

#[derive(Debug, Clone)]
struct Operation {
    operation_id: String,
    method: String,
    path: String,
    summary: String,
    params: Vec<ParamSpec>,
    has_body: bool,
}

struct CompiledSpec {
    /// sha256 of the spec document plus the base URL.
    cache_key: String,
    operations: HashMap<String, Operation>,
}

pub struct OpenApiRuntime {
    config: OpenApiConnectorConfig,
    client: reqwest::Client,
    semaphore: Semaphore,
    retry: RetryPolicy,
    compiled: Mutex<Option<Arc<CompiledSpec>>>,
}

impl OpenApiRuntime {
    pub fn new(config: OpenApiConnectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_s))
            .build()?;
        Ok(Self {
            semaphore: Semaphore::new(config.max_concurrency.max(1)),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                backoff_ms: config.retry_backoff_ms,
            },
            client,
            config,
            compiled: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// sha256 of spec document + base URL; `None` until the first call
    /// compiled the spec.
    pub async fn spec_fingerprint(&self) -> Option<String> {
        self.compiled
            .lock()
            .await
            .as_ref()
            .map(|c| c.cache_key.clone())
    }

    /// Operation ids with their summaries, compiling the spec on first use.
    pub async fn list_operations(&self, cancel: &CancellationToken) -> Result<Vec<(String, String)>> {
        let compiled = self.compiled_spec(cancel).await?;
        let mut ops: Vec<(String, String)> = compiled
            .operations
            .values()
            .map(|op| (op.operation_id.clone(), op.summary.clone()))
            .collect();
        ops.sort();
        Ok(ops)
    }

    /// Dispatch one operation. HTTP statuses are never errors at this
    /// level: they format into the outcome text, with `is_error` set for
    /// 4xx/5xx so the LLM can react.
    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        operation_id: &str,
        args: Value,
    ) -> Result<CallOutcome> {
        let compiled = self.compiled_spec(cancel).await?;
        let op = compiled
            .operations
            .get(operation_id)
            .ok_or_else(|| ConnectorError::UnknownOperation(operation_id.to_string()))?;

        let request = self.build_request(op, &args)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ConnectorError::Transport("connector shut down".into()))?;

        let response = with_retry(self.retry, cancel, || {
            let request = request.try_clone();
            async move {
                let request = request
                    .ok_or_else(|| ConnectorError::Config("request body not cloneable".into()))?;
                tokio::select! {
                    r = request.send() => r.map_err(ConnectorError::Http),
                    _ = cancel.cancelled() => Err(ConnectorError::Cancelled),
                }
            }
        })
        .await?;

        let status = response.status().as_u16();
        let body_bytes = response.bytes().await.unwrap_or_default();
        let capped = &body_bytes[..body_bytes.len().min(MAX_RESPONSE_BYTES)];
        let body = String::from_utf8_lossy(capped);

        if status >= 400 {
            Ok(CallOutcome {
                content: format!("OpenAPI request failed ({status}): {body}"),
                is_error: true,
            })
        } else {
            Ok(CallOutcome {
                content: format!("OpenAPI response ({status}): {body}"),
                is_error: false,
            })
        }
    }

    fn build_request(&self, op: &Operation, args: &Value) -> Result<reqwest::RequestBuilder> {
        let mut path = op.path.clone();
        let mut query: Vec<(String, String)> = Vec::new();
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut cookies: Vec<String> = Vec::new();
        let mut consumed: Vec<&str> = Vec::new();

        for param in &op.params {
            let value = args.get(&param.name);
            let Some(value) = value else {
                if param.required {
                    return Err(ConnectorError::Config(format!(
                        "operation {} requires parameter '{}'",
                        op.operation_id, param.name
                    )));
                }
                continue;
            };
            let rendered = render_param(value);
            consumed.push(param.name.as_str());
            match param.location {
                ParamLocation::Path => {
                    path = path.replace(
                        &format!("{{{}}}", param.name),
                        &urlencoding::encode(&rendered),
                    );
                }
                ParamLocation::Query => query.push((param.name.clone(), rendered)),
                ParamLocation::Header => headers.push((param.name.clone(), rendered)),
                ParamLocation::Cookie => cookies.push(format!("{}={rendered}", param.name)),
            }
        }

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let method = reqwest::Method::from_bytes(op.method.to_uppercase().as_bytes())
            .map_err(|_| ConnectorError::Config(format!("bad method {}", op.method)))?;
        let mut request = self.client.request(method, &url);

        if !query.is_empty() {
            request = request.query(&query);
        }
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if !cookies.is_empty() {
            request = request.header("Cookie", cookies.join("; "));
        }

        if op.has_body {
            // Body: the explicit "body" argument, or every arg no parameter
            // consumed.
            let body = match args.get("body") {
                Some(body) => body.clone(),
                None => match args {
                    Value::Object(map) => Value::Object(
                        map.iter()
                            .filter(|(k, _)| !consumed.contains(&k.as_str()) && k != &"body")
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    ),
                    other => other.clone(),
                },
            };
            request = request
                .header("Content-Type", "application/json")
                .body(serde_json::to_vec(&body)?);
        }
        Ok(request)
    }

    async fn compiled_spec(&self, cancel: &CancellationToken) -> Result<Arc<CompiledSpec>> {
        let mut cache = self.compiled.lock().await;
        if let Some(compiled) = cache.as_ref() {
            return Ok(Arc::clone(compiled));
        }

        let raw = self.fetch_spec(cancel).await?;
        let doc: Value = serde_json::from_str(&raw)?;

        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        hasher.update(self.config.base_url.as_bytes());
        let cache_key = hex::encode(hasher.finalize());

        let operations = compile_operations(&doc)?;
        debug!(
            connector = %self.config.name,
            operations = operations.len(),
            cache_key = %&cache_key[..12],
            "openapi spec compiled"
        );
        let compiled = Arc::new(CompiledSpec {
            cache_key,
            operations,
        });
        *cache = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    async fn fetch_spec(&self, cancel: &CancellationToken) -> Result<String> {
        if self.config.spec.starts_with("http://") || self.config.spec.starts_with("https://") {
            let response = tokio::select! {
                r = self.client.get(&self.config.spec).send() => r?,
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
            };
            if !response.status().is_success() {
                return Err(ConnectorError::Transport(format!(
                    "spec fetch returned {}",
                    response.status()
                )));
            }
            Ok(response.text().await?)
        } else {
            Ok(tokio::fs::read_to_string(&self.config.spec).await?)
        }
    }
}

fn render_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk `paths` and build the operation table, resolving `$ref` pointers as
/// they are encountered.
fn compile_operations(doc: &Value) -> Result<HashMap<String, Operation>> {
    let mut operations = HashMap::new();
    let Some(paths) = doc["paths"].as_object() else {
        return Err(ConnectorError::Config("spec has no paths object".into()));
    };

    for (path, item) in paths {
        let item = resolve_ref(doc, item, 0)?;
        let shared_params = item["parameters"].as_array().cloned().unwrap_or_default();

        for method in HTTP_METHODS {
            let op_value = &item[method];
            if op_value.is_null() {
                continue;
            }
            let op_value = resolve_ref(doc, op_value, 0)?;
            let Some(operation_id) = op_value["operationId"].as_str() else {
                warn!(path, method, "operation without operationId skipped");
                continue;
            };

            let mut params = Vec::new();
            let own_params = op_value["parameters"].as_array().cloned().unwrap_or_default();
            for raw in shared_params.iter().chain(own_params.iter()) {
                let resolved = resolve_ref(doc, raw, 0)?;
                let Some(name) = resolved["name"].as_str() else { continue };
                let location = match resolved["in"].as_str() {
                    Some("path") => ParamLocation::Path,
                    Some("query") => ParamLocation::Query,
                    Some("header") => ParamLocation::Header,
                    Some("cookie") => ParamLocation::Cookie,
                    _ => continue,
                };
                params.push(ParamSpec {
                    name: name.to_string(),
                    location,
                    // Path parameters are always required in OpenAPI.
                    required: resolved["required"].as_bool().unwrap_or(false)
                        || location == ParamLocation::Path,
                });
            }

            operations.insert(
                operation_id.to_string(),
                Operation {
                    operation_id: operation_id.to_string(),
                    method: method.to_string(),
                    path: path.clone(),
                    summary: op_value["summary"].as_str().unwrap_or("").to_string(),
                    params,
                    has_body: !op_value["requestBody"].is_null(),
                },
            );
        }
    }
    Ok(operations)
}

/// Follow `{"$ref": "#/..."}` pointers, up to `MAX_REF_DEPTH` levels.
fn resolve_ref(doc: &Value, value: &Value, depth: usize) -> Result<Value> {
    let Some(reference) = value.get("$ref").and_then(Value::as_str) else {
        return Ok(value.clone());
    };
    if depth >= MAX_REF_DEPTH {
        return Err(ConnectorError::Config(format!(
            "$ref chain deeper than {MAX_REF_DEPTH}: {reference}"
        )));
    }
    let Some(pointer) = reference.strip_prefix('#') else {
        return Err(ConnectorError::Config(format!(
            "external $ref not supported: {reference}"
        )));
    };
    let target = doc
        .pointer(pointer)
        .ok_or_else(|| ConnectorError::Config(format!("dangling $ref: {reference}")))?;
    resolve_ref(doc, target, depth + 1)
}

/// One OpenAPI operation registered as a local tool.
pub struct OpenApiTool {
    runtime: Arc<OpenApiRuntime>,
    qualified_name: String,
    operation_id: String,
    description: String,
}

impl OpenApiTool {
    pub async fn discover(
        runtime: Arc<OpenApiRuntime>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OpenApiTool>> {
        let ops = runtime.list_operations(cancel).await?;
        Ok(ops
            .into_iter()
            .map(|(operation_id, summary)| OpenApiTool {
                qualified_name: format!("{}__{}", runtime.name(), operation_id),
                description: if summary.is_empty() {
                    format!("Invoke the {operation_id} API operation")
                } else {
                    summary
                },
                operation_id,
                runtime: Arc::clone(&runtime),
            })
            .collect())
    }
}

#[async_trait]
impl Tool for OpenApiTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        // Operation arguments pass through as-is; the remote API validates.
        json!({ "type": "object", "additionalProperties": true })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        match self.runtime.invoke(&ctx.cancel, &self.operation_id, args).await {
            Ok(outcome) if outcome.is_error => ToolResult::error(outcome.content),
            Ok(outcome) => ToolResult::success(outcome.content),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn petstore() -> Value {
        json!({
            "openapi": "3.1.0",
            "paths": {
                "/pets/{petId}": {
                    "get": {
                        "operationId": "getPet",
                        "summary": "Fetch one pet",
                        "parameters": [
                            { "$ref": "#/components/parameters/PetId" },
                            { "name": "verbose", "in": "query", "required": false }
                        ]
                    }
                },
                "/pets": {
                    "post": {
                        "operationId": "createPet",
                        "requestBody": { "content": {} }
                    }
                }
            },
            "components": {
                "parameters": {
                    "PetId": { "name": "petId", "in": "path", "required": true }
                }
            }
        })
    }

    #[test]
    fn operations_compile_with_resolved_refs() {
        let ops = compile_operations(&petstore()).unwrap();
        assert_eq!(ops.len(), 2);

        let get_pet = &ops["getPet"];
        assert_eq!(get_pet.method, "get");
        assert_eq!(get_pet.path, "/pets/{petId}");
        assert_eq!(get_pet.params.len(), 2);
        let pet_id = get_pet.params.iter().find(|p| p.name == "petId").unwrap();
        assert!(pet_id.required);
        assert_eq!(pet_id.location, ParamLocation::Path);

        assert!(ops["createPet"].has_body);
        assert!(!get_pet.has_body);
    }

    #[test]
    fn ref_cycles_are_bounded() {
        let doc = json!({
            "paths": {},
            "components": { "a": { "$ref": "#/components/b" }, "b": { "$ref": "#/components/a" } }
        });
        let a = &doc["components"]["a"];
        assert!(matches!(
            resolve_ref(&doc, a, 0),
            Err(ConnectorError::Config(_))
        ));
    }

    #[test]
    fn dangling_ref_is_an_error() {
        let doc = json!({ "paths": {} });
        let value = json!({ "$ref": "#/components/missing" });
        assert!(resolve_ref(&doc, &value, 0).is_err());
    }
}
