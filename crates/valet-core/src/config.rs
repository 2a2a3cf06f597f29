use std::collections::HashMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::secret::resolve_map;

/// Top-level config (valet.toml + VALET_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValetConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

impl Default for ValetConfig {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            memory: MemoryConfig::default(),
            connectors: ConnectorsConfig::default(),
        }
    }
}

impl ValetConfig {
    /// Load config from `path`, layering VALET_* env vars on top.
    ///
    /// Secret references (`env:VAR_NAME`) inside connector headers and env
    /// maps are resolved here, at load time, so the rest of the system only
    /// ever sees plain values.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let mut config: ValetConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VALET_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        for mcp in &mut config.connectors.mcp {
            mcp.headers = resolve_map(&mcp.headers);
            mcp.env = resolve_map(&mcp.env);
        }
        for api in &mut config.connectors.openapi {
            api.headers = resolve_map(&api.headers);
        }
        Ok(config)
    }
}

/// Filesystem layout for persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory for all runtime state.
    #[serde(default = "default_workspace_dir")]
    pub dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
        }
    }
}

impl WorkspaceConfig {
    /// Path of the relational store (`<workspace>/state/memory.db`).
    pub fn db_path(&self) -> PathBuf {
        self.dir.join("state").join("memory.db")
    }
}

/// Tunables for the memory service. Defaults match single-user operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Worker poll interval in milliseconds.
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,
    /// How long a claimed job stays leased before another worker may steal it.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: i64,
    /// Maximum jobs claimed per worker tick.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,
    /// Default prompt-context token budget when the caller passes 0.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Retrieval-cache TTL in seconds.
    #[serde(default = "default_recall_cache_ttl_secs")]
    pub recall_cache_ttl_secs: i64,
    /// Events older than this many days are removed by the retention sweep.
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,
    /// Completed/failed job rows older than this many days are swept.
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: i64,
    /// Embedding model id. Recognised: "gram-v1-384", "token-v1-256".
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            worker_poll_ms: default_worker_poll_ms(),
            lease_ms: default_lease_ms(),
            claim_batch: default_claim_batch(),
            max_context_tokens: default_max_context_tokens(),
            recall_cache_ttl_secs: default_recall_cache_ttl_secs(),
            event_retention_days: default_event_retention_days(),
            audit_retention_days: default_audit_retention_days(),
            embed_model: default_embed_model(),
        }
    }
}

/// Declared remote connectors. Each entry becomes a connector runtime whose
/// tools are registered under `<name>__<tool>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub mcp: Vec<McpConnectorConfig>,
    #[serde(default)]
    pub openapi: Vec<OpenApiConnectorConfig>,
}

/// Transport selection for an MCP connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Stdio,
    StreamableHttp,
}

/// One MCP server the runtime may call tools on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConnectorConfig {
    pub name: String,
    pub transport: McpTransport,
    /// Endpoint URL (streamable_http only).
    #[serde(default)]
    pub url: Option<String>,
    /// Extra request headers (streamable_http only). Values may be `env:VAR`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Command to spawn (stdio only).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the spawned process. Values may be `env:VAR`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    /// In-flight call limit. Defaults to 1 for stdio, 4 for streamable_http.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl McpConnectorConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(match self.transport {
            McpTransport::Stdio => 1,
            McpTransport::StreamableHttp => 4,
        })
    }
}

/// One OpenAPI backend whose operations are exposed as tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenApiConnectorConfig {
    pub name: String,
    /// URL or local path of the JSON spec document.
    pub spec: String,
    pub base_url: String,
    /// Static headers added to every request. Values may be `env:VAR`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_openapi_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".valet")
}

fn default_worker_poll_ms() -> u64 {
    800
}

fn default_lease_ms() -> i64 {
    60_000
}

fn default_claim_batch() -> usize {
    32
}

fn default_max_context_tokens() -> usize {
    8192
}

fn default_recall_cache_ttl_secs() -> i64 {
    45
}

fn default_event_retention_days() -> i64 {
    365
}

fn default_audit_retention_days() -> i64 {
    90
}

fn default_embed_model() -> String {
    "gram-v1-384".to_string()
}

fn default_timeout_s() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_openapi_concurrency() -> usize {
    4
}
