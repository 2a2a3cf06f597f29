//! Streamable HTTP transport: JSON-RPC requests POSTed to one endpoint,
//! session continuity carried in the `Mcp-Session-Id` header.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectorError, Result};
use crate::rpc;

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    timeout_s: u64,
    session_id: Mutex<Option<String>>,
    initialized: Mutex<bool>,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(url: &str, headers: HashMap<String, String>, timeout_s: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            headers,
            timeout_s,
            session_id: Mutex::new(None),
            initialized: Mutex::new(false),
            next_id: AtomicI64::new(1),
        })
    }

    /// One JSON-RPC round trip; the initialize handshake runs lazily before
    /// the first real call.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.ensure_initialized(cancel).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .post(rpc::request(id, method, params), cancel)
            .await?;
        rpc::unwrap_response(response)
    }

    async fn ensure_initialized(&self, cancel: &CancellationToken) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .post(
                rpc::request(
                    id,
                    "initialize",
                    rpc::initialize_params("valet", env!("CARGO_PKG_VERSION")),
                ),
                cancel,
            )
            .await?;
        rpc::unwrap_response(response)?;

        // The initialized notification has no id; any 2xx/202 is accepted.
        self.post_notification(
            rpc::notification("notifications/initialized", serde_json::json!({})),
            cancel,
        )
        .await?;
        *initialized = true;
        debug!(url = %self.url, "mcp http handshake complete");
        Ok(())
    }

    async fn post(&self, message: Value, cancel: &CancellationToken) -> Result<Value> {
        let response = self.send(message, cancel).await?;
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| ConnectorError::MalformedFrame(format!("invalid JSON response: {e}")))?;
        Ok(body)
    }

    async fn post_notification(&self, message: Value, cancel: &CancellationToken) -> Result<()> {
        self.send(message, cancel).await.map(|_| ())
    }

    async fn send(&self, message: Value, cancel: &CancellationToken) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(session) = self.session_id.lock().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = tokio::select! {
            r = request.json(&message).send() => r?,
            _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
        };

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Transport(format!(
                "http {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }

    pub fn timeout_s(&self) -> u64 {
        self.timeout_s
    }
}
