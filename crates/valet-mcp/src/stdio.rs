//! Framed stdio transport: spawn the server process, speak Content-Length
//! framed JSON-RPC over its pipes.
//!
//! One call holds the stdio mutex for its whole write+read round trip, so
//! interleaved frames from concurrent calls are impossible by construction.
//! Unrelated frames arriving mid-read (notifications, late responses) are
//! skipped until the response with the matching id shows up.

use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use valet_core::config::McpConnectorConfig;

use crate::error::{ConnectorError, Result};
use crate::rpc;

pub struct StdioTransport {
    config: McpConnectorConfig,
    state: Mutex<Option<StdioState>>,
    next_id: AtomicI64,
}

struct StdioState {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    initialized: bool,
}

impl StdioTransport {
    pub fn new(config: McpConnectorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
            next_id: AtomicI64::new(1),
        }
    }

    /// One JSON-RPC round trip. The process is spawned and the MCP
    /// initialization handshake performed lazily on first use.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let timeout = Duration::from_secs(self.config.timeout_s);
        let mut guard = self.state.lock().await;

        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let state = guard.as_mut().unwrap();

        if !state.initialized {
            match tokio::time::timeout(timeout, handshake(state, cancel)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    teardown(&mut guard);
                    return Err(e);
                }
                Err(_) => {
                    teardown(&mut guard);
                    return Err(ConnectorError::Timeout(self.config.timeout_s));
                }
            }
        }
        let state = guard.as_mut().unwrap();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let result = match tokio::time::timeout(
            timeout,
            roundtrip(state, id, method, params, cancel),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(ConnectorError::Timeout(self.config.timeout_s)),
        };

        // Any failure other than a clean RPC error leaves the pipes in an
        // unknown position: reset so the next call re-initializes.
        if matches!(&result, Err(e) if !matches!(e, ConnectorError::Rpc { .. })) {
            warn!(method, "stdio transport reset after failure");
            teardown(&mut guard);
        }
        result
    }

    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        teardown(&mut guard);
    }

    fn spawn(&self) -> Result<StdioState> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| ConnectorError::Config("stdio connector without command".into()))?;

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ConnectorError::Transport(format!("spawn {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::Transport("child stdout unavailable".into()))?;

        info!(connector = %self.config.name, command, "mcp server process spawned");
        Ok(StdioState {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            initialized: false,
        })
    }
}

/// `initialize` request + `notifications/initialized`. Runs inside the
/// stdio critical section.
async fn handshake(state: &mut StdioState, cancel: &CancellationToken) -> Result<()> {
    let StdioState {
        child,
        stdin,
        stdout,
        initialized,
    } = state;

    let init = rpc::request(
        0,
        "initialize",
        rpc::initialize_params("valet", env!("CARGO_PKG_VERSION")),
    );
    rpc::write_frame(stdin, &init).await?;
    let response = read_until_id(stdout, 0, cancel, || {
        let _ = child.start_kill();
    })
    .await?;
    rpc::unwrap_response(response)?;

    rpc::write_frame(
        stdin,
        &rpc::notification("notifications/initialized", serde_json::json!({})),
    )
    .await?;
    *initialized = true;
    debug!("mcp stdio handshake complete");
    Ok(())
}

async fn roundtrip(
    state: &mut StdioState,
    id: i64,
    method: &str,
    params: Value,
    cancel: &CancellationToken,
) -> Result<Value> {
    let StdioState {
        child,
        stdin,
        stdout,
        ..
    } = state;

    rpc::write_frame(stdin, &rpc::request(id, method, params)).await?;
    let response = read_until_id(stdout, id, cancel, || {
        let _ = child.start_kill();
    })
    .await?;
    rpc::unwrap_response(response)
}

/// Read frames until one carries the expected id. Notifications and stray
/// responses are ignored.
pub(crate) async fn read_until_id<R, F>(
    reader: &mut R,
    id: i64,
    cancel: &CancellationToken,
    mut on_cancel: F,
) -> Result<Value>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(),
{
    loop {
        let frame = rpc::read_frame(reader, cancel, &mut on_cancel).await?;
        match frame.get("id").and_then(Value::as_i64) {
            Some(frame_id) if frame_id == id => return Ok(frame),
            _ => debug!("skipping unrelated frame while awaiting response"),
        }
    }
}

fn teardown(guard: &mut Option<StdioState>) {
    if let Some(mut state) = guard.take() {
        let _ = state.child.start_kill();
    }
}
