//! JSON-RPC 2.0 message shapes and the Content-Length stdio framing.
//!
//! Wire format, bit-exact:
//! - Frame header: ASCII `Content-Length: <n>\r\n\r\n`, then n bytes of
//!   UTF-8 JSON.
//! - Request: `{"jsonrpc":"2.0","id":<int>,"method":...,"params":...}`.
//! - Response: `{"jsonrpc":"2.0","id":<int>,"result":...}` or
//!   `{"jsonrpc":"2.0","id":<int>,"error":{"code":...,"message":...}}`.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncBufRead, AsyncWrite, AsyncWriteExt, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectorError, Result};

/// MCP protocol revision this client speaks.
pub const PROTOCOL_VERSION: &str = "2025-06-18";
/// Frames above this size indicate a desynced peer.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// A notification carries no id and expects no response.
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": { "name": client_name, "version": client_version },
        "capabilities": { "tools": {} }
    })
}

/// Split a response into its result, surfacing a JSON-RPC error object as
/// the non-retryable `Rpc` variant.
pub fn unwrap_response(response: Value) -> Result<Value> {
    if let Some(err) = response.get("error") {
        return Err(ConnectorError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

/// Write one framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Value) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message, honoring cancellation.
///
/// On cancel the pending read future is dropped and `on_cancel` runs
/// exactly once; callers use the hook to tear the underlying pipes down so
/// a blocked OS read cannot wedge the transport for the next call.
pub async fn read_frame<R, F>(
    reader: &mut R,
    cancel: &CancellationToken,
    on_cancel: F,
) -> Result<Value>
where
    R: AsyncBufRead + Unpin,
    F: FnOnce(),
{
    tokio::select! {
        frame = read_frame_inner(reader) => frame,
        _ = cancel.cancelled() => {
            on_cancel();
            Err(ConnectorError::Cancelled)
        }
    }
}

async fn read_frame_inner<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ConnectorError::Transport("stdio stream closed".into()));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ConnectorError::MalformedFrame(format!("bad header: {trimmed}")))?,
            );
        }
        // Other headers are permitted and ignored.
    }

    let len = content_length
        .ok_or_else(|| ConnectorError::MalformedFrame("missing Content-Length header".into()))?;
    if len > MAX_FRAME_BYTES {
        return Err(ConnectorError::MalformedFrame(format!("frame of {len} bytes")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map_err(|e| ConnectorError::MalformedFrame(format!("invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn frame_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _keep_server_write) = tokio::io::split(server);
        let (_keep_client_read, mut client_write) = tokio::io::split(client);

        let message = request(7, "tools/list", json!({}));
        write_frame(&mut client_write, &message).await.unwrap();

        let mut reader = BufReader::new(server_read);
        let cancel = CancellationToken::new();
        let frame = read_frame(&mut reader, &cancel, || {}).await.unwrap();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["method"], "tools/list");
    }

    #[tokio::test]
    async fn blocked_read_cancels_and_fires_hook_once() {
        let (client, _server_kept_open) = tokio::io::duplex(64);
        let (read_half, _write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);

        let cancel = CancellationToken::new();
        let fired = AtomicUsize::new(0);

        let canceller = cancel.clone();
        let read = read_frame(&mut reader, &cancel, || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        let deadline = async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            canceller.cancel();
            // The read future resolves promptly after the token fires.
            std::future::pending::<Result<Value>>().await
        };

        let result = tokio::select! {
            r = read => r,
            r = deadline => r,
        };
        assert!(matches!(result, Err(ConnectorError::Cancelled)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_length_header_is_malformed() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, mut write_half) = tokio::io::split(client);

        use tokio::io::AsyncWriteExt;
        write_half
            .write_all(b"X-Unexpected: yes\r\n\r\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        let cancel = CancellationToken::new();
        let result = read_frame(&mut reader, &cancel, || {}).await;
        assert!(matches!(result, Err(ConnectorError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn closed_stream_is_transport_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let (read_half, _write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);
        let cancel = CancellationToken::new();
        let result = read_frame(&mut reader, &cancel, || {}).await;
        assert!(matches!(result, Err(ConnectorError::Transport(_))));
    }

    #[test]
    fn rpc_error_objects_are_not_retryable() {
        let response = json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32601, "message": "Method not found" }
        });
        let err = unwrap_response(response).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "mcp rpc error -32601: Method not found");
    }
}
