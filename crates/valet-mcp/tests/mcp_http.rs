// Streamable-HTTP round trip against a minimal in-process MCP server:
// initialize handshake, session header continuity, tools/list caching,
// tools/call text extraction, and the RPC error path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use valet_agent::{Tool, ToolContext};
use valet_core::config::{McpConnectorConfig, McpTransport};
use valet_mcp::{ConnectorError, McpRuntime, McpTool};

/// Session ids observed on each incoming request, in order.
type SessionLog = Arc<Mutex<Vec<Option<String>>>>;

async fn spawn_server() -> (String, SessionLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: SessionLog = Arc::new(Mutex::new(Vec::new()));
    let server_log = Arc::clone(&log);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let log = Arc::clone(&server_log);
            tokio::spawn(async move {
                let _ = handle_connection(stream, log).await;
            });
        }
    });
    (format!("http://{addr}/mcp"), log)
}

async fn handle_connection(mut stream: TcpStream, log: SessionLog) -> std::io::Result<()> {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        // Read one request: headers, then Content-Length body bytes.
        let header_end = loop {
            if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n") {
                break pos + 4;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..n]);
        };

        let headers = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let content_length = headers
            .lines()
            .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let session = headers.lines().find_map(|l| {
            l.to_lowercase()
                .starts_with("mcp-session-id:")
                .then(|| l.splitn(2, ':').nth(1).unwrap_or("").trim().to_string())
        });
        log.lock().unwrap().push(session);

        while buffer.len() < header_end + content_length {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        let body: Value =
            serde_json::from_slice(&buffer[header_end..header_end + content_length])
                .unwrap_or(Value::Null);
        buffer.drain(..header_end + content_length);

        let method = body["method"].as_str().unwrap_or("");
        let id = body["id"].clone();

        if id.is_null() {
            // Notification: 202 Accepted, empty body.
            write_response(&mut stream, 202, "").await?;
            continue;
        }

        let response = match method {
            "initialize" => json!({
                "jsonrpc": "2.0", "id": id,
                "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake-mcp", "version": "0.0.1" }
                }
            }),
            "tools/list" => json!({
                "jsonrpc": "2.0", "id": id,
                "result": { "tools": [{
                    "name": "echo",
                    "description": "Echo a message back",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "message": { "type": "string" } },
                        "required": ["message"]
                    }
                }] }
            }),
            "tools/call" => {
                if body["params"]["name"] == "echo" {
                    json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {
                            "content": [{ "type": "text", "text": "mcp-http-ok" }],
                            "isError": false
                        }
                    })
                } else {
                    json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": { "code": -32602, "message": "Unknown tool" }
                    })
                }
            }
            _ => json!({
                "jsonrpc": "2.0", "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };
        write_response(&mut stream, 200, &response.to_string()).await?;
    }
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let reason = if status == 202 { "Accepted" } else { "OK" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Mcp-Session-Id: sess-123\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn http_config(url: &str) -> McpConnectorConfig {
    McpConnectorConfig {
        name: "files".into(),
        transport: McpTransport::StreamableHttp,
        url: Some(url.to_string()),
        headers: HashMap::new(),
        command: None,
        args: vec![],
        env: HashMap::new(),
        working_dir: None,
        timeout_s: 5,
        max_concurrency: None,
        retry_max_attempts: 2,
        retry_backoff_ms: 10,
    }
}

#[tokio::test]
async fn invoke_round_trips_text_content() {
    let (url, sessions) = spawn_server().await;
    let runtime = McpRuntime::new(http_config(&url)).unwrap();
    let cancel = CancellationToken::new();

    let outcome = runtime
        .invoke(&cancel, "echo", json!({ "message": "hello" }))
        .await
        .unwrap();
    assert_eq!(outcome.content, "mcp-http-ok");
    assert!(!outcome.is_error);

    // The first request (initialize) carries no session id; every request
    // after it echoes the id the server handed back.
    let seen = sessions.lock().unwrap().clone();
    assert!(seen.len() >= 3, "initialize, initialized, tools/call");
    assert!(seen[0].is_none());
    assert!(seen[1..].iter().all(|s| s.as_deref() == Some("sess-123")));
}

#[tokio::test]
async fn health_and_schema_use_the_descriptor_cache() {
    let (url, _sessions) = spawn_server().await;
    let runtime = McpRuntime::new(http_config(&url)).unwrap();
    let cancel = CancellationToken::new();

    runtime.health(&cancel).await.unwrap();

    let (description, schema) = runtime.tool_schema(&cancel, "echo").await.unwrap();
    assert_eq!(description, "Echo a message back");
    assert_eq!(schema["required"][0], "message");

    assert!(matches!(
        runtime.tool_schema(&cancel, "missing").await,
        Err(ConnectorError::UnknownTool(_))
    ));
}

#[tokio::test]
async fn rpc_errors_are_not_retried_and_surface_as_tool_errors() {
    let (url, sessions) = spawn_server().await;
    let runtime = Arc::new(McpRuntime::new(http_config(&url)).unwrap());
    let cancel = CancellationToken::new();

    let err = runtime
        .invoke(&cancel, "not_a_tool", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Rpc { code: -32602, .. }));

    let calls_after_first = sessions.lock().unwrap().len();

    // Same failure through the Tool adapter becomes an error result.
    let tools = McpTool::discover(Arc::clone(&runtime), &cancel).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name(), "files__echo");

    let result = tools[0]
        .execute(&ToolContext::new("cli", "1"), json!({ "message": "hi" }))
        .await;
    assert!(!result.is_error);
    assert_eq!(result.content, "mcp-http-ok");

    // One tools/list + one tools/call; no retry storm from the RPC error.
    let total = sessions.lock().unwrap().len();
    assert_eq!(total, calls_after_first + 2);
}
