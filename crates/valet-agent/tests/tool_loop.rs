// Tool-loop behavior against a scripted provider: normal completion,
// both circuit-breakers, the iteration cap, and message ordering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use valet_agent::{
    run_tool_loop, ChatMessage, ChatResponse, LlmOptions, LlmProvider, ProviderError, Role,
    StopReason, Tool, ToolCall, ToolContext, ToolLoopConfig, ToolLoopOutcome, ToolRegistry,
    ToolResult,
};

/// Provider that replays a pre-programmed response sequence and records
/// the message list it was shown on every call.
struct ScriptedProvider {
    script: Mutex<Vec<ChatResponse>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    fn new(script: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(script),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn snapshots(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[valet_agent::ToolDefinition],
        _model: &str,
        _options: &LlmOptions,
        _cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(ProviderError::Unavailable("script exhausted".into()));
        }
        Ok(script.remove(0))
    }
}

/// Provider whose call never returns; stands in for a stalled HTTP backend.
struct HangingProvider;

#[async_trait]
impl LlmProvider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[valet_agent::ToolDefinition],
        _model: &str,
        _options: &LlmOptions,
        _cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

struct LoopTool;

#[async_trait]
impl Tool for LoopTool {
    fn name(&self) -> &str {
        "looptool"
    }
    fn description(&self) -> &str {
        "A tool the scripted model keeps calling"
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": { "q": { "type": "string" } } })
    }
    async fn execute(&self, _ctx: &ToolContext, _args: serde_json::Value) -> ToolResult {
        ToolResult::success("looped")
    }
}

fn call(id: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: "looptool".into(),
        arguments: args,
    }
}

fn tool_response(id: &str, args: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![call(id, args)],
    }
}

fn answer(text: &str) -> ChatResponse {
    ChatResponse {
        content: text.into(),
        tool_calls: Vec::new(),
    }
}

fn registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(LoopTool)).unwrap();
    registry
}

fn config(max_iterations: u32) -> ToolLoopConfig {
    ToolLoopConfig {
        model: "test-model".into(),
        max_iterations,
        options: LlmOptions::default(),
    }
}

#[tokio::test]
async fn direct_answer_exits_on_first_iteration() {
    let provider = ScriptedProvider::new(vec![answer("forty-two")]);
    let outcome = run_tool_loop(
        &provider,
        &registry(),
        vec![ChatMessage::user("meaning of life?")],
        &ToolContext::new("cli", "1"),
        &config(25),
    )
    .await
    .unwrap();

    assert_eq!(outcome.stop, StopReason::Answer);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.content, "forty-two");
}

#[tokio::test]
async fn repeat_breaker_trips_on_third_identical_batch() {
    let same = serde_json::json!({ "q": "same" });
    let provider = ScriptedProvider::new(vec![
        tool_response("c1", same.clone()),
        tool_response("c2", same.clone()),
        tool_response("c3", same.clone()),
    ]);
    let outcome = run_tool_loop(
        &provider,
        &registry(),
        vec![ChatMessage::user("go")],
        &ToolContext::new("cli", "1"),
        &config(25),
    )
    .await
    .unwrap();

    assert_eq!(outcome.stop, StopReason::RepeatBreaker);
    assert_eq!(outcome.iterations, 3);
    assert!(outcome.content.contains("repeated tool-call loop"));
}

#[tokio::test]
async fn drift_breaker_trips_on_two_shape_hammering() {
    let shape_a = serde_json::json!({ "q": "alpha" });
    let shape_b = serde_json::json!({ "q": "beta" });
    let script: Vec<ChatResponse> = (0..8)
        .map(|i| {
            let args = if i % 2 == 0 { shape_a.clone() } else { shape_b.clone() };
            tool_response(&format!("c{i}"), args)
        })
        .collect();
    let provider = ScriptedProvider::new(script);
    let outcome = run_tool_loop(
        &provider,
        &registry(),
        vec![ChatMessage::user("go")],
        &ToolContext::new("cli", "1"),
        &config(25),
    )
    .await
    .unwrap();

    assert_eq!(outcome.stop, StopReason::DriftBreaker);
    assert_eq!(outcome.iterations, 8);
    assert!(outcome.content.contains("one tool kept being called repeatedly"));
}

#[tokio::test]
async fn iteration_cap_yields_fallback() {
    // Distinct args every time: neither breaker applies.
    let script: Vec<ChatResponse> = (0..10)
        .map(|i| tool_response(&format!("c{i}"), serde_json::json!({ "q": format!("step {i}") })))
        .collect();
    let provider = ScriptedProvider::new(script);
    let outcome = run_tool_loop(
        &provider,
        &registry(),
        vec![ChatMessage::user("go")],
        &ToolContext::new("cli", "1"),
        &config(4),
    )
    .await
    .unwrap();

    assert_eq!(outcome.stop, StopReason::MaxIterations);
    assert_eq!(outcome.iterations, 4);
    assert!(outcome.content.contains("maximum number of consecutive actions (4)"));
}

#[tokio::test]
async fn messages_preserve_assistant_then_results_order() {
    let provider = ScriptedProvider::new(vec![
        tool_response("c1", serde_json::json!({ "q": "first" })),
        answer("done"),
    ]);
    let outcome = run_tool_loop(
        &provider,
        &registry(),
        vec![ChatMessage::user("go")],
        &ToolContext::new("cli", "1"),
        &config(25),
    )
    .await
    .unwrap();
    assert_eq!(outcome.stop, StopReason::Answer);

    let snapshots = provider.snapshots();
    assert_eq!(snapshots.len(), 2);
    let second = &snapshots[1];
    // user, assistant-with-tool-calls, tool-result.
    assert_eq!(second.len(), 3);
    assert_eq!(second[1].role, Role::Assistant);
    assert_eq!(second[1].tool_calls.len(), 1);
    assert_eq!(second[2].role, Role::Tool);
    assert_eq!(second[2].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(second[2].content, "looped");
}

#[tokio::test]
async fn cancellation_unblocks_a_stalled_provider_call() {
    let cancel = CancellationToken::new();
    let ctx = ToolContext::new("cli", "1").with_cancel(cancel.clone());
    let provider = HangingProvider;
    let registry = registry();
    let config = config(25);

    let loop_fut = run_tool_loop(
        &provider,
        &registry,
        vec![ChatMessage::user("go")],
        &ctx,
        &config,
    );
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
        // The loop future resolves promptly once the token fires.
        std::future::pending::<Result<ToolLoopOutcome, ProviderError>>().await
    };

    let result = tokio::select! {
        r = loop_fut => r,
        r = canceller => r,
    };
    assert!(matches!(result, Err(ProviderError::Cancelled)));
}

#[tokio::test]
async fn unknown_tool_becomes_error_result_not_failure() {
    let provider = ScriptedProvider::new(vec![
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: "no_such_tool".into(),
                arguments: serde_json::json!({}),
            }],
        },
        answer("recovered"),
    ]);
    let outcome = run_tool_loop(
        &provider,
        &registry(),
        vec![ChatMessage::user("go")],
        &ToolContext::new("cli", "1"),
        &config(25),
    )
    .await
    .unwrap();

    assert_eq!(outcome.content, "recovered");
    let snapshots = provider.snapshots();
    let tool_msg = &snapshots[1][2];
    assert!(tool_msg.content.contains("unknown tool"));
}
