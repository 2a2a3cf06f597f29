//! Tool execution loop — the core agentic behavior.
//!
//! Flow: messages → LLM → if tool calls → execute tools → inject results →
//! LLM → repeat. Two circuit-breakers bound the damage of a degenerate
//! model: a repeat breaker for identical call batches issued back-to-back,
//! and a drift breaker for one tool hammered with near-identical input.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::provider::{ChatMessage, LlmOptions, LlmProvider, ProviderError};
use crate::registry::ToolRegistry;
use crate::tool::ToolContext;

/// Consecutive identical call batches tolerated before the repeat breaker
/// trips.
const REPEAT_SIGNATURE_LIMIT: u32 = 3;
/// Per-tool call count at which near-identical input trips the drift
/// breaker.
const DRIFT_COUNT_LIMIT: u32 = 8;
/// The drift breaker only fires while the tool has seen at most this many
/// distinct argument shapes.
const DRIFT_DISTINCT_LIMIT: usize = 2;

pub const REPEAT_BREAKER_MESSAGE: &str = "I'm stopping tool execution because I detected a \
    repeated tool-call loop. If you still want this action, restate it with a narrower scope.";
pub const DRIFT_BREAKER_MESSAGE: &str = "I'm stopping tool execution because one tool kept \
    being called repeatedly with nearly identical input. If you still want this action, \
    restate it with a narrower scope.";

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub model: String,
    pub max_iterations: u32,
    pub options: LlmOptions,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_iterations: 25,
            options: LlmOptions::default(),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without requesting tools.
    Answer,
    RepeatBreaker,
    DriftBreaker,
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    /// Final assistant content, or the deterministic fallback text when a
    /// breaker or the iteration cap stopped the loop.
    pub content: String,
    pub iterations: u32,
    pub stop: StopReason,
}

/// Drive the provider through tool calls until it answers directly or a
/// breaker trips. Breaker trips are normal outcomes, not errors.
pub async fn run_tool_loop(
    provider: &dyn LlmProvider,
    registry: &ToolRegistry,
    mut messages: Vec<ChatMessage>,
    ctx: &ToolContext,
    config: &ToolLoopConfig,
) -> Result<ToolLoopOutcome, ProviderError> {
    let tools = registry.definitions();
    let mut last_signature = String::new();
    let mut signature_streak: u32 = 0;
    let mut call_counts: HashMap<String, u32> = HashMap::new();
    let mut distinct_args: HashMap<String, HashSet<String>> = HashMap::new();

    for iteration in 1..=config.max_iterations {
        if ctx.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        debug!(iteration, "tool loop iteration");
        // The caller's token races the provider call itself, so a stalled
        // provider cannot wedge a cancelled turn.
        let response = match ctx
            .cancel
            .run_until_cancelled(provider.chat(
                &messages,
                &tools,
                &config.model,
                &config.options,
                &ctx.cancel,
            ))
            .await
        {
            Some(response) => response?,
            None => return Err(ProviderError::Cancelled),
        };

        if response.tool_calls.is_empty() {
            info!(iteration, "tool loop complete");
            return Ok(ToolLoopOutcome {
                content: response.content,
                iterations: iteration,
                stop: StopReason::Answer,
            });
        }

        // Repeat breaker: the same call batch issued back-to-back.
        let signature = response
            .tool_calls
            .iter()
            .map(|c| format!("{}:{}", c.name, c.arguments))
            .collect::<Vec<_>>()
            .join("|");
        if signature == last_signature {
            signature_streak += 1;
        } else {
            last_signature = signature;
            signature_streak = 1;
        }
        if signature_streak >= REPEAT_SIGNATURE_LIMIT {
            warn!(iteration, "repeat-signature breaker tripped");
            return Ok(ToolLoopOutcome {
                content: REPEAT_BREAKER_MESSAGE.to_string(),
                iterations: iteration,
                stop: StopReason::RepeatBreaker,
            });
        }

        // Drift breaker: one tool, many calls, trivially varying args.
        for call in &response.tool_calls {
            let count = call_counts.entry(call.name.clone()).or_insert(0);
            *count += 1;
            let distinct = distinct_args.entry(call.name.clone()).or_default();
            distinct.insert(call.arguments.to_string());
            if *count >= DRIFT_COUNT_LIMIT && distinct.len() <= DRIFT_DISTINCT_LIMIT {
                warn!(iteration, tool = %call.name, "drift breaker tripped");
                return Ok(ToolLoopOutcome {
                    content: DRIFT_BREAKER_MESSAGE.to_string(),
                    iterations: iteration,
                    stop: StopReason::DriftBreaker,
                });
            }
        }

        // Provider APIs require the assistant turn with its tool-call
        // references first, then the tool results in call order.
        messages.push(ChatMessage::assistant(
            response.content.clone(),
            response.tool_calls.clone(),
        ));
        for call in &response.tool_calls {
            let result = registry.dispatch(ctx, call).await;
            let content = if result.is_error {
                format!("tool error: {}", result.content)
            } else {
                result.content
            };
            messages.push(ChatMessage::tool_result(&call.id, content));
        }
    }

    warn!(max_iterations = config.max_iterations, "tool loop hit iteration cap");
    Ok(ToolLoopOutcome {
        content: format!(
            "I paused because I reached the maximum number of consecutive actions ({}). \
             Send a follow-up message if you want me to continue.",
            config.max_iterations
        ),
        iterations: config.max_iterations,
        stop: StopReason::MaxIterations,
    })
}
