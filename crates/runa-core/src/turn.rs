// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single turn execution – one request/response cycle with streaming.
//!
//! Demultiplexes the provider's part stream into typed events as they
//! arrive: thinking start/delta/end, text start/delta/end, tool
//! start/args-delta/end, then one tool-result event per executed call, and
//! finally a turn-end event carrying the complete assistant message.
//!
//! Tool execution strategy: all tool calls are collected during streaming;
//! after the stream completes every `ToolEnd` is emitted first (so UIs can
//! show all calls as pending), then the tools run one by one.
//!
//! Cancellation races every chunk fetch via `select!`, so an interrupt takes
//! effect immediately rather than when the next chunk happens to arrive.
//! An idle timeout guards stalled tool-call emissions: some providers drop
//! the terminal stream event after a tool call is fully emitted, and the
//! timeout recovers the turn with whatever calls were collected.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use runa_model::{
    AssistantPart, ContentPart, Message, Provider, StopReason, StreamPart, StreamRequest,
    ToolDefinition,
};
use runa_tools::{Tool, ToolRegistry};

use crate::events::AgentEvent;

const DEFAULT_RETRY_DELAYS: [u64; 3] = [2, 4, 8];
const TOOL_ARGS_TOKEN_DISPLAY_THRESHOLD: u64 = 20;
const TOOL_ARGS_TOKEN_CHUNK_UPDATE_INTERVAL: u64 = 4;

/// Estimate token count from text (approx 4 chars per token).  Display
/// throttling only; never an authoritative count.
fn count_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Inputs for one turn.
pub struct TurnRequest<'a> {
    pub provider: &'a dyn Provider,
    pub messages: Vec<Message>,
    pub tools: &'a ToolRegistry,
    pub system_prompt: Option<String>,
    pub turn: u32,
    pub cancel: CancellationToken,
    /// Backoff schedule in seconds; `None` uses the default `[2, 4, 8]`.
    pub retry_delays: Option<Vec<u64>>,
    /// Idle timeout applied while tool calls stream or sit pending;
    /// `None` disables it.
    pub idle_timeout: Option<Duration>,
}

/// What a turn produced, mirrored by the terminal `TurnEnd` event.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub assistant_message: Option<Message>,
    pub tool_results: Vec<Message>,
    pub stop_reason: StopReason,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Think,
    Text,
    ToolCall,
}

/// A tool call accumulated from the stream, arguments still raw JSON text.
#[derive(Debug)]
struct RawToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Stream demultiplexer state: the current block is the single source of
/// truth; every transition finalizes it before entering a new block.
#[derive(Default)]
struct BlockAssembler {
    state: Option<BlockState>,
    think_buf: String,
    think_signature: Option<String>,
    text_buf: String,
    current_tool: Option<RawToolCall>,
    pending: Vec<RawToolCall>,
    content: Vec<AssistantPart>,
}

impl BlockAssembler {
    /// Close the in-progress block and return the end events to emit.
    ///
    /// Thinking/text blocks produce a content part even when empty unless
    /// `include_empty` is false (interrupt cleanup drops empty blocks).
    /// Tool-call blocks always move to the pending queue.
    fn finalize(&mut self, include_empty: bool) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        match self.state.take() {
            Some(BlockState::Think) => {
                let thinking = std::mem::take(&mut self.think_buf);
                let signature = self.think_signature.take();
                if include_empty || !thinking.is_empty() {
                    self.content.push(AssistantPart::Thinking {
                        thinking: thinking.clone(),
                        signature: signature.clone(),
                    });
                    events.push(AgentEvent::ThinkingEnd { thinking, signature });
                }
            }
            Some(BlockState::Text) => {
                let text = std::mem::take(&mut self.text_buf);
                if include_empty || !text.is_empty() {
                    self.content.push(AssistantPart::Text { text: text.clone() });
                    events.push(AgentEvent::TextEnd { text });
                }
            }
            Some(BlockState::ToolCall) => {
                if let Some(tc) = self.current_tool.take() {
                    self.pending.push(tc);
                }
            }
            None => {}
        }
        events
    }
}

/// A finalized tool call ready for execution.
struct PendingExecution {
    id: String,
    name: String,
    arguments: Value,
    tool: Option<Arc<dyn Tool>>,
}

async fn send(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    let _ = tx.send(event).await;
}

/// Sleep for the idle timeout, or forever when it is disabled.
async fn idle_wait(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn format_seconds(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{secs}")
    }
}

fn error_tool_result(id: &str, name: &str, text: impl Into<String>) -> Message {
    Message::tool_result(id, name, vec![ContentPart::text(text)], None, true)
}

fn tool_definitions(tools: &ToolRegistry) -> Option<Vec<ToolDefinition>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .schemas()
            .into_iter()
            .map(|s| ToolDefinition {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect(),
    )
}

/// Open the provider stream, applying the backoff schedule to retryable
/// failures.  Emits one `Retry` event per backoff; the final failure is
/// returned for the caller to surface.
async fn open_stream_with_retry(
    provider: &dyn Provider,
    request: &StreamRequest,
    delays: &[u64],
    tx: &mpsc::Sender<AgentEvent>,
) -> Result<runa_model::StreamHandle, runa_model::ProviderError> {
    let mut attempt = 0usize;
    loop {
        match provider.stream(request.clone()).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                if attempt >= delays.len() || !provider.should_retry(&e) {
                    return Err(e);
                }
                let delay = delays[attempt];
                attempt += 1;
                send(
                    tx,
                    AgentEvent::Retry {
                        attempt,
                        total_attempts: delays.len(),
                        delay,
                        error: e.to_string(),
                    },
                )
                .await;
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }
}

async fn execute_tool(pending: &PendingExecution, cancel: &CancellationToken) -> Message {
    let Some(tool) = &pending.tool else {
        return error_tool_result(
            &pending.id,
            &pending.name,
            format!("Unknown tool: {}", pending.name),
        );
    };

    match tool.execute(&pending.arguments, cancel).await {
        Ok(result) => {
            let mut content: Vec<ContentPart> = Vec::new();
            if let Some(text) = result.result.filter(|t| !t.is_empty()) {
                content.push(ContentPart::text(text));
            }
            for image in result.images {
                content.push(ContentPart::image(image.mime_type, image.data));
            }
            if content.is_empty() {
                content.push(ContentPart::text("(no output)"));
            }
            Message::tool_result(
                &pending.id,
                &pending.name,
                content,
                result.display,
                !result.success,
            )
        }
        Err(e) => error_tool_result(
            &pending.id,
            &pending.name,
            format!("Error executing tool: {e}"),
        ),
    }
}

/// Run one request/response cycle, emitting events and returning the
/// assembled outcome.  The terminal `TurnEnd` event is always the last
/// event this function sends.
pub async fn run_single_turn(req: TurnRequest<'_>, tx: &mpsc::Sender<AgentEvent>) -> TurnOutcome {
    let TurnRequest {
        provider,
        messages,
        tools,
        system_prompt,
        turn,
        cancel,
        retry_delays,
        idle_timeout,
    } = req;

    // Pre-cancel shortcut: don't touch the provider at all.
    if cancel.is_cancelled() {
        send(tx, AgentEvent::Interrupted { message: "Interrupted by user".into() }).await;
        send(
            tx,
            AgentEvent::TurnEnd {
                turn,
                assistant_message: None,
                tool_results: Vec::new(),
                stop_reason: StopReason::Interrupted,
            },
        )
        .await;
        return TurnOutcome {
            assistant_message: None,
            tool_results: Vec::new(),
            stop_reason: StopReason::Interrupted,
            interrupted: true,
        };
    }

    let delays = retry_delays.unwrap_or_else(|| DEFAULT_RETRY_DELAYS.to_vec());
    let request = StreamRequest {
        messages,
        system_prompt,
        tools: tool_definitions(tools),
        ..Default::default()
    };

    let mut stream = match open_stream_with_retry(provider, &request, &delays, tx).await {
        Ok(s) => s,
        Err(e) => {
            send(tx, AgentEvent::Error { error: e.to_string() }).await;
            send(
                tx,
                AgentEvent::TurnEnd {
                    turn,
                    assistant_message: None,
                    tool_results: Vec::new(),
                    stop_reason: StopReason::Error,
                },
            )
            .await;
            return TurnOutcome {
                assistant_message: None,
                tool_results: Vec::new(),
                stop_reason: StopReason::Error,
                interrupted: false,
            };
        }
    };

    let mut blocks = BlockAssembler::default();
    let mut stop_reason = StopReason::Stop;
    let mut interrupted = false;

    // Throttled token updates while long tool arguments stream in.
    let mut tool_arg_chunk_counter: u64 = 0;
    let mut tool_arg_token_count: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            interrupted = true;
            stop_reason = StopReason::Interrupted;
            break;
        }

        // The idle timeout only arms while a tool call is streaming or
        // pending; text and thinking streams may legitimately pause for
        // much longer.
        let chunk_timeout = if matches!(blocks.state, Some(BlockState::ToolCall))
            || !blocks.pending.is_empty()
        {
            idle_timeout
        } else {
            None
        };

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                interrupted = true;
                stop_reason = StopReason::Interrupted;
                break;
            }
            part = stream.next_part() => part,
            _ = idle_wait(chunk_timeout) => {
                let secs = chunk_timeout.map(format_seconds).unwrap_or_default();
                send(
                    tx,
                    AgentEvent::Warning {
                        warning: format!(
                            "Tool-call stream stalled for {secs}s; continuing with collected arguments."
                        ),
                    },
                )
                .await;
                for ev in blocks.finalize(false) {
                    send(tx, ev).await;
                }
                if !blocks.pending.is_empty() && stop_reason == StopReason::Stop {
                    stop_reason = StopReason::ToolUse;
                }
                break;
            }
        };

        let Some(part) = fetched else {
            // Stream exhausted without a terminal part.
            for ev in blocks.finalize(true) {
                send(tx, ev).await;
            }
            if !blocks.pending.is_empty() && stop_reason == StopReason::Stop {
                stop_reason = StopReason::ToolUse;
            }
            break;
        };

        match part {
            StreamPart::Think { delta, signature } => {
                if blocks.state != Some(BlockState::Think) {
                    for ev in blocks.finalize(true) {
                        send(tx, ev).await;
                    }
                    send(tx, AgentEvent::ThinkingStart).await;
                    blocks.state = Some(BlockState::Think);
                }
                blocks.think_buf.push_str(&delta);
                if signature.is_some() {
                    blocks.think_signature = signature;
                }
                send(tx, AgentEvent::ThinkingDelta { delta }).await;
            }

            StreamPart::Text { delta } => {
                if blocks.state != Some(BlockState::Text) {
                    for ev in blocks.finalize(true) {
                        send(tx, ev).await;
                    }
                    send(tx, AgentEvent::TextStart).await;
                    blocks.state = Some(BlockState::Text);
                }
                blocks.text_buf.push_str(&delta);
                send(tx, AgentEvent::TextDelta { delta }).await;
            }

            StreamPart::ToolCallStart { id, name, .. } => {
                // A tool call following another tool call just queues the
                // previous one; any other block is finalized normally.
                if blocks.state == Some(BlockState::ToolCall) {
                    if let Some(tc) = blocks.current_tool.take() {
                        blocks.pending.push(tc);
                    }
                } else {
                    for ev in blocks.finalize(true) {
                        send(tx, ev).await;
                    }
                }
                tool_arg_chunk_counter = 0;
                tool_arg_token_count = 0;
                blocks.state = Some(BlockState::ToolCall);
                blocks.current_tool = Some(RawToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
                send(tx, AgentEvent::ToolStart { tool_call_id: id, tool_name: name }).await;
            }

            StreamPart::ToolCallDelta { arguments_delta, .. } => {
                if let Some(tc) = blocks.current_tool.as_mut() {
                    tc.arguments.push_str(&arguments_delta);
                    let update = {
                        tool_arg_chunk_counter += 1;
                        tool_arg_token_count += count_tokens(&arguments_delta);
                        (tool_arg_token_count > TOOL_ARGS_TOKEN_DISPLAY_THRESHOLD
                            && tool_arg_chunk_counter % TOOL_ARGS_TOKEN_CHUNK_UPDATE_INTERVAL == 0)
                            .then(|| AgentEvent::ToolArgsTokenUpdate {
                                tool_call_id: tc.id.clone(),
                                tool_name: tc.name.clone(),
                                token_count: tool_arg_token_count,
                            })
                    };
                    send(
                        tx,
                        AgentEvent::ToolArgsDelta {
                            tool_call_id: tc.id.clone(),
                            delta: arguments_delta,
                        },
                    )
                    .await;
                    if let Some(ev) = update {
                        send(tx, ev).await;
                    }
                }
            }

            StreamPart::Done { stop_reason: reason } => {
                stop_reason = reason;
                for ev in blocks.finalize(true) {
                    send(tx, ev).await;
                }
                break;
            }

            StreamPart::StreamError { error } => {
                send(tx, AgentEvent::Error { error }).await;
                stop_reason = StopReason::Error;
                for ev in blocks.finalize(true) {
                    send(tx, ev).await;
                }
                break;
            }
        }
    }

    // Interrupt cleanup: keep partial content but drop empty blocks.
    if interrupted {
        for ev in blocks.finalize(false) {
            send(tx, ev).await;
        }
    }

    // Phase 1: finalize every collected tool call and emit all ToolEnd
    // events before any execution starts.
    let mut executions: Vec<PendingExecution> = Vec::new();
    for raw in blocks.pending.drain(..) {
        let arguments = serde_json::from_str::<Value>(&raw.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let tool = tools.get(&raw.name);
        let display = tool
            .as_ref()
            .map(|t| t.format_call(&arguments))
            .unwrap_or_default();

        blocks.content.push(AssistantPart::ToolCall {
            id: raw.id.clone(),
            name: raw.name.clone(),
            arguments: arguments.clone(),
        });
        send(
            tx,
            AgentEvent::ToolEnd {
                tool_call_id: raw.id.clone(),
                tool_name: raw.name.clone(),
                arguments: arguments.clone(),
                display,
            },
        )
        .await;
        executions.push(PendingExecution { id: raw.id, name: raw.name, arguments, tool });
    }

    // Phase 2: execute strictly in call order.  Once cancellation fires,
    // the remaining calls get synthetic interrupted results.
    let mut tool_results: Vec<Message> = Vec::new();
    for pending in &executions {
        let result = if cancel.is_cancelled() {
            error_tool_result(&pending.id, &pending.name, "Interrupted by user")
        } else {
            execute_tool(pending, &cancel).await
        };
        send(
            tx,
            AgentEvent::ToolResult {
                tool_call_id: pending.id.clone(),
                tool_name: pending.name.clone(),
                result: result.clone(),
            },
        )
        .await;
        tool_results.push(result);
    }

    if interrupted {
        send(tx, AgentEvent::Interrupted { message: "Interrupted by user".into() }).await;
    }

    let assistant_message = Message::Assistant {
        content: blocks.content,
        usage: stream.usage(),
        stop_reason: Some(stop_reason),
    };

    send(
        tx,
        AgentEvent::TurnEnd {
            turn,
            assistant_message: Some(assistant_message.clone()),
            tool_results: tool_results.clone(),
            stop_reason,
        },
    )
    .await;

    TurnOutcome {
        assistant_message: Some(assistant_message),
        tool_results,
        stop_reason,
        interrupted,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
