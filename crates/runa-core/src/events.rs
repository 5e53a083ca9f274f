// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use runa_model::{Message, StopReason, Usage};

/// Events emitted by the agent loop and turn executor.
/// Consumers (TUI, CI runner, tests) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A user query has been accepted and the loop is starting
    AgentStart,
    /// The loop finished; final stop reason and accumulated usage
    AgentEnd {
        stop_reason: StopReason,
        total_turns: u32,
        total_usage: Usage,
    },
    /// A request/response turn is starting
    TurnStart { turn: u32 },
    /// A turn finished, carrying the assembled assistant message (if any)
    /// and the ordered tool results
    TurnEnd {
        turn: u32,
        assistant_message: Option<Message>,
        tool_results: Vec<Message>,
        stop_reason: StopReason,
    },

    /// The model opened a reasoning block
    ThinkingStart,
    ThinkingDelta { delta: String },
    ThinkingEnd {
        thinking: String,
        signature: Option<String>,
    },

    /// The model opened a text block
    TextStart,
    TextDelta { delta: String },
    TextEnd { text: String },

    /// The model began emitting a tool call
    ToolStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// Raw JSON fragment appended to the current tool call's arguments
    ToolArgsDelta {
        tool_call_id: String,
        delta: String,
    },
    /// Throttled progress update while long tool arguments stream in.
    /// `token_count` uses the chars/4 display heuristic, not a real count.
    ToolArgsTokenUpdate {
        tool_call_id: String,
        tool_name: String,
        token_count: u64,
    },
    /// A tool call is fully assembled and queued for execution
    ToolEnd {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        display: String,
    },
    /// A queued tool finished executing
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Message,
    },

    /// Overflow compaction began (summary generation may take a while)
    CompactionStart,
    CompactionEnd { tokens_before: u64, aborted: bool },

    /// A transient provider failure is being retried after a backoff
    Retry {
        attempt: usize,
        total_attempts: usize,
        delay: u64,
        error: String,
    },
    Error { error: String },
    Warning { warning: String },
    /// The user interrupted the run
    Interrupted { message: String },
}
