// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a user message or a tool result.
///
/// Images carry a MIME type plus a base64 payload and are rendered as data
/// URLs (`data:<mime>;base64,<b64>`) when sent over provider wire formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { mime_type: String, data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image { mime_type: mime_type.into(), data: data.into() }
    }
}

/// A single content part in an assistant message.
///
/// `Thinking` preserves the provider's reasoning-field name as `signature`
/// so the same field can be echoed back on subsequent requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantPart {
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Parsed JSON argument object
        arguments: Value,
    },
}

/// User message content – either a plain string or an ordered part list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

// ─── Message types ────────────────────────────────────────────────────────────

/// Reason the model stopped producing output for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Interrupted,
}

/// Token usage reported by the provider for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache (read hit).
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Tokens written into the provider's prompt cache (write/creation).
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }

    /// Effective total used by the overflow check and compaction bookkeeping.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

/// A single message in the conversation history, tagged by `role` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: UserContent,
    },
    Assistant {
        content: Vec<AssistantPart>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ContentPart>,
        /// Pre-rendered display string for UIs; not sent to providers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { content: UserContent::Text(text.into()) }
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self::User { content: UserContent::Parts(parts) }
    }

    /// Assistant message consisting of a single text part.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![AssistantPart::Text { text: text.into() }],
            usage: None,
            stop_reason: Some(StopReason::Stop),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Vec<ContentPart>,
        display: Option<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content,
            display,
            is_error,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant { .. })
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    /// Concatenated text parts of an assistant message; `None` for other roles.
    pub fn assistant_text_content(&self) -> Option<String> {
        match self {
            Message::Assistant { content, .. } => Some(
                content
                    .iter()
                    .filter_map(|p| match p {
                        AssistantPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .concat(),
            ),
            _ => None,
        }
    }
}

// ─── Stream parts ─────────────────────────────────────────────────────────────

/// An atomic unit emitted by a provider mid-response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    /// Incremental reasoning text; `signature` names the provider field that
    /// carried it.
    Think { delta: String, signature: Option<String> },
    /// Incremental response text.
    Text { delta: String },
    /// Begins a tool invocation at the given slot index.
    ToolCallStart { id: String, name: String, index: u32 },
    /// Appends a raw JSON fragment to the arguments of slot `index`.
    ToolCallDelta { index: u32, arguments_delta: String },
    /// Terminal: the stream finished normally.
    Done { stop_reason: StopReason },
    /// Terminal: the provider reported an error mid-stream.
    StreamError { error: String },
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
