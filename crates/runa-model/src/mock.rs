// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scenario-driven mock provider for tests.
//!
//! Each named scenario yields a fixed stream-part sequence (or a scripted
//! open failure) so agent-loop and turn-executor tests are deterministic and
//! need no network access.
//!
//! Scenarios:
//! - `default`: thinking → text → two tool calls
//! - `simple_text`: just text, no thinking or tools
//! - `thinking_text_tool`: thinking → text → single tool call
//! - `retries`: fail twice at open, then succeed with the default flow
//! - `retry_exhausted`: always fail at open
//! - `non_retryable`: fail at open with a non-retryable error
//! - `stream_error`: emit a stream error mid-response
//! - `unknown_tool`: call a tool that is not registered
//! - `long_text`: multiple text chunks
//! - `tool_hang`: emit a tool call and then never terminate the stream
//! - `tool_with_many_chunks`: tool call with many argument chunks for
//!   token-count throttling tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use crate::{
    provider::{PartStream, Provider, ProviderError, StreamHandle, StreamMeta, StreamRequest},
    StopReason, StreamPart, Usage,
};

pub struct MockProvider {
    scenario: String,
    attempts: AtomicU32,
    max_output_tokens: Option<u64>,
}

impl MockProvider {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            attempts: AtomicU32::new(0),
            max_output_tokens: None,
        }
    }

    /// Declare a max-output figure, for overflow-check tests.
    pub fn with_max_output_tokens(mut self, tokens: u64) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    fn parts(&self) -> PartStream {
        scenario_parts(&self.scenario)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn thinking_levels(&self) -> &[&str] {
        &["none", "low", "medium", "high"]
    }

    fn max_output_tokens(&self) -> Option<u64> {
        self.max_output_tokens
    }

    async fn stream(&self, _req: StreamRequest) -> Result<StreamHandle, ProviderError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        match self.scenario.as_str() {
            "retries" if attempt < 3 => {
                return Err(ProviderError::Transport("Rate limit".into()));
            }
            "retry_exhausted" => {
                return Err(ProviderError::Transport("Always fails".into()));
            }
            "non_retryable" => {
                return Err(ProviderError::InvalidRequest("Invalid input".into()));
            }
            _ => {}
        }

        let meta = Arc::new(StreamMeta::default());
        meta.set_usage(Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 2,
            cache_write_tokens: 0,
        });
        meta.set_response_id("mock-1");

        Ok(StreamHandle::new(self.parts(), meta))
    }

    fn should_retry(&self, err: &ProviderError) -> bool {
        match self.scenario.as_str() {
            "retries" | "retry_exhausted" => matches!(err, ProviderError::Transport(_)),
            _ => false,
        }
    }
}

fn default_flow() -> Vec<StreamPart> {
    vec![
        StreamPart::Think { delta: "Let me think about this...".into(), signature: None },
        StreamPart::Text { delta: "I'll help you with that.".into() },
        StreamPart::ToolCallStart { id: "call-1".into(), name: "read".into(), index: 0 },
        StreamPart::ToolCallDelta { index: 0, arguments_delta: r#"{"path": "file.txt"}"#.into() },
        StreamPart::ToolCallStart { id: "call-2".into(), name: "bash".into(), index: 1 },
        StreamPart::ToolCallDelta { index: 1, arguments_delta: r#"{"command": "ls -la"}"#.into() },
        StreamPart::Done { stop_reason: StopReason::ToolUse },
    ]
}

fn scenario_parts(scenario: &str) -> PartStream {
    match scenario {
        "simple_text" => Box::pin(stream::iter(vec![
            StreamPart::Text { delta: "Hello, world!".into() },
            StreamPart::Done { stop_reason: StopReason::Stop },
        ])),

        "thinking_text_tool" => Box::pin(stream::iter(vec![
            StreamPart::Think { delta: "I need to read the file".into(), signature: None },
            StreamPart::Text { delta: "Let me check the file.".into() },
            StreamPart::ToolCallStart { id: "call-1".into(), name: "read".into(), index: 0 },
            StreamPart::ToolCallDelta { index: 0, arguments_delta: r#"{"path": "test.txt"}"#.into() },
            StreamPart::Done { stop_reason: StopReason::ToolUse },
        ])),

        "stream_error" => Box::pin(stream::iter(vec![
            StreamPart::Text { delta: "Before error".into() },
            StreamPart::StreamError { error: "Something went wrong".into() },
        ])),

        "unknown_tool" => Box::pin(stream::iter(vec![
            StreamPart::ToolCallStart { id: "call-1".into(), name: "unknown_tool".into(), index: 0 },
            StreamPart::ToolCallDelta { index: 0, arguments_delta: r#"{"arg": "value"}"#.into() },
            StreamPart::Done { stop_reason: StopReason::ToolUse },
        ])),

        "long_text" => {
            let chunks = ["This ", "is ", "a ", "long ", "response", "."]
                .into_iter()
                .map(|c| StreamPart::Text { delta: c.into() })
                .chain(std::iter::once(StreamPart::Done { stop_reason: StopReason::Stop }))
                .collect::<Vec<_>>();
            Box::pin(stream::iter(chunks))
        }

        // Tool call fully emitted, then the stream stalls forever; only the
        // idle timeout can recover the turn.
        "tool_hang" => Box::pin(
            stream::iter(vec![
                StreamPart::ToolCallStart { id: "call-1".into(), name: "read".into(), index: 0 },
                StreamPart::ToolCallDelta { index: 0, arguments_delta: r#"{"path": "test.txt"}"#.into() },
            ])
            .chain(stream::pending()),
        ),

        "tool_with_many_chunks" => {
            let mut parts = vec![StreamPart::ToolCallStart {
                id: "call-1".into(),
                name: "bash".into(),
                index: 0,
            }];
            // 23 seven-char chunks plus one eight-char tail, enough to cross
            // the token display threshold and land on an update interval.
            for c in b'a'..=b'w' {
                parts.push(StreamPart::ToolCallDelta {
                    index: 0,
                    arguments_delta: (c as char).to_string().repeat(7),
                });
            }
            parts.push(StreamPart::ToolCallDelta { index: 0, arguments_delta: "x".repeat(8) });
            parts.push(StreamPart::Done { stop_reason: StopReason::ToolUse });
            Box::pin(stream::iter(parts))
        }

        _ => Box::pin(stream::iter(default_flow())),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
