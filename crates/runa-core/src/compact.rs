// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Overflow detection and summary generation for session compaction.
//!
//! The session log itself is never rewritten: the agent appends a compaction
//! entry carrying the summary, and the compacted view splices it in as a
//! synthetic "What did we do so far?" exchange.

use runa_model::{Message, Provider, StopReason, StreamPart, StreamRequest, Usage};

/// Synthesis instruction used as the system prompt for summary generation.
pub const SUMMARY_PROMPT: &str = "You are summarising a coding-assistant session so it can \
continue in a fresh context. Write a dense, factual summary of the conversation so far: the \
user's goals, what was inspected or changed (with file paths), key decisions and their \
reasons, results of commands that were run, and anything still unfinished. Write plain prose, \
no preamble, no headings. Do not address the user.";

/// Synthetic user message injected after a compaction in continue mode.
pub const CONTINUE_PROMPT: &str = "Continue if you have next steps, or stop and ask for \
clarification if you are unsure how to proceed. If there is nothing to do don't add a large \
preamble, just summarise everything so far in 2-3 lines and be done.";

/// Opening of the synthetic exchange the compacted view prepends.
pub const COMPACTION_QUESTION: &str = "What did we do so far?";

/// Predicted next-request size exceeds the window minus the reply reserve
/// and safety buffer.
pub fn is_overflow(usage: &Usage, context_window: u64, max_output: u64, buffer_tokens: u64) -> bool {
    usage.input_tokens + usage.output_tokens + max_output + buffer_tokens >= context_window
}

/// Ask the provider for a summary of the full (uncompacted) history.
///
/// No tools are passed and no retry schedule applies; a failed call aborts
/// the compaction and leaves the session untouched.
pub async fn generate_summary(
    provider: &dyn Provider,
    messages: &[Message],
) -> anyhow::Result<String> {
    let req = StreamRequest {
        messages: messages.to_vec(),
        system_prompt: Some(SUMMARY_PROMPT.to_string()),
        ..Default::default()
    };
    let mut stream = provider.stream(req).await?;

    let mut summary = String::new();
    while let Some(part) = stream.next_part().await {
        match part {
            StreamPart::Text { delta } => summary.push_str(&delta),
            StreamPart::StreamError { error } => {
                anyhow::bail!("summary generation failed: {error}")
            }
            StreamPart::Done { stop_reason: StopReason::Error } => {
                anyhow::bail!("summary generation failed")
            }
            StreamPart::Done { .. } => break,
            _ => {}
        }
    }
    Ok(summary.trim().to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_model::MockProvider;

    #[test]
    fn overflow_at_exact_boundary() {
        let usage = Usage { input_tokens: 150_000, output_tokens: 10_000, ..Default::default() };
        // 150k + 10k + 20k + 20k = 200k >= 200k
        assert!(is_overflow(&usage, 200_000, 20_000, 20_000));
    }

    #[test]
    fn no_overflow_below_boundary() {
        let usage = Usage { input_tokens: 100_000, output_tokens: 10_000, ..Default::default() };
        assert!(!is_overflow(&usage, 200_000, 20_000, 20_000));
    }

    #[test]
    fn cache_tokens_do_not_count_toward_overflow() {
        // Only input + output predict the next request size; cached reads are
        // already included in input_tokens by providers that report both.
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 1_000_000,
            ..Default::default()
        };
        assert!(!is_overflow(&usage, 200_000, 0, 0));
    }

    #[tokio::test]
    async fn generate_summary_collects_text_parts() {
        let provider = MockProvider::new("long_text");
        let summary = generate_summary(&provider, &[Message::user("hi")]).await.unwrap();
        assert_eq!(summary, "This is a long response.");
    }

    #[tokio::test]
    async fn generate_summary_fails_on_stream_error() {
        let provider = MockProvider::new("stream_error");
        let err = generate_summary(&provider, &[]).await.unwrap_err();
        assert!(err.to_string().contains("Something went wrong"));
    }

    #[tokio::test]
    async fn generate_summary_fails_when_stream_cannot_open() {
        let provider = MockProvider::new("retry_exhausted");
        assert!(generate_summary(&provider, &[]).await.is_err());
    }
}
