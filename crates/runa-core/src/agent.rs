// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: feed the turn executor, forward its events, persist what
//! each turn produced, and decide whether to continue.
//!
//! Each turn runs [`run_single_turn`], which streams its own events; the
//! loop persists the assistant and tool-result messages to the session,
//! accumulates usage, runs the overflow compaction check, and ends on
//! stop/error/interruption, compaction pause mode, or the turn cap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use runa_config::{Config, OnOverflow};
use runa_model::{ContentPart, Message, Provider, StopReason, Usage};
use runa_tools::ToolRegistry;

use crate::{
    compact::{generate_summary, is_overflow, CONTINUE_PROMPT},
    events::AgentEvent,
    session::Session,
    turn::{run_single_turn, TurnRequest},
};

/// Per-agent overrides on top of the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub max_turns: Option<u32>,
    pub context_window: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub system_prompt: Option<String>,
    /// Backoff schedule override for the turn executor (seconds).
    pub retry_delays: Option<Vec<u64>>,
}

/// The core agent.  Owns the session and drives the model ↔ tool loop.
pub struct Agent {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    session: Session,
    config: Arc<Config>,
    options: AgentOptions,
    system_prompt: String,
    run_usage: Usage,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        session: Session,
        config: Arc<Config>,
        options: AgentOptions,
    ) -> Self {
        let system_prompt = options
            .system_prompt
            .clone()
            .unwrap_or_else(|| config.llm.system_prompt.clone());
        Self {
            provider,
            tools,
            session,
            config,
            options,
            system_prompt,
            run_usage: Usage::default(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn add_usage(&mut self, usage: Option<&Usage>) {
        if let Some(usage) = usage {
            self.run_usage.add(usage);
        }
    }

    fn idle_timeout(&self) -> Option<Duration> {
        let timeout = self.config.llm.tool_call_idle_timeout_seconds;
        (timeout > 0.0).then(|| Duration::from_secs_f64(timeout))
    }

    /// Run one user query to completion, streaming events through `tx`.
    ///
    /// This is the single top-level error boundary: failures below it come
    /// back as `Error` events and an `AgentEnd` with `stop_reason = Error`.
    pub async fn run(
        &mut self,
        query: &str,
        images: Vec<ContentPart>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AgentEvent>,
    ) {
        self.run_usage = Usage::default();
        let mut turn = 0u32;
        let mut stop_reason = StopReason::Stop;

        if let Err(e) = self
            .drive(query, images, &cancel, &tx, &mut turn, &mut stop_reason)
            .await
        {
            let _ = tx.send(AgentEvent::Error { error: e.to_string() }).await;
            stop_reason = StopReason::Error;
        }

        let _ = tx
            .send(AgentEvent::AgentEnd {
                stop_reason,
                total_turns: turn,
                total_usage: self.run_usage,
            })
            .await;
    }

    async fn drive(
        &mut self,
        query: &str,
        images: Vec<ContentPart>,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
        turn: &mut u32,
        stop_reason: &mut StopReason,
    ) -> anyhow::Result<()> {
        let user_message = if images.is_empty() {
            Message::user(query)
        } else {
            let mut parts = vec![ContentPart::text(query)];
            parts.extend(images);
            Message::user_with_parts(parts)
        };
        self.session.append_message(user_message)?;

        let _ = tx.send(AgentEvent::AgentStart).await;

        let max_turns = self.options.max_turns.unwrap_or(self.config.agent.max_turns);
        let mut was_interrupted = false;

        while *turn < max_turns {
            if cancel.is_cancelled() {
                was_interrupted = true;
                *stop_reason = StopReason::Interrupted;
                let _ = tx
                    .send(AgentEvent::Interrupted { message: "Interrupted by user".into() })
                    .await;
                break;
            }

            *turn += 1;
            let _ = tx.send(AgentEvent::TurnStart { turn: *turn }).await;

            let provider = Arc::clone(&self.provider);
            let tools = Arc::clone(&self.tools);
            let outcome = run_single_turn(
                TurnRequest {
                    provider: provider.as_ref(),
                    messages: self.session.messages(),
                    tools: &tools,
                    system_prompt: Some(self.system_prompt.clone()),
                    turn: *turn,
                    cancel: cancel.clone(),
                    retry_delays: self.options.retry_delays.clone(),
                    idle_timeout: self.idle_timeout(),
                },
                tx,
            )
            .await;

            if let Some(message) = &outcome.assistant_message {
                if let Message::Assistant { usage, .. } = message {
                    self.add_usage(usage.as_ref());
                }
                self.session.append_message(message.clone())?;
            }
            for result in &outcome.tool_results {
                self.session.append_message(result.clone())?;
            }
            *stop_reason = outcome.stop_reason;

            if outcome.interrupted || outcome.stop_reason == StopReason::Interrupted {
                *stop_reason = StopReason::Interrupted;
                was_interrupted = true;
                break;
            }

            if self.check_compaction(*stop_reason, cancel, tx).await? {
                if self.config.compaction.on_overflow == OnOverflow::Pause {
                    break;
                }
                // Continue mode: a synthetic user message was injected, so
                // the model gets another turn regardless of the stop reason.
                continue;
            }

            if *stop_reason != StopReason::ToolUse {
                break;
            }
        }

        if *turn >= max_turns && !was_interrupted {
            *stop_reason = StopReason::Length;
        }

        Ok(())
    }

    /// Overflow check after a turn.  Returns `true` when a compaction-end
    /// event was emitted (successful or aborted).
    async fn check_compaction(
        &mut self,
        stop_reason: StopReason,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<bool> {
        if stop_reason == StopReason::Error {
            return Ok(false);
        }
        let Some(last_usage) = self.session.last_assistant_usage() else {
            return Ok(false);
        };

        let context_window = self
            .options
            .context_window
            .unwrap_or(self.config.agent.default_context_window);
        let max_output = self
            .options
            .max_output_tokens
            .or_else(|| self.provider.max_output_tokens())
            .unwrap_or(0);
        let buffer_tokens = self.config.compaction.buffer_tokens;

        if !is_overflow(&last_usage, context_window, max_output, buffer_tokens) {
            return Ok(false);
        }
        if cancel.is_cancelled() {
            return Ok(false);
        }

        let tokens_before = last_usage.total();
        let _ = tx.send(AgentEvent::CompactionStart).await;

        // Summarise from the full, uncompacted history so nothing that an
        // earlier compaction spliced away is lost twice.
        let provider = Arc::clone(&self.provider);
        match generate_summary(provider.as_ref(), &self.session.all_messages()).await {
            Ok(summary) => {
                let first_kept = self.session.leaf_id().unwrap_or_default().to_string();
                self.session
                    .append_compaction(&summary, &first_kept, tokens_before, None)?;
                if self.config.compaction.on_overflow == OnOverflow::Continue {
                    self.session.append_message(Message::user(CONTINUE_PROMPT))?;
                }
                let _ = tx
                    .send(AgentEvent::CompactionEnd { tokens_before, aborted: false })
                    .await;
            }
            Err(e) => {
                warn!("compaction summary generation failed: {e}");
                let _ = tx
                    .send(AgentEvent::CompactionEnd { tokens_before, aborted: true })
                    .await;
            }
        }
        Ok(true)
    }
}
