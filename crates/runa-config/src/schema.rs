// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Built-in system prompt used when neither config nor caller supplies one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a pragmatic software engineering assistant \
running inside the user's terminal. You can read files and run shell commands through the \
tools provided. Prefer small, verifiable steps: inspect before you change, run commands to \
confirm, and report what you did. When the task is complete, stop and summarise the outcome \
briefly.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" (chat-completions wire format, also
    /// covers compatible local servers and gateways) or "mock" (tests).
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.  Also the
    /// max-output figure the overflow check reserves for the reply.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Initial thinking level: "none" | "minimal" | "low" | "medium" |
    /// "high" | "xhigh"
    #[serde(default = "default_thinking_level")]
    pub thinking_level: String,
    /// Scenario name for the mock provider (used when provider = "mock").
    pub mock_scenario: Option<String>,
}

fn default_thinking_level() -> String {
    "medium".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            thinking_level: default_thinking_level(),
            mock_scenario: None,
        }
    }
}

fn default_idle_timeout() -> f64 {
    60.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// System prompt sent with every completion request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Seconds without a stream chunk before a stalled tool-call emission is
    /// given up on and the buffered calls are executed anyway.  Zero or
    /// negative disables the timeout.
    #[serde(default = "default_idle_timeout")]
    pub tool_call_idle_timeout_seconds: f64,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            tool_call_idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

fn default_max_turns() -> u32 {
    500
}
fn default_context_window() -> u64 {
    200_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of request/response turns per user query
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Context window assumed when the provider reports none
    #[serde(default = "default_context_window")]
    pub default_context_window: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            default_context_window: default_context_window(),
        }
    }
}

/// What the agent loop does after an overflow compaction.
///
/// `Continue` (default) injects a synthetic user message so the model keeps
/// going with the summarised history; `Pause` stops the loop and returns
/// control to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnOverflow {
    #[default]
    Continue,
    Pause,
}

impl std::fmt::Display for OnOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnOverflow::Continue => write!(f, "continue"),
            OnOverflow::Pause => write!(f, "pause"),
        }
    }
}

fn default_buffer_tokens() -> u64 {
    20_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub on_overflow: OnOverflow,
    /// Safety margin subtracted from the context window before the overflow
    /// check fires
    #[serde(default = "default_buffer_tokens")]
    pub buffer_tokens: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            on_overflow: OnOverflow::default(),
            buffer_tokens: default_buffer_tokens(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
