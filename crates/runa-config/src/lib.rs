// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::{load, LoadedConfig};
pub use schema::{
    AgentConfig, CompactionConfig, Config, LlmConfig, ModelConfig, OnOverflow,
    DEFAULT_SYSTEM_PROMPT,
};

/// Name of the per-user configuration directory under the home directory.
/// Session logs live in `<home>/<CONFIG_DIR_NAME>/sessions/<sanitized-cwd>/`.
pub const CONFIG_DIR_NAME: &str = ".runa";
