// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod mock;
mod openai;
mod provider;
mod types;

pub use mock::MockProvider;
pub use openai::{
    build_wire_messages, detect_compat, CompatFlags, MaxTokensField, OpenAiCompletionsProvider,
    ThinkingFormat,
};
pub use provider::{
    PartStream, Provider, ProviderError, StreamHandle, StreamMeta, StreamRequest,
};
pub use types::*;

use std::sync::Arc;

use runa_config::ModelConfig;

/// Construct a shared [`Provider`] from configuration.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn Provider>> {
    match cfg.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiCompletionsProvider::from_config(cfg)?)),
        "mock" => Ok(Arc::new(MockProvider::new(
            cfg.mock_scenario.as_deref().unwrap_or("default"),
        ))),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_builds_mock_provider() {
        let cfg = ModelConfig {
            provider: "mock".into(),
            name: "mock-model".into(),
            mock_scenario: Some("simple_text".into()),
            ..Default::default()
        };
        let provider = from_config(&cfg).unwrap();
        assert_eq!(provider.name(), "mock");
        assert_eq!(provider.model(), "mock-model");
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        let cfg = ModelConfig { provider: "nope".into(), ..Default::default() };
        let err = from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }
}
