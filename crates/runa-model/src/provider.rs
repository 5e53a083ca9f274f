// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;

use crate::{Message, StreamPart, ToolDefinition, Usage};

pub type PartStream = Pin<Box<dyn Stream<Item = StreamPart> + Send>>;

/// Error raised while opening a provider stream.
///
/// Mid-stream failures are delivered in-band as [`StreamPart::StreamError`];
/// this type only covers the request/connect phase, where the retry schedule
/// applies.  Classification lives in [`Provider::should_retry`].
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider returned HTTP 429.
    #[error("{0}")]
    RateLimited(String),
    /// Non-2xx status other than 429.
    #[error("{provider} error {status}: {body}")]
    Api { provider: String, status: u16, body: String },
    /// Connection-level failure before any response arrived.
    #[error("{0}")]
    Transport(String),
    /// The request itself was rejected as malformed (bad auth, bad params).
    #[error("{0}")]
    InvalidRequest(String),
}

/// Out-of-band state an adapter fills in while parsing the response.
///
/// Usage arrives in a late chunk and the response id in the first one, so
/// neither fits the part stream itself; the handle shares this state with
/// the parser closure.
#[derive(Debug, Default)]
pub struct StreamMeta {
    usage: Mutex<Option<Usage>>,
    response_id: Mutex<Option<String>>,
}

impl StreamMeta {
    pub fn set_usage(&self, usage: Usage) {
        *self.usage.lock().unwrap() = Some(usage);
    }

    pub fn set_response_id(&self, id: impl Into<String>) {
        *self.response_id.lock().unwrap() = Some(id.into());
    }

    pub fn usage(&self) -> Option<Usage> {
        *self.usage.lock().unwrap()
    }

    pub fn response_id(&self) -> Option<String> {
        self.response_id.lock().unwrap().clone()
    }
}

/// Handle over one streaming completion: a lazy sequence of [`StreamPart`]s
/// plus final usage and the provider-assigned response id.
pub struct StreamHandle {
    parts: PartStream,
    meta: Arc<StreamMeta>,
}

impl StreamHandle {
    pub fn new(parts: PartStream, meta: Arc<StreamMeta>) -> Self {
        Self { parts, meta }
    }

    /// Build a handle from a fixed part sequence (mocks and tests).
    pub fn from_parts(parts: Vec<StreamPart>, meta: Arc<StreamMeta>) -> Self {
        Self::new(Box::pin(futures::stream::iter(parts)), meta)
    }

    /// Next part, or `None` when the underlying stream is exhausted without
    /// a terminal part.
    pub async fn next_part(&mut self) -> Option<StreamPart> {
        self.parts.next().await
    }

    pub fn usage(&self) -> Option<Usage> {
        self.meta.usage()
    }

    pub fn response_id(&self) -> Option<String> {
        self.meta.response_id()
    }
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name())
            .field("model", &self.model())
            .finish()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider id for status display and wire selection.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model(&self) -> &str;

    /// Open a streaming completion.
    async fn stream(&self, req: StreamRequest) -> Result<StreamHandle, ProviderError>;

    /// Whether the error that prevented the stream from opening is worth a
    /// backoff retry.  Rate limits and server-side failures are transient;
    /// everything else is not.
    fn should_retry(&self, err: &ProviderError) -> bool {
        match err {
            ProviderError::RateLimited(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Thinking levels this provider understands, ordered by intensity.
    fn thinking_levels(&self) -> &[&str] {
        &[]
    }

    /// Select the thinking level for subsequent requests.  No-op for
    /// providers without a reasoning control.
    fn set_thinking_level(&self, _level: &str) {}

    /// Maximum output tokens this provider will request, from its config.
    /// The agent loop reserves this amount in the overflow check.
    fn max_output_tokens(&self) -> Option<u64> {
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
