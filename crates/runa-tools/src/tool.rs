// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// An image produced by a tool: MIME type plus base64 payload.
///
/// Kept free of the model crate's content types so tools stay independent of
/// any provider wire format; the executor maps these into message content.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolImage {
    pub mime_type: String,
    pub data: String,
}

/// The result of executing a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// `false` marks the result as an error for the model (is_error on the
    /// tool-result message); the turn itself continues either way.
    pub success: bool,
    /// Plain-text output, if any.
    pub result: Option<String>,
    /// Images to attach to the tool result.
    pub images: Vec<ToolImage>,
    /// Pre-rendered display string for UIs.
    pub display: Option<String>,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self { success: true, result: Some(text.into()), ..Default::default() }
    }

    pub fn fail(text: impl Into<String>) -> Self {
        Self { success: false, result: Some(text.into()), ..Default::default() }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }
}

/// Trait every built-in and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object
    fn parameters_schema(&self) -> Value;

    /// Render a one-line display string for the given (already parsed)
    /// arguments.  Must not fail: return an empty string for arguments that
    /// don't validate.
    fn format_call(&self, _args: &Value) -> String {
        String::new()
    }

    /// Execute the tool.  Expected failures (missing file, non-zero exit)
    /// should come back as `Ok(ToolResult::fail(..))`; `Err` is reserved for
    /// unexpected breakage and is reported as an execution error by the
    /// caller.  `cancel` fires when the user interrupts the run.
    async fn execute(&self, args: &Value, cancel: &CancellationToken) -> anyhow::Result<ToolResult>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
