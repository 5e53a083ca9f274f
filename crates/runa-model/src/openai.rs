// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-style chat-completions adapter.
//!
//! Speaks the `/chat/completions` SSE streaming wire format used by OpenAI
//! and by the large family of compatible servers and gateways (local
//! llama.cpp/vLLM servers, Z.AI, Qwen deployments, aggregators).  Dialect
//! differences are captured in [`CompatFlags`] and detected from the
//! provider id, base URL, and model name.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use runa_config::ModelConfig;

use crate::{
    provider::{PartStream, Provider, ProviderError, StreamHandle, StreamMeta, StreamRequest},
    AssistantPart, ContentPart, Message, StopReason, StreamPart, ToolDefinition, UserContent,
    Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const THINKING_LEVELS: &[&str] = &["none", "minimal", "low", "medium", "high", "xhigh"];

/// Which body field carries the output-token cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTokensField {
    MaxTokens,
    MaxCompletionTokens,
}

impl MaxTokensField {
    fn as_str(self) -> &'static str {
        match self {
            MaxTokensField::MaxTokens => "max_tokens",
            MaxTokensField::MaxCompletionTokens => "max_completion_tokens",
        }
    }
}

/// Which payload shape toggles reasoning for this dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingFormat {
    /// `reasoning_effort: "<level>"` request parameter.
    OpenAi,
    /// `thinking: {"type": "enabled"}` body object.
    Zai,
    /// `enable_thinking: true|false` body flag.
    Qwen,
}

/// Dialect switches for chat-completions-compatible providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatFlags {
    pub supports_store: bool,
    pub supports_developer_role: bool,
    pub supports_reasoning_effort: bool,
    pub max_tokens_field: MaxTokensField,
    pub thinking_format: ThinkingFormat,
}

impl Default for CompatFlags {
    fn default() -> Self {
        Self {
            supports_store: true,
            supports_developer_role: true,
            supports_reasoning_effort: true,
            max_tokens_field: MaxTokensField::MaxCompletionTokens,
            thinking_format: ThinkingFormat::OpenAi,
        }
    }
}

/// Pick the dialect from provider id, base URL, and model name.
pub fn detect_compat(provider: &str, base_url: &str, model: &str) -> CompatFlags {
    let is_zai = provider == "zai" || provider == "zhipu" || base_url.contains("api.z.ai");
    let model_lc = model.to_lowercase();
    let is_qwen = model_lc.contains("qwen") || model_lc.contains("qwq");

    if is_zai {
        return CompatFlags {
            supports_store: false,
            supports_developer_role: false,
            supports_reasoning_effort: false,
            thinking_format: ThinkingFormat::Zai,
            ..CompatFlags::default()
        };
    }
    if is_qwen {
        return CompatFlags {
            supports_store: false,
            supports_developer_role: false,
            supports_reasoning_effort: false,
            max_tokens_field: MaxTokensField::MaxTokens,
            thinking_format: ThinkingFormat::Qwen,
        };
    }
    CompatFlags::default()
}

pub struct OpenAiCompletionsProvider {
    model: String,
    chat_url: String,
    api_key: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    thinking_level: Mutex<String>,
    compat: CompatFlags,
    client: reqwest::Client,
}

impl OpenAiCompletionsProvider {
    pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Self> {
        let base = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());
        let base = base.trim_end_matches('/').to_string();
        let compat = detect_compat(&cfg.provider, &base, &cfg.name);

        // Canonical env var follows the detected dialect, so `provider: zai`
        // (or a z.ai base URL) works with only ZAI_API_KEY exported.
        let canonical_env = if compat.thinking_format == ThinkingFormat::Zai {
            "ZAI_API_KEY"
        } else {
            "OPENAI_API_KEY"
        };
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| cfg.api_key_env.as_deref().and_then(|v| std::env::var(v).ok()))
            .or_else(|| std::env::var(canonical_env).ok());
        let Some(api_key) = api_key else {
            anyhow::bail!(
                "No API key found for {}. Set {canonical_env} or provide api_key in config.",
                cfg.provider
            );
        };
        Ok(Self {
            model: cfg.name.clone(),
            chat_url: format!("{base}/chat/completions"),
            api_key,
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            thinking_level: Mutex::new(cfg.thinking_level.clone()),
            compat,
            client: reqwest::Client::new(),
        })
    }

    fn build_body(&self, req: &StreamRequest) -> Value {
        let compat = self.compat;
        let messages = build_wire_messages(&req.messages, req.system_prompt.as_deref(), compat);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if compat.supports_store {
            body["store"] = json!(false);
        }
        if let Some(temp) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(temp);
        }
        if let Some(max_tok) = req.max_tokens.or(self.max_tokens) {
            body[compat.max_tokens_field.as_str()] = json!(max_tok);
        }
        if let Some(tools) = &req.tools {
            if !tools.is_empty() {
                body["tools"] = json!(tools.iter().map(wire_tool).collect::<Vec<_>>());
            }
        }

        let level = self.thinking_level.lock().unwrap().clone();
        match compat.thinking_format {
            ThinkingFormat::Zai => {
                if level != "none" {
                    body["thinking"] = json!({ "type": "enabled" });
                }
            }
            ThinkingFormat::Qwen => {
                body["enable_thinking"] = json!(level != "none");
            }
            ThinkingFormat::OpenAi => {
                if compat.supports_reasoning_effort && level != "none" {
                    body["reasoning_effort"] = json!(level);
                }
            }
        }

        body
    }
}

#[async_trait]
impl Provider for OpenAiCompletionsProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn thinking_levels(&self) -> &[&str] {
        THINKING_LEVELS
    }

    fn set_thinking_level(&self, level: &str) {
        *self.thinking_level.lock().unwrap() = level.to_string();
    }

    fn max_output_tokens(&self) -> Option<u64> {
        self.max_tokens.map(u64::from)
    }

    async fn stream(&self, req: StreamRequest) -> Result<StreamHandle, ProviderError> {
        let body = self.build_body(&req);

        debug!(
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = req.tools.as_ref().map(Vec::len).unwrap_or(0),
            "sending completion request"
        );

        let resp = self
            .client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited(body));
            }
            return Err(ProviderError::Api {
                provider: "openai".into(),
                status: status.as_u16(),
                body,
            });
        }

        let meta = Arc::new(StreamMeta::default());
        let parser_meta = Arc::clone(&meta);

        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks and parse only complete lines; the finish_reason seen
        // so far rides along so the [DONE] sentinel can emit the right
        // terminal part.
        let parts: PartStream = Box::pin(
            resp.bytes_stream()
                .scan(
                    (String::new(), StopReason::Stop),
                    move |(buf, stop), chunk| {
                        let parts: Vec<StreamPart> = match chunk {
                            Ok(bytes) => {
                                buf.push_str(&String::from_utf8_lossy(&bytes));
                                drain_complete_sse_lines(buf, stop, &parser_meta)
                            }
                            Err(e) => {
                                vec![StreamPart::StreamError { error: e.to_string() }]
                            }
                        };
                        std::future::ready(Some(parts))
                    },
                )
                .flat_map(futures::stream::iter),
        );

        Ok(StreamHandle::new(parts, meta))
    }
}

fn wire_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn data_url(mime_type: &str, data: &str) -> String {
    format!("data:{mime_type};base64,{data}")
}

/// Convert the conversation into the chat-completions JSON message array.
///
/// Free function so the wire mapping can be unit-tested without HTTP.
/// Images inside tool results cannot ride on the `tool` role, so they are
/// collected and re-sent as a follow-up user message.
pub fn build_wire_messages(
    messages: &[Message],
    system_prompt: Option<&str>,
    compat: CompatFlags,
) -> Vec<Value> {
    let mut result = Vec::new();

    if let Some(prompt) = system_prompt {
        let role = if compat.supports_developer_role { "developer" } else { "system" };
        result.push(json!({ "role": role, "content": prompt }));
    }

    fn flush_images(result: &mut Vec<Value>, pending: &mut Vec<Value>) {
        if pending.is_empty() {
            return;
        }
        let mut parts = vec![json!({ "type": "text", "text": "Attached image(s) from tool result:" })];
        parts.append(pending);
        result.push(json!({ "role": "user", "content": parts }));
    }

    let mut pending_images: Vec<Value> = Vec::new();

    for msg in messages {
        match msg {
            Message::User { content } => {
                flush_images(&mut result, &mut pending_images);
                result.push(wire_user_message(content));
            }
            Message::Assistant { content, .. } => {
                flush_images(&mut result, &mut pending_images);
                result.push(wire_assistant_message(content));
            }
            Message::ToolResult { tool_call_id, content, .. } => {
                result.push(wire_tool_result(tool_call_id, content));
                for part in content {
                    if let ContentPart::Image { mime_type, data } = part {
                        pending_images.push(json!({
                            "type": "image_url",
                            "image_url": { "url": data_url(mime_type, data) },
                        }));
                    }
                }
            }
        }
    }
    flush_images(&mut result, &mut pending_images);

    result
}

fn wire_user_message(content: &UserContent) -> Value {
    match content {
        UserContent::Text(text) => json!({ "role": "user", "content": text }),
        UserContent::Parts(parts) => {
            let wire: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::Image { mime_type, data } => json!({
                        "type": "image_url",
                        "image_url": { "url": data_url(mime_type, data) },
                    }),
                })
                .collect();
            json!({ "role": "user", "content": wire })
        }
    }
}

fn wire_assistant_message(content: &[AssistantPart]) -> Value {
    let mut text_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    // Thinking grouped per reasoning field so each provider dialect gets its
    // own text back under the field it originally used.
    let mut thinking_by_field: Vec<(String, String)> = Vec::new();

    for part in content {
        match part {
            AssistantPart::Text { text } => {
                if !text.trim().is_empty() {
                    text_parts.push(json!({ "type": "text", "text": text }));
                }
            }
            AssistantPart::Thinking { thinking, signature } => {
                if thinking.trim().is_empty() {
                    continue;
                }
                let field = signature.as_deref().unwrap_or("reasoning_content");
                match thinking_by_field.iter_mut().find(|(f, _)| f == field) {
                    Some((_, buf)) => {
                        buf.push('\n');
                        buf.push_str(thinking);
                    }
                    None => thinking_by_field.push((field.to_string(), thinking.clone())),
                }
            }
            AssistantPart::ToolCall { id, name, arguments } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments.to_string() },
                }));
            }
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return json!({ "role": "assistant", "content": "" });
    }

    let content_value = if text_parts.is_empty() { Value::Null } else { json!(text_parts) };
    let mut result = json!({ "role": "assistant", "content": content_value });
    for (field, text) in thinking_by_field {
        result[field] = json!(text);
    }
    if !tool_calls.is_empty() {
        result["tool_calls"] = json!(tool_calls);
    }
    result
}

fn wire_tool_result(tool_call_id: &str, content: &[ContentPart]) -> Value {
    let texts: Vec<&str> = content
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let has_images = content.iter().any(|p| matches!(p, ContentPart::Image { .. }));

    let body = if !texts.is_empty() {
        texts.join("\n")
    } else if has_images {
        "(see attached image)".to_string()
    } else {
        "(no output)".to_string()
    };

    json!({ "role": "tool", "tool_call_id": tool_call_id, "content": body })
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// A trailing incomplete line stays in `buf` to be extended by the next TCP
/// chunk.
fn drain_complete_sse_lines(
    buf: &mut String,
    stop: &mut StopReason,
    meta: &StreamMeta,
) -> Vec<StreamPart> {
    let mut parts = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        parts.extend(parse_sse_data_line(&line, stop, meta));
    }
    parts
}

fn parse_sse_data_line(line: &str, stop: &mut StopReason, meta: &StreamMeta) -> Vec<StreamPart> {
    let Some(data) = line.strip_prefix("data: ") else {
        return Vec::new();
    };
    let data = data.trim();
    if data.is_empty() {
        return Vec::new();
    }
    if data == "[DONE]" {
        return vec![StreamPart::Done { stop_reason: *stop }];
    }
    match serde_json::from_str::<Value>(data) {
        Ok(v) => parse_sse_chunk(&v, stop, meta),
        Err(_) => Vec::new(),
    }
}

fn parse_sse_chunk(v: &Value, stop: &mut StopReason, meta: &StreamMeta) -> Vec<StreamPart> {
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let cache_read = usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        meta.set_usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: cache_read,
            cache_write_tokens: 0,
        });
    }

    if let Some(id) = v.get("id").and_then(Value::as_str) {
        if !id.is_empty() {
            meta.set_response_id(id);
        }
    }

    let mut parts = Vec::new();
    let Some(choice) = v.pointer("/choices/0") else {
        return parts;
    };

    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        *stop = map_finish_reason(reason);
    }

    let delta = &choice["delta"];

    // Reasoning deltas arrive under dialect-specific field names; the field
    // that carried the text becomes the thinking signature so it can be
    // echoed back verbatim on later requests.
    for field in ["reasoning_content", "reasoning", "reasoning_text"] {
        if let Some(reasoning) = delta.get(field).and_then(Value::as_str) {
            if !reasoning.is_empty() {
                parts.push(StreamPart::Think {
                    delta: reasoning.to_string(),
                    signature: Some(field.to_string()),
                });
                break;
            }
        }
    }

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            parts.push(StreamPart::Text { delta: text.to_string() });
        }
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in tool_calls {
            let Some(index) = tc.get("index").and_then(Value::as_u64) else {
                continue;
            };
            let index = index as u32;
            let function = &tc["function"];
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                if !name.is_empty() {
                    parts.push(StreamPart::ToolCallStart {
                        id: tc.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                        name: name.to_string(),
                        index,
                    });
                }
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                if !args.is_empty() {
                    parts.push(StreamPart::ToolCallDelta {
                        index,
                        arguments_delta: args.to_string(),
                    });
                }
            }
        }
    }

    parts
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::Length,
        "tool_calls" => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
