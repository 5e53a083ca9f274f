// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{Tool, ToolResult};

/// Read a text file, optionally windowed by line offset and limit.
pub struct ReadTool;

#[derive(Debug, Deserialize)]
struct ReadParams {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file. Returns the file contents, optionally limited to a line range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path of the file to read" },
                "offset": { "type": "integer", "description": "1-based line to start from" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return" }
            },
            "required": ["path"]
        })
    }

    fn format_call(&self, args: &Value) -> String {
        serde_json::from_value::<ReadParams>(args.clone())
            .map(|p| format!("read {}", p.path))
            .unwrap_or_default()
    }

    async fn execute(&self, args: &Value, _cancel: &CancellationToken) -> anyhow::Result<ToolResult> {
        let params: ReadParams = match serde_json::from_value(args.clone()) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::fail(format!("Invalid arguments: {e}"))),
        };

        let text = match tokio::fs::read_to_string(&params.path).await {
            Ok(t) => t,
            Err(e) => return Ok(ToolResult::fail(format!("Cannot read {}: {e}", params.path))),
        };

        let body = match (params.offset, params.limit) {
            (None, None) => text,
            (offset, limit) => {
                let start = offset.unwrap_or(1).saturating_sub(1);
                let lines = text.lines().skip(start);
                let window: Vec<&str> = match limit {
                    Some(n) => lines.take(n).collect(),
                    None => lines.collect(),
                };
                window.join("\n")
            }
        };

        Ok(ToolResult::ok(body))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(path: &str) -> Value {
        json!({ "path": path })
    }

    #[tokio::test]
    async fn reads_whole_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "line one\nline two").unwrap();
        let out = ReadTool
            .execute(&args(f.path().to_str().unwrap()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.result.unwrap().contains("line two"));
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error_not_a_panic() {
        let out = ReadTool
            .execute(&args("/definitely/not/here.txt"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.result.unwrap().contains("Cannot read"));
    }

    #[tokio::test]
    async fn offset_and_limit_window_lines() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "a\nb\nc\nd\n").unwrap();
        let out = ReadTool
            .execute(
                &json!({ "path": f.path().to_str().unwrap(), "offset": 2, "limit": 2 }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.result.as_deref(), Some("b\nc"));
    }

    #[test]
    fn format_call_shows_path() {
        assert_eq!(ReadTool.format_call(&args("src/main.rs")), "read src/main.rs");
        assert_eq!(ReadTool.format_call(&json!({ "wrong": 1 })), "");
    }
}
