// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Tool, ToolResult};

/// Run a shell command and capture its output.
pub struct BashTool;

#[derive(Debug, Deserialize)]
struct BashParams {
    command: String,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command with `sh -c` and return its combined stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to run" }
            },
            "required": ["command"]
        })
    }

    fn format_call(&self, args: &Value) -> String {
        serde_json::from_value::<BashParams>(args.clone())
            .map(|p| format!("$ {}", p.command))
            .unwrap_or_default()
    }

    async fn execute(&self, args: &Value, cancel: &CancellationToken) -> anyhow::Result<ToolResult> {
        let params: BashParams = match serde_json::from_value(args.clone()) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::fail(format!("Invalid arguments: {e}"))),
        };

        debug!(command = %params.command, "running shell command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&params.command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // Dropping the wait future on cancellation must not leak the
            // process.
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(ToolResult::fail("Command cancelled"));
            }
            output = child.wait_with_output() => output?,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        if output.status.success() {
            Ok(ToolResult::ok(text))
        } else {
            let code = output.status.code().unwrap_or(-1);
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("(exit code {code})"));
            Ok(ToolResult::fail(text))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &str) -> Value {
        json!({ "command": command })
    }

    #[tokio::test]
    async fn captures_stdout() {
        let out = BashTool
            .execute(&args("echo hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.result.as_deref().map(str::trim), Some("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_error() {
        let out = BashTool
            .execute(&args("exit 3"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.result.unwrap().contains("exit code 3"));
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let out = BashTool
            .execute(&args("echo oops 1>&2"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.result.unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_the_command() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = BashTool
            .execute(&args("sleep 30"), &cancel)
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.result.unwrap().contains("cancelled"));
    }

    #[test]
    fn format_call_prefixes_prompt() {
        assert_eq!(BashTool.format_call(&args("ls -la")), "$ ls -la");
    }
}
