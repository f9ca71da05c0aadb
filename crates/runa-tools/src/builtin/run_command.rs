// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::sanitize::{sanitize_command, SharedRoot};
use crate::state::ExecutionState;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;

pub struct RunCommandTool {
    pub root: SharedRoot,
    pub state: Arc<ExecutionState>,
    /// Default per-call deadline; a call may raise it with `timeout_secs`.
    pub timeout_secs: u64,
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the project root.\n\n\
         IMPORTANT: this tool is for terminal operations like git, cargo, \
         make. DO NOT use it for file operations:\n\
         - DO NOT use cat, head, tail → use read_file\n\
         - DO NOT use find            → use find_file\n\
         - DO NOT use sed or awk      → use edit_file\n\n\
         A non-zero exit code is a normal result, not an error — the exit \
         code is included in the output. Quote paths that contain spaces. \
         The default timeout is 30 seconds; pass timeout_secs for slow \
         builds or tests. Avoid persistent servers or watchers; prefer \
         one-shot commands."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Deadline override in seconds"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Terminal
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(raw) = call.str_param("command") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'command'",
            );
        };
        let command = match sanitize_command(raw) {
            Ok(c) => c,
            Err(e) => {
                return ToolOutput::err(call.id, ToolErrorKind::DangerousRejected, e.to_string())
            }
        };
        let timeout = Duration::from_secs(
            call.u64_param("timeout_secs").unwrap_or(self.timeout_secs),
        );
        let root = self.root.read().unwrap().clone();

        debug!(command = %command, ?timeout, "run_command tool");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::ExternalError,
                    format!("spawn failed: {e}"),
                )
            }
            Err(_) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::Timeout,
                    format!("command timed out after {timeout:?}: {command}"),
                )
            }
        };

        self.state.record_command(command.clone());

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        if !output.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if text.len() > OUTPUT_LIMIT {
            text.truncate(OUTPUT_LIMIT);
            text.push_str("\n[... output clipped ...]");
        }
        let code = output.status.code().unwrap_or(-1);
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!("exit code: {code}"));

        // Non-zero exit is a successful tool result: the model needs the
        // output and the code to decide what to do next.
        ToolOutput::ok(call.id, text)
    }
}
