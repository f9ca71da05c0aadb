// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Git tools.  Status, log and diff are read-only and auto-approved;
//! committing requires an explicit message parameter and approval.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::policy::ApprovalPolicy;
use crate::sanitize::SharedRoot;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

async fn run_git(root: &SharedRoot, call_id: Uuid, args: &[&str]) -> ToolOutput {
    let root = root.read().unwrap().clone();
    debug!(?args, "git tool");
    let output = match Command::new("git")
        .arg("-C")
        .arg(&root)
        .args(args)
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            return ToolOutput::err(
                call_id,
                ToolErrorKind::ExternalError,
                format!("git spawn failed: {e}"),
            )
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr);
        return ToolOutput::err(
            call_id,
            ToolErrorKind::ExternalError,
            format!("git {}: {}", args.first().unwrap_or(&""), err.trim()),
        );
    }
    if text.trim().is_empty() {
        text = "(no output)".to_string();
    }
    ToolOutput::ok(call_id, text)
}

// ── git_status ───────────────────────────────────────────────────────────────

pub struct GitStatusTool {
    pub root: SharedRoot,
}

#[async_trait]
impl Tool for GitStatusTool {
    fn name(&self) -> &str {
        "git_status"
    }
    fn description(&self) -> &str {
        "Show the working tree status of the project repository (read-only)."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "additionalProperties": false})
    }
    fn family(&self) -> ToolFamily {
        ToolFamily::Git
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        run_git(&self.root, call.id, &["status", "--short", "--branch"]).await
    }
}

// ── git_log ──────────────────────────────────────────────────────────────────

pub struct GitLogTool {
    pub root: SharedRoot,
}

#[async_trait]
impl Tool for GitLogTool {
    fn name(&self) -> &str {
        "git_log"
    }
    fn description(&self) -> &str {
        "Show recent commits (read-only). Pass count to control how many."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": {
                    "type": "integer",
                    "description": "Number of commits to show (default 10)"
                }
            },
            "additionalProperties": false
        })
    }
    fn family(&self) -> ToolFamily {
        ToolFamily::Git
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let count = call.u64_param("count").unwrap_or(10).min(100).to_string();
        run_git(&self.root, call.id, &["log", "--oneline", "-n", &count]).await
    }
}

// ── git_diff ─────────────────────────────────────────────────────────────────

pub struct GitDiffTool {
    pub root: SharedRoot,
}

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git_diff"
    }
    fn description(&self) -> &str {
        "Show uncommitted changes (read-only). Pass staged=true for the index."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "staged": {
                    "type": "boolean",
                    "description": "Diff the index instead of the working tree"
                }
            },
            "additionalProperties": false
        })
    }
    fn family(&self) -> ToolFamily {
        ToolFamily::Git
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        if call.bool_param("staged").unwrap_or(false) {
            run_git(&self.root, call.id, &["diff", "--cached"]).await
        } else {
            run_git(&self.root, call.id, &["diff"]).await
        }
    }
}

// ── git_commit ───────────────────────────────────────────────────────────────

pub struct GitCommitTool {
    pub root: SharedRoot,
}

#[async_trait]
impl Tool for GitCommitTool {
    fn name(&self) -> &str {
        "git_commit"
    }
    fn description(&self) -> &str {
        "Commit staged changes. A commit message is REQUIRED — there is no \
         default. Pass all=true to also stage modified tracked files. Never \
         commits untracked files implicitly."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Commit message (required)"
                },
                "all": {
                    "type": "boolean",
                    "description": "Stage modified tracked files first (git commit -a)"
                }
            },
            "required": ["message"],
            "additionalProperties": false
        })
    }
    fn family(&self) -> ToolFamily {
        ToolFamily::Git
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(message) = call.str_param("message") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "git_commit requires an explicit 'message' parameter",
            );
        };
        if message.trim().is_empty() {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "commit message must not be empty",
            );
        }
        if call.bool_param("all").unwrap_or(false) {
            run_git(&self.root, call.id, &["commit", "-a", "-m", message]).await
        } else {
            run_git(&self.root, call.id, &["commit", "-m", message]).await
        }
    }
}
