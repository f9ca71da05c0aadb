// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::backups::BackupStore;
use crate::policy::ApprovalPolicy;
use crate::sanitize::{validate_path, SharedRoot};
use crate::state::ExecutionState;
use crate::tool::{Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

pub struct WriteFileTool {
    pub root: SharedRoot,
    pub backups: Arc<BackupStore>,
    pub state: Arc<ExecutionState>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file inside the project root, overwriting any existing \
         content. ALWAYS prefer editing existing files with edit_file. \
         Parent directories are created automatically. The previous content \
         is backed up and can be restored with undo_edit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the project root"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["file_path", "content"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::File
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(raw_path) = call.str_param("file_path") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'file_path'",
            );
        };
        let Some(content) = call.str_param("content") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'content'",
            );
        };

        let root = self.root.read().unwrap().clone();
        let path = match validate_path(&root, raw_path) {
            Ok(p) => p,
            Err(e) => {
                return ToolOutput::err(call.id, ToolErrorKind::PermissionDenied, e.to_string())
            }
        };

        debug!(path = %path.display(), bytes = content.len(), "write_file tool");

        if let Err(e) = self.backups.backup(&path) {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("backup failed: {e}"),
            );
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        match tokio::fs::write(&path, content).await {
            Ok(()) => {
                self.state.record_write(path.clone());
                ToolOutput::ok(
                    call.id,
                    format!("wrote {} bytes to {}", content.len(), path.display()),
                )
            }
            Err(e) => ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("write error: {e}"),
            ),
        }
    }
}
