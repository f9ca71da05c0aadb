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
use crate::tool::{Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

pub struct DeleteFileTool {
    pub root: SharedRoot,
    pub backups: Arc<BackupStore>,
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file inside the project root. The content is backed up \
         first and can be restored with undo_edit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to delete"
                }
            },
            "required": ["file_path"],
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
        let root = self.root.read().unwrap().clone();
        let path = match validate_path(&root, raw_path) {
            Ok(p) => p,
            Err(e) => {
                return ToolOutput::err(call.id, ToolErrorKind::PermissionDenied, e.to_string())
            }
        };

        if !path.is_file() {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::NotFound,
                format!("{raw_path}: no such file"),
            );
        }

        debug!(path = %path.display(), "delete_file tool");

        // Backup before removal — delete must always be reversible.
        if let Err(e) = self.backups.backup(&path) {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("backup failed: {e}"),
            );
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => ToolOutput::ok(call.id, format!("deleted {}", path.display())),
            Err(e) => ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("delete error: {e}"),
            ),
        }
    }
}
