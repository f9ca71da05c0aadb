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

pub struct UndoEditTool {
    pub root: SharedRoot,
    pub backups: Arc<BackupStore>,
}

#[async_trait]
impl Tool for UndoEditTool {
    fn name(&self) -> &str {
        "undo_edit"
    }

    fn description(&self) -> &str {
        "Restore a file to its state before the most recent write_file, \
         edit_file or delete_file operation. A file that did not exist \
         before the operation is removed again."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to restore"
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
        ApprovalPolicy::Auto
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

        debug!(path = %path.display(), "undo_edit tool");

        match self.backups.undo(&path) {
            Ok(true) => ToolOutput::ok(call.id, format!("restored {}", path.display())),
            Ok(false) => ToolOutput::err(
                call.id,
                ToolErrorKind::NotFound,
                format!("no backup recorded for {raw_path}"),
            ),
            Err(e) => ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("restore failed: {e}"),
            ),
        }
    }
}
