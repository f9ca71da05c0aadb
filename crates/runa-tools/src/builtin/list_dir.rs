// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::policy::ApprovalPolicy;
use crate::sanitize::{validate_path, SharedRoot};
use crate::tool::{OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

pub struct ListDirectoryTool {
    pub root: SharedRoot,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a directory inside the project root. \
         Directories are suffixed with '/'. Use this instead of describing \
         directory contents from memory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: the project root)"
                }
            },
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::File
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let raw_path = call.str_param("path").unwrap_or(".");
        let root = self.root.read().unwrap().clone();
        let path = match validate_path(&root, raw_path) {
            Ok(p) => p,
            Err(e) => {
                return ToolOutput::err(call.id, ToolErrorKind::PermissionDenied, e.to_string())
            }
        };

        let mut read_dir = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::NotFound,
                    format!("{raw_path}: no such directory"),
                );
            }
            Err(e) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::ExternalError,
                    format!("list error: {e}"),
                )
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        if entries.is_empty() {
            return ToolOutput::ok(call.id, "(empty directory)");
        }
        ToolOutput::ok(call.id, entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::CallOrigin;
    use serde_json::json;
    use std::sync::{Arc, RwLock};

    fn setup() -> (tempfile::TempDir, ListDirectoryTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = ListDirectoryTool {
            root: Arc::new(RwLock::new(dir.path().to_path_buf())),
        };
        (dir, tool)
    }

    #[tokio::test]
    async fn lists_sorted_with_dir_suffix() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let out = tool
            .execute(&ToolCall::new("list_directory", json!({}), CallOrigin::Native))
            .await;
        assert_eq!(out.output, "a/\nb.txt");
    }

    #[tokio::test]
    async fn empty_directory_is_reported() {
        let (_dir, tool) = setup();
        let out = tool
            .execute(&ToolCall::new("list_directory", json!({}), CallOrigin::Native))
            .await;
        assert_eq!(out.output, "(empty directory)");
    }

    #[tokio::test]
    async fn missing_directory_is_not_found() {
        let (_dir, tool) = setup();
        let out = tool
            .execute(&ToolCall::new(
                "list_directory",
                json!({"path": "nope"}),
                CallOrigin::Native,
            ))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::NotFound));
    }
}
