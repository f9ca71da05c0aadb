// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::sanitize::{validate_path, SharedRoot};
use crate::tool::{OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

pub struct ReadFileTool {
    pub root: SharedRoot,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the project and return its content as text. \
         Use offset and limit to read a window of a large file (both are \
         line numbers; offset is 1-based). Paths outside the project root \
         are rejected."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the project root"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based first line to return (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
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

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
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

        debug!(path = %path.display(), "read_file tool");

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::NotFound,
                    format!("{raw_path}: no such file"),
                );
            }
            Err(e) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::ExternalError,
                    format!("read error: {e}"),
                )
            }
        };

        let offset = call.u64_param("offset").unwrap_or(1).max(1) as usize;
        let limit = call.u64_param("limit").map(|l| l as usize);

        let windowed = match limit {
            None if offset == 1 => content,
            _ => {
                let lines: Vec<&str> = content.lines().collect();
                let start = (offset - 1).min(lines.len());
                let end = match limit {
                    Some(l) => (start + l).min(lines.len()),
                    None => lines.len(),
                };
                lines[start..end].join("\n")
            }
        };

        ToolOutput::ok(call.id, windowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::CallOrigin;
    use serde_json::json;
    use std::sync::{Arc, RwLock};

    fn setup() -> (tempfile::TempDir, ReadFileTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool {
            root: Arc::new(RwLock::new(dir.path().to_path_buf())),
        };
        (dir, tool)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall::new("read_file", args, CallOrigin::Native)
    }

    #[tokio::test]
    async fn reads_whole_file() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("a.txt"), "hello\nworld\n").unwrap();
        let out = tool.execute(&call(json!({"file_path": "a.txt"}))).await;
        assert!(out.success, "{}", out.output);
        assert_eq!(out.output, "hello\nworld\n");
    }

    #[tokio::test]
    async fn offset_and_limit_window() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("a.txt"), "1\n2\n3\n4\n5\n").unwrap();
        let out = tool
            .execute(&call(json!({"file_path": "a.txt", "offset": 2, "limit": 2})))
            .await;
        assert_eq!(out.output, "2\n3");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, tool) = setup();
        let out = tool.execute(&call(json!({"file_path": "nope.txt"}))).await;
        assert!(!out.success);
        assert_eq!(out.error, Some(ToolErrorKind::NotFound));
    }

    #[tokio::test]
    async fn traversal_is_permission_denied() {
        let (_dir, tool) = setup();
        let out = tool
            .execute(&call(json!({"file_path": "../../etc/passwd"})))
            .await;
        assert!(!out.success);
        assert_eq!(out.error, Some(ToolErrorKind::PermissionDenied));
    }

    #[tokio::test]
    async fn missing_param_is_invalid() {
        let (_dir, tool) = setup();
        let out = tool.execute(&call(json!({}))).await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }
}
