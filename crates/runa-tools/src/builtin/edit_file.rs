// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::{ChangeTag, TextDiff};
use tracing::debug;

use crate::backups::BackupStore;
use crate::policy::ApprovalPolicy;
use crate::sanitize::{validate_path, SharedRoot};
use crate::state::ExecutionState;
use crate::tool::{Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

/// String replacement editor.
///
/// Replaces the **first** occurrence of `old` with `new`; replacing every
/// occurrence requires an explicit `all: true`.  When `old` is not found the
/// error carries the nearest-matching region of the file so the model can
/// correct its context instead of re-reading blind.
pub struct EditFileTool {
    pub root: SharedRoot,
    pub backups: Arc<BackupStore>,
    pub state: Arc<ExecutionState>,
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by exact string replacement.\n\
         \n\
         Rules:\n\
         • 'old' must match the file content exactly, including whitespace.\n\
         • Only the FIRST occurrence is replaced unless all=true is set.\n\
         • If 'old' appears more than once and all is not set, include more\n\
           surrounding context in 'old' to pin the intended occurrence.\n\
         • Re-read the file after a previous edit before building new context.\n\
         The previous content is backed up and can be restored with undo_edit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false: first only)"
                }
            },
            "required": ["file_path", "old", "new"],
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
        let Some(old) = call.str_param("old") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'old'",
            );
        };
        let Some(new) = call.str_param("new") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'new'",
            );
        };
        if old.is_empty() {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "'old' must not be empty",
            );
        }
        let replace_all = call.bool_param("all").unwrap_or(false);

        let root = self.root.read().unwrap().clone();
        let path = match validate_path(&root, raw_path) {
            Ok(p) => p,
            Err(e) => {
                return ToolOutput::err(call.id, ToolErrorKind::PermissionDenied, e.to_string())
            }
        };

        debug!(path = %path.display(), replace_all, "edit_file tool");

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

        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                not_found_message(&content, old),
            );
        }

        if let Err(e) = self.backups.backup(&path) {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("backup failed: {e}"),
            );
        }

        let (updated, replaced) = if replace_all {
            (content.replace(old, new), occurrences)
        } else {
            (content.replacen(old, new, 1), 1)
        };

        match tokio::fs::write(&path, &updated).await {
            Ok(()) => {
                self.state.record_write(path.clone());
                let note = if !replace_all && occurrences > 1 {
                    format!(
                        "replaced 1 of {occurrences} occurrences (pass all=true or add \
                         context to target a different one)"
                    )
                } else {
                    format!("replaced {replaced} occurrence(s)")
                };
                ToolOutput::ok(call.id, note)
            }
            Err(e) => ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("write error: {e}"),
            ),
        }
    }
}

/// Similarity ratio in [0,1] using character-level diff (2×matches / total).
fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let diff = TextDiff::from_chars(a, b);
    let matching: usize = diff
        .iter_all_changes()
        .filter(|c| c.tag() == ChangeTag::Equal)
        .map(|c| c.value().len())
        .sum();
    (matching * 2) as f64 / total as f64
}

/// Build the "context not found" error, pointing at the most similar window
/// of the file when one clears a 30 % similarity floor.
fn not_found_message(content: &str, old: &str) -> String {
    let mut msg = String::from("'old' text not found in file.\n");
    let old_lines = old.lines().count().max(1);
    let file_lines: Vec<&str> = content.lines().collect();

    let mut best: Option<(f64, usize, String)> = None;
    if file_lines.len() >= old_lines {
        for (i, win) in file_lines.windows(old_lines).enumerate() {
            let joined = win.join("\n");
            let ratio = similarity_ratio(old, &joined);
            if ratio > 0.3 && best.as_ref().map(|(r, _, _)| ratio > *r).unwrap_or(true) {
                best = Some((ratio, i + 1, joined));
            }
        }
    }
    if let Some((ratio, line_no, window)) = best {
        msg.push_str(&format!(
            "Nearest match at line {line_no} ({:.0}%):\n",
            ratio * 100.0
        ));
        for l in window.lines() {
            msg.push_str(&format!("  |{l}|\n"));
        }
    }
    msg.push_str("Re-read the file, fix the 'old' text, and retry.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::CallOrigin;
    use serde_json::json;
    use std::sync::RwLock;

    fn setup() -> (tempfile::TempDir, EditFileTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = EditFileTool {
            root: Arc::new(RwLock::new(dir.path().to_path_buf())),
            backups: Arc::new(BackupStore::new()),
            state: Arc::new(ExecutionState::new()),
        };
        (dir, tool)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall::new("edit_file", args, CallOrigin::Native)
    }

    #[tokio::test]
    async fn replaces_first_occurrence_only_by_default() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("f.txt"), "aaa bbb aaa").unwrap();
        let out = tool
            .execute(&call(json!({"file_path": "f.txt", "old": "aaa", "new": "xxx"})))
            .await;
        assert!(out.success, "{}", out.output);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "xxx bbb aaa"
        );
        assert!(out.output.contains("1 of 2"));
    }

    #[tokio::test]
    async fn all_true_replaces_every_occurrence() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("f.txt"), "aaa bbb aaa").unwrap();
        let out = tool
            .execute(&call(
                json!({"file_path": "f.txt", "old": "aaa", "new": "xxx", "all": true}),
            ))
            .await;
        assert!(out.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "xxx bbb xxx"
        );
    }

    #[tokio::test]
    async fn not_found_error_suggests_nearest_match() {
        let (dir, tool) = setup();
        std::fs::write(
            dir.path().join("f.rs"),
            "fn process(id: u64) {\n    validate(id);\n}\n",
        )
        .unwrap();
        let out = tool
            .execute(&call(json!({
                "file_path": "f.rs",
                "old": "fn process(id: u32) {",
                "new": "fn process(id: u128) {"
            })))
            .await;
        assert!(!out.success);
        assert!(out.output.contains("Nearest match"), "{}", out.output);
        assert!(out.output.contains("u64"), "{}", out.output);
    }

    #[tokio::test]
    async fn file_unchanged_when_old_not_found() {
        let (dir, tool) = setup();
        let original = "line1\nline2\n";
        std::fs::write(dir.path().join("f.txt"), original).unwrap();
        let out = tool
            .execute(&call(
                json!({"file_path": "f.txt", "old": "absent", "new": "x"}),
            ))
            .await;
        assert!(!out.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            original
        );
    }

    #[tokio::test]
    async fn edit_is_undoable() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("f.txt"), "v1").unwrap();
        tool.execute(&call(json!({"file_path": "f.txt", "old": "v1", "new": "v2"})))
            .await;
        let canonical = dir.path().canonicalize().unwrap().join("f.txt");
        assert!(tool.backups.undo(&canonical).unwrap());
        assert_eq!(std::fs::read_to_string(&canonical).unwrap(), "v1");
    }

    #[tokio::test]
    async fn empty_old_is_invalid() {
        let (dir, tool) = setup();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let out = tool
            .execute(&call(json!({"file_path": "f.txt", "old": "", "new": "y"})))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, tool) = setup();
        let out = tool
            .execute(&call(json!({"file_path": "nope.txt", "old": "a", "new": "b"})))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::NotFound));
    }
}
