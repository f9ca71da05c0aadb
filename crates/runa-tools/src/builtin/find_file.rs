// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::policy::ApprovalPolicy;
use crate::sanitize::SharedRoot;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

const MAX_RESULTS: usize = 200;

pub struct FindFileTool {
    pub root: SharedRoot,
}

#[async_trait]
impl Tool for FindFileTool {
    fn name(&self) -> &str {
        "find_file"
    }

    fn description(&self) -> &str {
        "Find files under the project root whose name matches a glob pattern \
         ('*' matches anything, '?' one character). Hidden directories and \
         build artifacts (.git, target, node_modules) are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Filename glob, e.g. '*.rs' or 'config.?'"
                }
            },
            "required": ["pattern"],
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
        let Some(pattern) = call.str_param("pattern") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'pattern'",
            );
        };
        let Some(re) = glob_to_regex(pattern) else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                format!("unusable pattern: {pattern}"),
            );
        };

        let root = self.root.read().unwrap().clone();
        let mut matches = Vec::new();
        for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !is_ignored(e.file_name().to_string_lossy().as_ref()))
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if re.is_match(&name) {
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    matches.push(rel.display().to_string());
                }
                if matches.len() >= MAX_RESULTS {
                    break;
                }
            }
        }

        if matches.is_empty() {
            return ToolOutput::ok(call.id, format!("no files matching {pattern}"));
        }
        matches.sort();
        ToolOutput::ok(call.id, matches.join("\n"))
    }
}

fn is_ignored(name: &str) -> bool {
    matches!(name, ".git" | "target" | "node_modules" | ".scratch")
}

fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::CallOrigin;
    use serde_json::json;
    use std::sync::{Arc, RwLock};

    fn setup() -> (tempfile::TempDir, FindFileTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = FindFileTool {
            root: Arc::new(RwLock::new(dir.path().to_path_buf())),
        };
        (dir, tool)
    }

    #[tokio::test]
    async fn finds_by_extension_glob() {
        let (dir, tool) = setup();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("readme.md"), "").unwrap();
        let out = tool
            .execute(&ToolCall::new(
                "find_file",
                json!({"pattern": "*.rs"}),
                CallOrigin::Native,
            ))
            .await;
        assert!(out.output.contains("src/main.rs"));
        assert!(!out.output.contains("readme.md"));
    }

    #[tokio::test]
    async fn git_dir_is_skipped() {
        let (dir, tool) = setup();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config.rs"), "").unwrap();
        let out = tool
            .execute(&ToolCall::new(
                "find_file",
                json!({"pattern": "*.rs"}),
                CallOrigin::Native,
            ))
            .await;
        assert!(out.output.contains("no files matching"));
    }

    #[tokio::test]
    async fn missing_pattern_is_invalid() {
        let (_dir, tool) = setup();
        let out = tool
            .execute(&ToolCall::new("find_file", json!({}), CallOrigin::Native))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }
}
