// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Alias mapping and parameter normalization.
//!
//! Models trained on other agent stacks emit the tool vocabulary of those
//! stacks.  Rather than nudging and burning an iteration, the common aliases
//! are mapped onto the canonical registry names and the parameters coerced
//! into shape.

use serde_json::Value;
use tracing::debug;

use crate::RawCall;

/// Canonical tool names known to the runtime.
pub(crate) const KNOWN_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "delete_file",
    "undo_edit",
    "list_directory",
    "find_file",
    "run_command",
    "git_status",
    "git_log",
    "git_diff",
    "git_commit",
    "web_search",
    "fetch_webpage",
    "browser_navigate",
    "browser_snapshot",
    "browser_click",
    "browser_type",
    "update_memory",
    "read_memory",
    "update_todo",
];

/// Alias → canonical name, collected from observed model output across
/// families.
pub const ALIASES: &[(&str, &str)] = &[
    // file reads
    ("read", "read_file"),
    ("cat", "read_file"),
    ("view_file", "read_file"),
    ("open_file", "read_file"),
    ("get_file", "read_file"),
    ("file_read", "read_file"),
    ("read_text_file", "read_file"),
    // file writes
    ("write", "write_file"),
    ("create_file", "write_file"),
    ("save_file", "write_file"),
    ("file_write", "write_file"),
    ("write_to_file", "write_file"),
    ("create", "write_file"),
    // edits
    ("edit", "edit_file"),
    ("str_replace", "edit_file"),
    ("str_replace_editor", "edit_file"),
    ("replace_in_file", "edit_file"),
    ("apply_edit", "edit_file"),
    ("modify_file", "edit_file"),
    // deletes / undo
    ("remove_file", "delete_file"),
    ("rm", "delete_file"),
    ("undo", "undo_edit"),
    ("revert_file", "undo_edit"),
    // listing / search
    ("list_files", "list_directory"),
    ("ls", "list_directory"),
    ("list_dir", "list_directory"),
    ("dir", "list_directory"),
    ("read_directory", "list_directory"),
    ("glob", "find_file"),
    ("file_search", "find_file"),
    ("search_files", "find_file"),
    // terminal
    ("bash", "run_command"),
    ("shell", "run_command"),
    ("sh", "run_command"),
    ("terminal", "run_command"),
    ("exec", "run_command"),
    ("execute_command", "run_command"),
    ("run_terminal_command", "run_command"),
    ("run_shell_command", "run_command"),
    // git
    ("git", "git_status"),
    ("commit", "git_commit"),
    // web
    ("search", "web_search"),
    ("search_web", "web_search"),
    ("google", "web_search"),
    ("duckduckgo", "web_search"),
    ("browse", "fetch_webpage"),
    ("fetch", "fetch_webpage"),
    ("fetch_url", "fetch_webpage"),
    ("web_fetch", "fetch_webpage"),
    ("get_webpage", "fetch_webpage"),
    ("open_url", "browser_navigate"),
    ("navigate", "browser_navigate"),
    ("goto", "browser_navigate"),
    ("click", "browser_click"),
    ("type_text", "browser_type"),
    ("screenshot", "browser_snapshot"),
    ("snapshot", "browser_snapshot"),
    // memory / todo
    ("remember", "update_memory"),
    ("memory", "update_memory"),
    ("save_memory", "update_memory"),
    ("todo_write", "update_todo"),
    ("todo", "update_todo"),
    ("update_todos", "update_todo"),
];

/// Resolve a name through the alias table.  Canonical names resolve to
/// themselves; unknown names resolve to `None`.
pub(crate) fn resolve_alias(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    if KNOWN_TOOLS.contains(&lower.as_str()) {
        return Some(lower);
    }
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| canonical.to_string())
}

/// Leading words that identify a "search query" as a shell command.
const SHELL_WORDS: &[&str] = &[
    "ls", "cat", "grep", "find", "pwd", "cd", "mkdir", "rm", "cp", "mv", "echo", "git",
    "cargo", "npm", "pip", "python", "python3", "node", "make", "curl", "wget", "touch",
    "chmod", "head", "tail", "wc", "ps", "kill", "tar", "unzip",
];

fn query_is_shell_command(query: &str) -> bool {
    let first = query.trim().split_whitespace().next().unwrap_or("");
    SHELL_WORDS.contains(&first)
}

/// Normalize one extracted call against the registry.
///
/// Returns `None` when the call cannot be resolved to a registered tool.
pub(crate) fn normalize(mut raw: RawCall, registry_names: &[String]) -> Option<RawCall> {
    let resolved = resolve_alias(&raw.name)?;
    raw.name = resolved;

    // A "web search" for `ls -la` is a shell command that lost its way.
    if raw.name == "web_search" {
        if let Some(query) = raw.params.get("query").and_then(|v| v.as_str()) {
            if query_is_shell_command(query) {
                debug!(query, "web_search query is a shell command; remapping");
                let command = query.to_string();
                raw.name = "run_command".to_string();
                if let Some(map) = raw.params.as_object_mut() {
                    map.remove("query");
                    map.insert("command".to_string(), Value::String(command));
                }
            }
        }
    }

    coerce_params(&mut raw);

    if !registry_names.iter().any(|n| n == &raw.name) {
        debug!(tool = %raw.name, "tool not in registry; dropping call");
        return None;
    }
    Some(raw)
}

/// Parameter-level coercions shared by every method.
fn coerce_params(raw: &mut RawCall) {
    let Some(map) = raw.params.as_object_mut() else {
        return;
    };

    // `path` → `file_path` for the file tools (list_directory keeps `path`).
    let file_tools = [
        "read_file",
        "write_file",
        "edit_file",
        "delete_file",
        "undo_edit",
    ];
    if file_tools.contains(&raw.name.as_str()) {
        if let Some(v) = map.remove("path") {
            map.entry("file_path".to_string()).or_insert(v);
        }
        if let Some(v) = map.remove("filename") {
            map.entry("file_path".to_string()).or_insert(v);
        }
    }

    // Strip `.ref=` selector prefixes that some UI-grounded models emit.
    for value in map.values_mut() {
        if let Value::String(s) = value {
            if let Some(stripped) = s.strip_prefix(".ref=") {
                *s = stripped.to_string();
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Vec<String> {
        KNOWN_TOOLS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn canonical_names_resolve_to_themselves() {
        assert_eq!(resolve_alias("read_file"), Some("read_file".to_string()));
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(resolve_alias("bash"), Some("run_command".to_string()));
        assert_eq!(resolve_alias("LIST_FILES"), Some("list_directory".to_string()));
        assert_eq!(resolve_alias("str_replace"), Some("edit_file".to_string()));
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        assert_eq!(resolve_alias("println"), None);
        assert_eq!(resolve_alias("summon_demon"), None);
    }

    #[test]
    fn alias_table_targets_are_all_known() {
        for (_, target) in ALIASES {
            assert!(
                KNOWN_TOOLS.contains(target),
                "alias target {target} is not a known tool"
            );
        }
    }

    #[test]
    fn filename_param_is_coerced() {
        let raw = RawCall {
            name: "write_file".into(),
            params: json!({"filename": "a.txt", "content": "x"}),
        };
        let n = normalize(raw, &registry()).unwrap();
        assert_eq!(n.params["file_path"], "a.txt");
    }

    #[test]
    fn list_directory_keeps_path_param() {
        let raw = RawCall {
            name: "list_directory".into(),
            params: json!({"path": "src"}),
        };
        let n = normalize(raw, &registry()).unwrap();
        assert_eq!(n.params["path"], "src");
    }

    #[test]
    fn shell_query_detection() {
        assert!(query_is_shell_command("ls -la"));
        assert!(query_is_shell_command("  git status"));
        assert!(!query_is_shell_command("best pizza in dallas"));
        assert!(!query_is_shell_command("how to ls in windows"));
    }

    #[test]
    fn unregistered_tool_is_dropped() {
        // Resolvable alias, but the registry exposes a narrower set.
        let raw = RawCall {
            name: "bash".into(),
            params: json!({"command": "ls"}),
        };
        let narrow = vec!["read_file".to_string()];
        assert!(normalize(raw, &narrow).is_none());
    }
}
