// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Progressive tool disclosure.
//!
//! Iteration 1 exposes a minimal, reordered tool set for the task type;
//! later iterations expand based on what the model actually used.  Small
//! models pick better from eight options than from thirty — capability is
//! not lost because use of a family unlocks its relatives.

use std::collections::HashSet;

use runa_tools::ToolFamily;

use crate::classify::TaskKind;

#[derive(Debug, Default)]
pub struct Disclosure {
    unlocked: HashSet<&'static str>,
    navigation_succeeded: bool,
}

impl Disclosure {
    pub fn new() -> Self {
        Self::default()
    }

    /// The minimal, deliberately ordered first-iteration set.
    fn initial_set(task: TaskKind) -> &'static [&'static str] {
        match task {
            // Chat is a hard gate: zero tools, enforced again in the parser.
            TaskKind::Chat => &[],
            TaskKind::Code => &[
                "read_file",
                "list_directory",
                "edit_file",
                "write_file",
                "run_command",
            ],
            TaskKind::Browser => &["browser_navigate", "browser_snapshot", "web_search"],
            TaskKind::General => &[
                "web_search",
                "fetch_webpage",
                "read_file",
                "list_directory",
                "write_file",
            ],
        }
    }

    /// Record an executed call so related tools unlock next iteration.
    pub fn observe(&mut self, tool_name: &str, family: Option<ToolFamily>, success: bool) {
        match family {
            Some(ToolFamily::File) => {
                self.unlocked
                    .extend(["find_file", "delete_file", "undo_edit", "git_status", "git_diff"]);
            }
            Some(ToolFamily::Terminal) => {
                self.unlocked
                    .extend(["git_status", "git_log", "git_diff", "git_commit"]);
            }
            Some(ToolFamily::Git) => {
                self.unlocked.extend(["git_log", "git_diff", "git_commit"]);
            }
            Some(ToolFamily::Web) => {
                self.unlocked.extend(["fetch_webpage", "browser_navigate"]);
            }
            Some(ToolFamily::Browser) => {
                if tool_name == "browser_navigate" && success {
                    self.navigation_succeeded = true;
                    self.unlocked
                        .extend(["browser_click", "browser_type", "browser_snapshot"]);
                }
            }
            _ => {}
        }
        // Any real tool use unlocks bookkeeping tools.
        self.unlocked.extend(["update_todo", "update_memory", "read_memory"]);
    }

    /// Tool names exposed for `iteration` (1-based), filtered to what the
    /// registry actually has.
    pub fn tools_for_iteration(
        &self,
        task: TaskKind,
        iteration: u32,
        registry_names: &[String],
    ) -> Vec<String> {
        let mut names: Vec<&str> = Self::initial_set(task).to_vec();
        if iteration > 1 {
            for name in self.unlocked.iter().copied() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
            .into_iter()
            .filter(|n| registry_names.iter().any(|r| r == n))
            .map(|n| n.to_string())
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
