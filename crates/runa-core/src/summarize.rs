// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation summarization into a structured ledger.
//!
//! The ledger replaces all prior turns except the system message when the
//! context manager triggers a hard rotation.  It is deterministic — no model
//! call — so rotation can never fail or recurse into generation.
//!
//! Compression is lossy by design, with two fields preserved verbatim no
//! matter what: the original goal and user-correction turns.

use runa_tools::{registry::params_digest, TodoItem, TodoStatus};
use serde::{Deserialize, Serialize};

use crate::history::{ChatHistory, Role};

/// Detailed step entries kept; older ones are grouped by tool.
const DETAILED_STEPS: usize = 40;
/// Original-goal cap in characters.
const GOAL_CAP: usize = 2_000;
const MAX_FINDINGS: usize = 8;

/// Words that mark a user turn as a correction.
const CORRECTION_MARKERS: &[&str] = &["actually", "no,", "no ", "instead", "wait"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub tool: String,
    pub params_digest: String,
    pub outcome: String,
}

/// Current position of the work, reconstructed from the most recent steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentState {
    pub page: Option<String>,
    pub file: Option<String>,
    pub dir: Option<String>,
    pub last_action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLedger {
    pub original_goal: String,
    /// Most recent steps in full detail; older steps grouped as `tool (×N)`.
    pub completed_steps: Vec<StepRecord>,
    pub grouped_older: Vec<String>,
    pub current_state: CurrentState,
    pub key_findings: Vec<String>,
    /// Preserved verbatim — corrections are the part of history a model
    /// must never lose.
    pub user_corrections: Vec<String>,
    pub pending_steps: Vec<String>,
}

impl ConversationLedger {
    /// Build a ledger from the conversation.
    pub fn build(history: &ChatHistory, todos: &[TodoItem]) -> Self {
        let mut goal = history.original_goal().unwrap_or_default().to_string();
        if goal.len() > GOAL_CAP {
            let mut cut = GOAL_CAP;
            while !goal.is_char_boundary(cut) {
                cut -= 1;
            }
            goal.truncate(cut);
        }

        // Walk model turns, pairing tool calls with the results delivered by
        // the following user turn.  Repeated identical calls collapse.
        let mut steps: Vec<(StepRecord, u32)> = Vec::new();
        let turns = history.turns();
        for (i, turn) in turns.iter().enumerate() {
            if turn.role != Role::Model {
                continue;
            }
            let Some(calls) = &turn.tool_calls else {
                continue;
            };
            let results = turns
                .get(i + 1)
                .and_then(|t| t.tool_results.as_ref());
            for (j, call) in calls.iter().enumerate() {
                let outcome = results
                    .and_then(|r| r.get(j))
                    .map(|r| {
                        if r.success {
                            outcome_digest(&r.output)
                        } else {
                            format!("failed: {}", outcome_digest(&r.output))
                        }
                    })
                    .unwrap_or_else(|| "no result".to_string());
                let record = StepRecord {
                    tool: call.name.clone(),
                    params_digest: params_digest(call),
                    outcome,
                };
                match steps.last_mut() {
                    Some((last, n))
                        if last.tool == record.tool
                            && last.params_digest == record.params_digest =>
                    {
                        *n += 1;
                        last.outcome = record.outcome;
                    }
                    _ => steps.push((record, 1)),
                }
            }
        }

        // Older steps lose their detail: grouped `tool (×N)` only.
        let split = steps.len().saturating_sub(DETAILED_STEPS);
        let mut grouped_older: Vec<String> = Vec::new();
        for (record, n) in &steps[..split] {
            let label = if *n > 1 {
                format!("{} (×{n})", record.tool)
            } else {
                record.tool.clone()
            };
            match grouped_older.last_mut() {
                Some(last) if last.starts_with(record.tool.as_str()) => {
                    *last = label;
                }
                _ => grouped_older.push(label),
            }
        }
        let completed_steps: Vec<StepRecord> = steps[split..]
            .iter()
            .map(|(record, n)| {
                let mut r = record.clone();
                if *n > 1 {
                    r.tool = format!("{} (×{n})", r.tool);
                }
                r
            })
            .collect();

        let current_state = current_state_from_steps(&steps);
        let key_findings = findings_from_history(history);
        let user_corrections = corrections_from_history(history);
        let pending_steps = todos
            .iter()
            .filter(|t| matches!(t.status, TodoStatus::Pending | TodoStatus::InProgress))
            .map(|t| t.text.clone())
            .collect();

        Self {
            original_goal: goal,
            completed_steps,
            grouped_older,
            current_state,
            key_findings,
            user_corrections,
            pending_steps,
        }
    }

    /// Render as the bounded text block that replaces prior turns.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("## Conversation ledger (context was rotated)\n\n");
        out.push_str("### Original goal\n");
        out.push_str(&self.original_goal);
        out.push('\n');

        if !self.grouped_older.is_empty() {
            out.push_str("\n### Earlier steps (condensed)\n");
            out.push_str(&self.grouped_older.join(", "));
            out.push('\n');
        }
        if !self.completed_steps.is_empty() {
            out.push_str("\n### Completed steps\n");
            for s in &self.completed_steps {
                out.push_str(&format!("- {} [{}] → {}\n", s.tool, s.params_digest, s.outcome));
            }
        }

        out.push_str("\n### Current state\n");
        if let Some(p) = &self.current_state.page {
            out.push_str(&format!("- page: {p}\n"));
        }
        if let Some(f) = &self.current_state.file {
            out.push_str(&format!("- file: {f}\n"));
        }
        if let Some(d) = &self.current_state.dir {
            out.push_str(&format!("- dir: {d}\n"));
        }
        if let Some(a) = &self.current_state.last_action {
            out.push_str(&format!("- last action: {a}\n"));
        }

        if !self.key_findings.is_empty() {
            out.push_str("\n### Key findings\n");
            for f in &self.key_findings {
                out.push_str(&format!("- {f}\n"));
            }
        }
        if !self.user_corrections.is_empty() {
            out.push_str("\n### User corrections (verbatim)\n");
            for c in &self.user_corrections {
                out.push_str(&format!("- {c}\n"));
            }
        }
        if !self.pending_steps.is_empty() {
            out.push_str("\n### Pending\n");
            for p in &self.pending_steps {
                out.push_str(&format!("- {p}\n"));
            }
        }
        out
    }
}

fn outcome_digest(output: &str) -> String {
    let first_line = output.lines().next().unwrap_or("");
    let mut digest = first_line.to_string();
    if digest.len() > 120 {
        let mut cut = 120;
        while !digest.is_char_boundary(cut) {
            cut -= 1;
        }
        digest.truncate(cut);
        digest.push('…');
    }
    digest
}

fn current_state_from_steps(steps: &[(StepRecord, u32)]) -> CurrentState {
    let mut state = CurrentState::default();
    for (record, _) in steps.iter().rev() {
        if state.last_action.is_none() {
            state.last_action = Some(record.tool.clone());
        }
        match record.tool.as_str() {
            "browser_navigate" | "fetch_webpage" if state.page.is_none() => {
                state.page = Some(record.outcome.clone());
            }
            "write_file" | "edit_file" | "read_file" if state.file.is_none() => {
                state.file = Some(record.outcome.clone());
            }
            "list_directory" if state.dir.is_none() => {
                state.dir = Some(record.outcome.clone());
            }
            _ => {}
        }
        if state.page.is_some() && state.file.is_some() && state.dir.is_some() {
            break;
        }
    }
    state
}

/// Short factual lines lifted from recent successful tool results.
fn findings_from_history(history: &ChatHistory) -> Vec<String> {
    let mut findings = Vec::new();
    for turn in history.turns().iter().rev() {
        let Some(results) = &turn.tool_results else {
            continue;
        };
        for r in results.iter().filter(|r| r.success) {
            let line = outcome_digest(&r.output);
            if !line.is_empty() && !findings.contains(&line) {
                findings.push(line);
            }
            if findings.len() >= MAX_FINDINGS {
                return findings;
            }
        }
    }
    findings
}

/// User turns after the first that read as corrections, kept verbatim.
fn corrections_from_history(history: &ChatHistory) -> Vec<String> {
    history
        .turns()
        .iter()
        .filter(|t| t.role == Role::User)
        .skip(1)
        .filter(|t| {
            let lower = t.text.to_lowercase();
            CORRECTION_MARKERS.iter().any(|m| lower.starts_with(m) || lower.contains(&format!(" {m}")))
        })
        .map(|t| t.text.clone())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_tools::{CallOrigin, ToolCall, ToolOutput};
    use serde_json::json;
    use uuid::Uuid;

    fn call(name: &str, params: serde_json::Value) -> ToolCall {
        ToolCall::new(name, params, CallOrigin::Native)
    }

    fn history_with_steps() -> ChatHistory {
        let mut h = ChatHistory::new("sys");
        h.push_user("find the pizza places and save them");
        h.push_model(
            "searching",
            vec![call("web_search", json!({"query": "pizza"}))],
        );
        h.push_tool_results(vec![(
            "web_search".to_string(),
            ToolOutput::ok(Uuid::new_v4(), "1. Cane Rosso\n2. Zoli's"),
        )]);
        h.push_model(
            "writing",
            vec![call("write_file", json!({"file_path": "pizza.txt", "content": "x"}))],
        );
        h.push_tool_results(vec![(
            "write_file".to_string(),
            ToolOutput::ok(Uuid::new_v4(), "wrote 42 bytes to pizza.txt"),
        )]);
        h
    }

    #[test]
    fn goal_is_preserved_verbatim() {
        let h = history_with_steps();
        let ledger = ConversationLedger::build(&h, &[]);
        assert_eq!(ledger.original_goal, "find the pizza places and save them");
        assert!(ledger.render().contains("find the pizza places and save them"));
    }

    #[test]
    fn goal_is_capped_at_2000_chars() {
        let mut h = ChatHistory::new("sys");
        h.push_user("x".repeat(5_000));
        let ledger = ConversationLedger::build(&h, &[]);
        assert_eq!(ledger.original_goal.len(), 2_000);
    }

    #[test]
    fn steps_record_tool_and_outcome() {
        let h = history_with_steps();
        let ledger = ConversationLedger::build(&h, &[]);
        assert_eq!(ledger.completed_steps.len(), 2);
        assert_eq!(ledger.completed_steps[0].tool, "web_search");
        assert!(ledger.completed_steps[0].outcome.contains("Cane Rosso"));
        assert_eq!(ledger.completed_steps[1].tool, "write_file");
    }

    #[test]
    fn repeated_identical_calls_collapse() {
        let mut h = ChatHistory::new("sys");
        h.push_user("poll the file");
        for _ in 0..3 {
            h.push_model(
                "reading",
                vec![call("read_file", json!({"file_path": "same.txt"}))],
            );
            h.push_tool_results(vec![(
                "read_file".to_string(),
                ToolOutput::ok(Uuid::new_v4(), "content"),
            )]);
        }
        let ledger = ConversationLedger::build(&h, &[]);
        assert_eq!(ledger.completed_steps.len(), 1);
        assert!(ledger.completed_steps[0].tool.contains("×3"));
    }

    #[test]
    fn corrections_preserved_verbatim() {
        let mut h = history_with_steps();
        h.push_model("done", vec![]);
        h.push_user("actually, use the desktop folder instead");
        let ledger = ConversationLedger::build(&h, &[]);
        assert_eq!(
            ledger.user_corrections,
            vec!["actually, use the desktop folder instead".to_string()]
        );
        assert!(ledger
            .render()
            .contains("actually, use the desktop folder instead"));
    }

    #[test]
    fn first_user_turn_is_never_a_correction() {
        let mut h = ChatHistory::new("sys");
        h.push_user("no, wait, do the other thing");
        let ledger = ConversationLedger::build(&h, &[]);
        assert!(ledger.user_corrections.is_empty());
    }

    #[test]
    fn pending_steps_come_from_open_todos() {
        let h = history_with_steps();
        let todos = vec![
            TodoItem {
                id: "1".into(),
                text: "verify the file".into(),
                status: TodoStatus::Pending,
            },
            TodoItem {
                id: "2".into(),
                text: "already done".into(),
                status: TodoStatus::Done,
            },
        ];
        let ledger = ConversationLedger::build(&h, &todos);
        assert_eq!(ledger.pending_steps, vec!["verify the file".to_string()]);
    }

    #[test]
    fn old_steps_are_grouped() {
        let mut h = ChatHistory::new("sys");
        h.push_user("long task");
        for i in 0..50 {
            h.push_model(
                "step",
                vec![call("read_file", json!({"file_path": format!("f{i}.txt")}))],
            );
            h.push_tool_results(vec![(
                "read_file".to_string(),
                ToolOutput::ok(Uuid::new_v4(), format!("content {i}")),
            )]);
        }
        let ledger = ConversationLedger::build(&h, &[]);
        assert_eq!(ledger.completed_steps.len(), DETAILED_STEPS);
        assert!(!ledger.grouped_older.is_empty());
    }

    #[test]
    fn current_state_reflects_last_actions() {
        let h = history_with_steps();
        let ledger = ConversationLedger::build(&h, &[]);
        assert_eq!(ledger.current_state.last_action.as_deref(), Some("write_file"));
        assert!(ledger.current_state.file.is_some());
    }
}
