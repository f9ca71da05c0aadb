// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use runa_engine::scrub_chatml;
use runa_tools::{ToolCall, ToolOutput};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Model,
}

/// One turn in the conversation.
///
/// `tool_calls` attaches to Model turns; `tool_results` attaches to the User
/// turn that delivers them back on the next iteration.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Option<Vec<ToolOutput>>,
}

impl ChatTurn {
    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_calls: None,
            tool_results: None,
        }
    }

    /// Approximate token count (4 chars/token heuristic).
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.text.len();
        if let Some(calls) = &self.tool_calls {
            chars += calls
                .iter()
                .map(|c| c.name.len() + c.params.to_string().len())
                .sum::<usize>();
        }
        if let Some(results) = &self.tool_results {
            chars += results.iter().map(|r| r.output.len()).sum::<usize>();
        }
        (chars / 4).max(1)
    }
}

/// The conversation, with its structural invariants enforced at the API:
///
/// - The history always begins with exactly one System turn.
/// - User and Model turns strictly alternate after it.  Pushing a user turn
///   while the last turn is already User merges the text instead of breaking
///   alternation (nudges and tool results both land this way).
/// - Every Model turn is passed through the same ChatML scrubber used during
///   streaming before it is stored.
#[derive(Debug)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
    /// Bumped whenever the system text actually changes.  Unchanged text
    /// leaves the revision (and the turn object) alone so the engine's
    /// prefix cache stays valid.
    system_revision: u64,
    token_count: usize,
}

impl ChatHistory {
    pub fn new(system_text: impl Into<String>) -> Self {
        let system = ChatTurn::new(Role::System, system_text);
        let token_count = system.approx_tokens();
        Self {
            turns: vec![system],
            system_revision: 0,
            token_count,
        }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Mutable access for the context compactor.  Crate-private so the
    /// structural invariants stay enforceable at the public API.
    pub(crate) fn turns_mut(&mut self) -> &mut [ChatTurn] {
        &mut self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn system_revision(&self) -> u64 {
        self.system_revision
    }

    /// Replace the system text only when it actually differs.
    ///
    /// Returns `true` when the text changed.  The equality guard is what
    /// lets the backend reuse the evaluated KV prefix across iterations: an
    /// unchanged system turn must not be rewritten.
    pub fn set_system_text(&mut self, text: &str) -> bool {
        if self.turns[0].text == text {
            return false;
        }
        self.turns[0].text = text.to_string();
        self.system_revision += 1;
        self.recalculate_tokens();
        true
    }

    /// Push a user turn, merging when the previous turn is already User.
    pub fn push_user(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some(last) = self.turns.last_mut() {
            if last.role == Role::User {
                if !last.text.is_empty() {
                    last.text.push_str("\n\n");
                }
                last.text.push_str(&text);
                self.recalculate_tokens();
                return;
            }
        }
        let turn = ChatTurn::new(Role::User, text);
        self.token_count += turn.approx_tokens();
        self.turns.push(turn);
    }

    /// Push a user turn that delivers tool results.
    pub fn push_tool_results(&mut self, results: Vec<(String, ToolOutput)>) {
        let text = results
            .iter()
            .map(|(name, out)| out.envelope(name))
            .collect::<Vec<_>>()
            .join("\n");
        let outputs: Vec<ToolOutput> = results.into_iter().map(|(_, o)| o).collect();
        if let Some(last) = self.turns.last_mut() {
            if last.role == Role::User {
                last.text.push('\n');
                last.text.push_str(&text);
                last.tool_results
                    .get_or_insert_with(Vec::new)
                    .extend(outputs);
                self.recalculate_tokens();
                return;
            }
        }
        let mut turn = ChatTurn::new(Role::User, text);
        turn.tool_results = Some(outputs);
        self.token_count += turn.approx_tokens();
        self.turns.push(turn);
    }

    /// Push a model turn.  The text passes the shared ChatML scrubber —
    /// the streaming filter and this store-time sanitizer must not diverge.
    pub fn push_model(&mut self, text: &str, tool_calls: Vec<ToolCall>) {
        let scrubbed = scrub_chatml(text);
        debug_assert!(
            self.turns.last().map(|t| t.role != Role::Model).unwrap_or(true),
            "two model turns in a row"
        );
        let mut turn = ChatTurn::new(Role::Model, scrubbed);
        if !tool_calls.is_empty() {
            turn.tool_calls = Some(tool_calls);
        }
        self.token_count += turn.approx_tokens();
        self.turns.push(turn);
    }

    /// Truncate back to `len` turns (transaction rollback).
    pub fn truncate(&mut self, len: usize) {
        let len = len.max(1); // the system turn never goes away
        self.turns.truncate(len);
        self.recalculate_tokens();
    }

    /// The first user message of the session — the original goal.
    pub fn original_goal(&self) -> Option<&str> {
        self.turns
            .iter()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }

    /// Replace everything after the system turn with a ledger user turn and
    /// (optionally) the latest model turn — the hard-rotation shape.
    pub fn rotate(&mut self, ledger_text: String) {
        let latest_model = self
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Model)
            .cloned();
        self.turns.truncate(1);
        self.turns.push(ChatTurn::new(Role::User, ledger_text));
        if let Some(model) = latest_model {
            self.turns.push(model);
        }
        self.recalculate_tokens();
    }

    /// Drop tool-call JSON from model turns, keeping the natural language.
    /// Used on cross-model handoff: the next model's wrapper renders tool
    /// calls differently and stale JSON confuses it.
    pub fn strip_tool_json_for_handoff(&mut self) {
        for turn in &mut self.turns {
            if turn.role == Role::Model {
                turn.tool_calls = None;
            }
        }
        self.recalculate_tokens();
    }

    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.turns.iter().map(|t| t.approx_tokens()).sum();
    }

    /// Structural invariant check, used by tests and debug assertions.
    pub fn invariants_hold(&self) -> bool {
        if self.turns.first().map(|t| t.role) != Some(Role::System) {
            return false;
        }
        if self.turns.iter().skip(1).any(|t| t.role == Role::System) {
            return false;
        }
        let mut prev: Option<Role> = None;
        for t in self.turns.iter().skip(1) {
            if prev == Some(t.role) {
                return false;
            }
            prev = Some(t.role);
        }
        // No stored model turn may be majority ChatML garbage; store-time
        // scrubbing guarantees this even across model swaps.
        self.turns
            .iter()
            .filter(|t| t.role == Role::Model)
            .all(|t| runa_engine::chatml_fraction(&t.text) < 0.5)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
