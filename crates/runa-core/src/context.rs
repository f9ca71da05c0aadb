// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context budgeting: progressive compaction and rotation triggering.
//!
//! Two thresholds against the model's effective context:
//!
//! - at the **compact** threshold (default 55 %), the oldest tool results
//!   and assistant messages are pruned in place — the system turn and the
//!   original goal are never touched;
//! - at the **rotate** threshold (default 80 %), the caller replaces the
//!   history with a summarizer ledger and invalidates the KV marker.

use tracing::debug;

use crate::history::{ChatHistory, Role};

/// Tool-result turns older than the recent tail are cut to this many chars.
const COMPACTED_RESULT_CHARS: usize = 400;
/// Old assistant messages are cut to this many chars.
const COMPACTED_MODEL_CHARS: usize = 300;
/// Most recent turns kept verbatim by progressive compaction.
const KEEP_RECENT_TURNS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAction {
    None,
    Compacted,
    /// Usage crossed the rotation threshold; the caller must rotate through
    /// the summarizer ledger and invalidate the KV marker.
    NeedsRotation,
}

#[derive(Debug, Clone)]
pub struct ContextManager {
    pub compact_threshold: f32,
    pub rotate_threshold: f32,
}

impl ContextManager {
    pub fn new(compact_threshold: f32, rotate_threshold: f32) -> Self {
        Self {
            compact_threshold,
            rotate_threshold,
        }
    }

    pub fn usage_fraction(&self, history: &ChatHistory, overhead_tokens: usize, effective_ctx: u32) -> f32 {
        if effective_ctx == 0 {
            return 0.0;
        }
        (history.token_count() + overhead_tokens) as f32 / effective_ctx as f32
    }

    /// Check the budget and compact in place when over the lower threshold.
    ///
    /// Never rotates by itself — rotation rewrites history through the
    /// summarizer, which the agent owns.
    pub fn check(
        &self,
        history: &mut ChatHistory,
        overhead_tokens: usize,
        effective_ctx: u32,
    ) -> ContextAction {
        let usage = self.usage_fraction(history, overhead_tokens, effective_ctx);
        if usage >= self.rotate_threshold {
            debug!(usage, "context over rotation threshold");
            return ContextAction::NeedsRotation;
        }
        if usage >= self.compact_threshold {
            let before = history.token_count();
            progressive_compact(history);
            debug!(
                usage,
                tokens_before = before,
                tokens_after = history.token_count(),
                "progressive compaction"
            );
            return ContextAction::Compacted;
        }
        ContextAction::None
    }
}

/// Prune oldest content in place.  The system turn and the original goal
/// (first user turn) are preserved; the most recent turns stay verbatim.
fn progressive_compact(history: &mut ChatHistory) {
    let len = history.len();
    if len <= KEEP_RECENT_TURNS + 2 {
        return;
    }
    let compact_end = len - KEEP_RECENT_TURNS;
    let goal_index = history
        .turns()
        .iter()
        .position(|t| t.role == Role::User)
        .unwrap_or(usize::MAX);

    let mut compacted = 0usize;
    for i in 1..compact_end {
        if i == goal_index {
            continue;
        }
        let turn = history_turn_mut(history, i);
        match turn.role {
            Role::User if turn.tool_results.is_some() => {
                if truncate_in_place(&mut turn.text, COMPACTED_RESULT_CHARS) {
                    compacted += 1;
                }
            }
            Role::Model => {
                if truncate_in_place(&mut turn.text, COMPACTED_MODEL_CHARS) {
                    compacted += 1;
                }
                // Drop detailed result payloads attached to old turns.
                turn.tool_results = None;
            }
            _ => {}
        }
    }
    if compacted > 0 {
        history.recalculate_tokens();
    }
}

fn truncate_in_place(text: &mut String, cap: usize) -> bool {
    if text.len() <= cap {
        return false;
    }
    let mut cut = cap;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(" […compacted]");
    true
}

// History does not expose `&mut ChatTurn` publicly; this module is the one
// sanctioned mutator.
fn history_turn_mut(history: &mut ChatHistory, index: usize) -> &mut crate::history::ChatTurn {
    &mut history.turns_mut()[index]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_tools::ToolOutput;
    use uuid::Uuid;

    fn busy_history() -> ChatHistory {
        let mut h = ChatHistory::new("system");
        h.push_user("the original goal of this session");
        for i in 0..12 {
            h.push_model(&format!("model turn {i} {}", "pad ".repeat(200)), vec![]);
            h.push_tool_results(vec![(
                "read_file".to_string(),
                ToolOutput::ok(Uuid::new_v4(), "result ".repeat(300)),
            )]);
        }
        h
    }

    #[test]
    fn below_threshold_is_noop() {
        let mut h = ChatHistory::new("sys");
        h.push_user("hi");
        let cm = ContextManager::new(0.55, 0.80);
        assert_eq!(cm.check(&mut h, 0, 100_000), ContextAction::None);
    }

    #[test]
    fn over_compact_threshold_prunes_old_turns() {
        let mut h = busy_history();
        let before = h.token_count();
        let cm = ContextManager::new(0.55, 0.80);
        // Pick a ctx that puts usage between the two thresholds.
        let ctx = (before as f32 / 0.6) as u32;
        assert_eq!(cm.check(&mut h, 0, ctx), ContextAction::Compacted);
        assert!(h.token_count() < before);
        assert!(h.invariants_hold());
    }

    #[test]
    fn compaction_preserves_system_and_goal() {
        let mut h = busy_history();
        let cm = ContextManager::new(0.55, 0.80);
        let ctx = (h.token_count() as f32 / 0.6) as u32;
        cm.check(&mut h, 0, ctx);
        assert_eq!(h.turns()[0].text, "system");
        assert_eq!(h.turns()[1].text, "the original goal of this session");
    }

    #[test]
    fn compaction_keeps_recent_tail_verbatim() {
        let mut h = busy_history();
        let last_text = h.turns().last().unwrap().text.clone();
        let cm = ContextManager::new(0.55, 0.80);
        let ctx = (h.token_count() as f32 / 0.6) as u32;
        cm.check(&mut h, 0, ctx);
        assert_eq!(h.turns().last().unwrap().text, last_text);
    }

    #[test]
    fn over_rotate_threshold_requests_rotation() {
        let mut h = busy_history();
        let cm = ContextManager::new(0.55, 0.80);
        let ctx = h.token_count() as u32; // usage == 1.0
        assert_eq!(cm.check(&mut h, 0, ctx), ContextAction::NeedsRotation);
    }

    #[test]
    fn rotation_happens_exactly_once_at_boundary() {
        // Prompt at exactly effective_ctx: the first check requests a
        // rotation; after the rotation shrinks history the second check
        // must not request another.
        let mut h = busy_history();
        let cm = ContextManager::new(0.55, 0.80);
        let ctx = h.token_count() as u32;
        assert_eq!(cm.check(&mut h, 0, ctx), ContextAction::NeedsRotation);
        h.rotate("## Conversation ledger\nshort".to_string());
        assert_ne!(cm.check(&mut h, 0, ctx), ContextAction::NeedsRotation);
    }

    #[test]
    fn overhead_counts_toward_usage() {
        let mut h = ChatHistory::new("sys");
        h.push_user("small");
        let cm = ContextManager::new(0.55, 0.80);
        assert_eq!(cm.check(&mut h, 0, 1_000), ContextAction::None);
        assert_eq!(
            cm.check(&mut h, 10_000, 1_000),
            ContextAction::NeedsRotation
        );
    }
}
