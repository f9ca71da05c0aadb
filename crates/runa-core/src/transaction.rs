// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use runa_engine::{Engine, KvMarker};

use crate::history::ChatHistory;

/// Per-iteration transaction.
///
/// Opened at the top of every agentic iteration, committed after a COMMIT
/// verdict, restored on ROLLBACK.  At most one checkpoint is open per
/// session; the loop owns it and closes it before the iteration ends on
/// every path.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub history_len: usize,
    pub last_eval: Option<KvMarker>,
    pub rollback_retries: u8,
    pub consecutive_empty_grammar_retries: u8,
    pub grammar_disabled: bool,
    pub think_disabled: bool,
    /// Temperature in effect when the iteration opened.  ROLLBACK retries
    /// lower the live temperature; COMMIT restores this value so the
    /// reduction never leaks into the next iteration.
    pub original_temperature: Option<f32>,
}

impl Checkpoint {
    /// Snapshot the session state.  Retry counters reset here — that is the
    /// invariant, not a convenience: counters carry per-iteration meaning.
    pub fn open(history: &ChatHistory, engine: &Engine, temperature: Option<f32>) -> Self {
        Self {
            history_len: history.len(),
            last_eval: engine.last_eval(),
            rollback_retries: 0,
            consecutive_empty_grammar_retries: 0,
            grammar_disabled: engine.grammar_disabled(),
            think_disabled: engine
                .profile()
                .map(|p| p.think.budget.is_none())
                .unwrap_or(true),
            original_temperature: temperature,
        }
    }

    /// Restore the snapshot after a ROLLBACK verdict.
    ///
    /// The history rewinds to its checkpointed length.  The KV marker is
    /// invalidated rather than restored: the backend has already evaluated
    /// the rolled-back tokens, so the safe move is a clean re-tokenization.
    pub fn rollback(&mut self, history: &mut ChatHistory, engine: &Engine) {
        history.truncate(self.history_len);
        engine.invalidate_kv();
        self.rollback_retries += 1;
    }

    /// Close the transaction after COMMIT.  Returns the temperature to
    /// restore.  Counters reset per the invariant: after any COMMIT (or
    /// rollback-exhaustion commit) both retry counters are zero.
    pub fn commit(&mut self) -> Option<f32> {
        self.rollback_retries = 0;
        self.consecutive_empty_grammar_retries = 0;
        self.original_temperature
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_config::EngineConfig;
    use runa_engine::mock::ScriptedBackend;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::new(
            Arc::new(ScriptedBackend::always_text("x")),
            EngineConfig::default(),
        )
    }

    #[test]
    fn open_resets_counters() {
        let h = ChatHistory::new("sys");
        let e = engine();
        let cp = Checkpoint::open(&h, &e, Some(0.7));
        assert_eq!(cp.rollback_retries, 0);
        assert_eq!(cp.consecutive_empty_grammar_retries, 0);
    }

    #[test]
    fn rollback_rewinds_history_and_counts() {
        let mut h = ChatHistory::new("sys");
        h.push_user("q");
        let e = engine();
        let mut cp = Checkpoint::open(&h, &e, None);
        h.push_model("bad response", vec![]);
        cp.rollback(&mut h, &e);
        assert_eq!(h.len(), 2);
        assert_eq!(cp.rollback_retries, 1);
    }

    #[test]
    fn commit_returns_original_temperature_and_resets() {
        let mut h = ChatHistory::new("sys");
        let e = engine();
        let mut cp = Checkpoint::open(&h, &e, Some(0.9));
        cp.rollback(&mut h, &e);
        cp.rollback(&mut h, &e);
        assert_eq!(cp.commit(), Some(0.9));
        assert_eq!(cp.rollback_retries, 0);
        assert_eq!(cp.consecutive_empty_grammar_retries, 0);
    }
}
