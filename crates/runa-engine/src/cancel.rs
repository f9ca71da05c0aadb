// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between the session, the engine and
/// every in-flight tool execution.
///
/// Cancellation is uniform across the runtime: the flag is polled at every
/// suspension point (per-token yields, tool awaits, load retries).  There is
/// no special async cancellation primitive — dropping futures mid-poll is
/// never relied upon for correctness.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token for the next user turn.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Resolve when the token is cancelled.  Polling-based on purpose: the
    /// token is a plain atomic so it can be flipped from any thread without
    /// an async handle, and 50 ms of latency is well inside the 1 s
    /// cancellation budget.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let t = CancelToken::new();
        let c = t.clone();
        t.cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn reset_rearms() {
        let t = CancelToken::new();
        t.cancel();
        t.reset();
        assert!(!t.is_cancelled());
    }
}
