// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stuck detection over the tool-call stream.
//!
//! Two independent signals over a sliding window:
//!
//! - **tool loop** — the same `(tool, params_digest)` pair appears three
//!   times;
//! - **cycle** — a tool-name sequence of length 2–4 repeats three times
//!   back-to-back.
//!
//! The loop nudges on the first trigger and forces termination on the
//! second.

use std::collections::VecDeque;

const WINDOW: usize = 12;
const REPEAT_LIMIT: usize = 3;

#[derive(Debug, Default)]
pub struct StuckDetector {
    window: VecDeque<(String, String)>,
}

impl StuckDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tool: &str, params_digest: &str) {
        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window
            .push_back((tool.to_string(), params_digest.to_string()));
    }

    /// Same exact call three times within the window.
    pub fn tool_loop_detected(&self) -> bool {
        self.window.iter().any(|entry| {
            self.window.iter().filter(|e| *e == entry).count() >= REPEAT_LIMIT
        })
    }

    /// A 2–4-length tool-name sequence repeating three times at the tail.
    pub fn cycle_detected(&self) -> bool {
        let names: Vec<&str> = self.window.iter().map(|(t, _)| t.as_str()).collect();
        for len in 2..=4usize {
            let need = len * REPEAT_LIMIT;
            if names.len() < need {
                continue;
            }
            let tail = &names[names.len() - need..];
            let pattern = &tail[..len];
            // A uniform pattern (the same tool over and over) is the
            // tool-loop detector's territory; requiring variety here keeps
            // "read six different files" from flagging as a cycle.
            if pattern.iter().all(|n| *n == pattern[0]) {
                continue;
            }
            if tail.chunks(len).all(|c| c == pattern) {
                return true;
            }
        }
        false
    }

    pub fn is_stuck(&self) -> bool {
        self.tool_loop_detected() || self.cycle_detected()
    }

    /// Clear the window (after a nudge, so the same history does not
    /// re-trigger immediately).
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_detector_is_not_stuck() {
        assert!(!StuckDetector::new().is_stuck());
    }

    #[test]
    fn same_call_three_times_is_a_tool_loop() {
        let mut d = StuckDetector::new();
        d.record("read_file", "abc");
        d.record("read_file", "abc");
        assert!(!d.is_stuck());
        d.record("read_file", "abc");
        assert!(d.tool_loop_detected());
    }

    #[test]
    fn same_tool_different_params_is_not_a_loop() {
        let mut d = StuckDetector::new();
        d.record("read_file", "a");
        d.record("read_file", "b");
        d.record("read_file", "c");
        assert!(!d.tool_loop_detected());
    }

    #[test]
    fn two_step_cycle_detected() {
        let mut d = StuckDetector::new();
        for _ in 0..3 {
            d.record("list_directory", "d1");
            d.record("read_file", "f1");
        }
        assert!(d.cycle_detected());
    }

    #[test]
    fn three_step_cycle_detected() {
        let mut d = StuckDetector::new();
        for i in 0..3 {
            d.record("web_search", &format!("q{}", 0));
            d.record("fetch_webpage", "u");
            d.record("read_file", "f");
            let _ = i;
        }
        assert!(d.cycle_detected());
    }

    #[test]
    fn two_repetitions_are_not_enough() {
        let mut d = StuckDetector::new();
        for _ in 0..2 {
            d.record("list_directory", "d1");
            d.record("read_file", "f1");
        }
        assert!(!d.cycle_detected());
    }

    #[test]
    fn varied_work_is_not_stuck() {
        let mut d = StuckDetector::new();
        d.record("list_directory", "1");
        d.record("read_file", "2");
        d.record("edit_file", "3");
        d.record("run_command", "4");
        d.record("read_file", "5");
        d.record("write_file", "6");
        assert!(!d.is_stuck());
    }

    #[test]
    fn reset_clears_the_window() {
        let mut d = StuckDetector::new();
        for _ in 0..3 {
            d.record("read_file", "same");
        }
        assert!(d.is_stuck());
        d.reset();
        assert!(!d.is_stuck());
    }

    #[test]
    fn window_is_bounded() {
        let mut d = StuckDetector::new();
        for i in 0..100 {
            d.record("t", &i.to_string());
        }
        assert!(d.window.len() <= WINDOW);
    }
}
