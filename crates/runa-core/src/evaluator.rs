// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pre-commit response evaluation.
//!
//! Runs on every iteration's raw response, before tool extraction.  A bad
//! response that reaches chat history poisons every later iteration — the
//! model sees its own refusal or hallucination as precedent — so the cheap
//! checks happen here, pre-commit.

use std::sync::OnceLock;

use regex::Regex;
use runa_tools::ExecutionState;

use crate::classify::TaskKind;

/// Iteration window in which refusals are rolled back rather than committed.
///
/// Shared by the evaluator and the failure classifier — the two must agree,
/// otherwise refusals in the gap get committed and then classified as
/// failures after the fact.
pub const REFUSAL_NUDGE_WINDOW: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    Refusal,
    ActionHallucination,
    CodeDump,
    Truncation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Append to history and continue to tool extraction.
    Commit,
    /// Restore the checkpoint and retry with lowered temperature.
    Rollback(RollbackReason),
    /// Retry silently without appending anything to history.
    Skip,
}

/// Everything the evaluator looks at for one response.
pub struct EvalInput<'a> {
    /// Visible text, post think-stripping and scrubbing.
    pub text: &'a str,
    /// The stream produced only thinking-channel content.
    pub thinking_only: bool,
    /// 1-based iteration number.
    pub iteration: u32,
    /// The generation stopped at the token cap.
    pub hit_token_cap: bool,
    pub task: TaskKind,
    pub exec: &'a ExecutionState,
}

fn refusal_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^I cannot\b",
            r"(?i)^I can't\b",
            r"(?i)^I can not\b",
            r"(?i)I'?m not able to\b",
            r"(?i)I am not able to\b",
            r"(?i)I'?m unable to\b",
            r"(?i)I am unable to\b",
            r"(?i)\bas an AI\b",
            r"(?i)\bas a language model\b",
            r"(?i)\bas an artificial intelligence\b",
            r"(?i)^I'?m sorry,? but\b",
            r"(?i)^I apologize,? but\b",
            r"(?i)I won'?t be able to\b",
            r"(?i)\bcannot assist with\b",
            r"(?i)\bcan'?t help with\b",
            r"(?i)\bnot able to help\b",
            r"(?i)\bagainst my (guidelines|programming|principles)\b",
            r"(?i)^I must decline\b",
            r"(?i)I'?m not capable of\b",
            r"(?i)I don'?t have the ability to\b",
            r"(?i)I do not have (access|the ability)\b",
            r"(?i)I'?m afraid I (cannot|can'?t)\b",
            r"(?i)\bbeyond my capabilities\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

fn looks_like_refusal(text: &str) -> bool {
    refusal_patterns().iter().any(|re| re.is_match(text))
}

/// Claims of actions that the execution record does not back up.
fn claims_fabricated_action(text: &str, exec: &ExecutionState) -> bool {
    static VISIT: OnceLock<Regex> = OnceLock::new();
    static WRITE: OnceLock<Regex> = OnceLock::new();
    static RUN: OnceLock<Regex> = OnceLock::new();
    let visit = VISIT.get_or_init(|| {
        Regex::new(r"(?i)\bI(?:'ve| have)? (?:visited|browsed|navigated to|opened) ")
            .expect("static regex")
    });
    let write = WRITE.get_or_init(|| {
        Regex::new(r"(?i)\bI(?:'ve| have)? (?:written|wrote|created|saved) (?:the |a )?file")
            .expect("static regex")
    });
    let run = RUN.get_or_init(|| {
        Regex::new(r"(?i)\bI(?:'ve| have)? (?:ran|run|executed) (?:the )?command")
            .expect("static regex")
    });

    if visit.is_match(text) && !exec.has_gathered_data() {
        return true;
    }
    if write.is_match(text) && exec.files_written().is_empty() {
        return true;
    }
    if run.is_match(text) && !exec.has_gathered_data() {
        return true;
    }
    false
}

/// True when > 80 % of the response is a single code fence with no
/// natural-language framing around it.
fn is_raw_code_dump(text: &str) -> bool {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return false;
    };
    // ```json fences are the tool-call protocol, not a dump.
    if trimmed[open..].starts_with("```json") {
        return false;
    }
    let after_open = &trimmed[open + 3..];
    let Some(close_rel) = after_open.find("```") else {
        // Unterminated fence covering the rest of the response.
        return open < trimmed.len() / 5;
    };
    let fence_len = close_rel + 6;
    // A second fence means interleaved prose and code — not a dump.
    if after_open[close_rel + 3..].contains("```") {
        return false;
    }
    fence_len as f32 / trimmed.len() as f32 > 0.8
}

/// Response ends mid-sentence: no terminator and no closing structure.
fn ends_mid_sentence(text: &str) -> bool {
    let trimmed = text.trim_end();
    let Some(last) = trimmed.chars().last() else {
        return false;
    };
    !matches!(last, '.' | '!' | '?' | ':' | '`' | ')' | ']' | '}' | '"' | '\'')
}

/// Classify one response.  See the table in the module docs: SKIP for
/// content-free output, ROLLBACK for iteration-sensitive failure shapes,
/// COMMIT for everything else.
pub fn evaluate(input: &EvalInput<'_>) -> Verdict {
    let text = input.text.trim();

    // Empty, whitespace, or thinking-only output: retry without appending.
    if text.is_empty() || input.thinking_only {
        return Verdict::Skip;
    }

    if looks_like_refusal(text) {
        // Early refusals are usually priming artifacts and a retry fixes
        // them; late ones are genuine and committing is more honest than
        // looping.  The window is shared with the failure classifier.
        if input.iteration <= REFUSAL_NUDGE_WINDOW {
            return Verdict::Rollback(RollbackReason::Refusal);
        }
        return Verdict::Commit;
    }

    if input.iteration <= 3
        && input.task != TaskKind::Chat
        && claims_fabricated_action(text, input.exec)
    {
        return Verdict::Rollback(RollbackReason::ActionHallucination);
    }

    if input.iteration <= 2 && is_raw_code_dump(text) {
        return Verdict::Rollback(RollbackReason::CodeDump);
    }

    if input.hit_token_cap && ends_mid_sentence(text) {
        return Verdict::Rollback(RollbackReason::Truncation);
    }

    Verdict::Commit
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> ExecutionState {
        ExecutionState::new()
    }

    fn input<'a>(text: &'a str, iteration: u32, exec: &'a ExecutionState) -> EvalInput<'a> {
        EvalInput {
            text,
            thinking_only: false,
            iteration,
            hit_token_cap: false,
            task: TaskKind::Code,
            exec,
        }
    }

    // ── SKIP ──────────────────────────────────────────────────────────────────

    #[test]
    fn empty_response_skips() {
        let e = exec();
        assert_eq!(evaluate(&input("", 1, &e)), Verdict::Skip);
        assert_eq!(evaluate(&input("   \n\t ", 1, &e)), Verdict::Skip);
    }

    #[test]
    fn thinking_only_response_skips() {
        let e = exec();
        let mut i = input("leftover", 1, &e);
        i.thinking_only = true;
        assert_eq!(evaluate(&i), Verdict::Skip);
    }

    // ── Refusals ──────────────────────────────────────────────────────────────

    #[test]
    fn early_refusal_rolls_back() {
        let e = exec();
        assert_eq!(
            evaluate(&input("I cannot help with that request.", 2, &e)),
            Verdict::Rollback(RollbackReason::Refusal)
        );
        assert_eq!(
            evaluate(&input("As an AI, I don't have opinions.", 1, &e)),
            Verdict::Rollback(RollbackReason::Refusal)
        );
    }

    #[test]
    fn refusal_at_window_edge_rolls_back() {
        let e = exec();
        assert_eq!(
            evaluate(&input("I'm unable to continue.", REFUSAL_NUDGE_WINDOW, &e)),
            Verdict::Rollback(RollbackReason::Refusal)
        );
    }

    #[test]
    fn iteration_six_refusal_commits() {
        // Boundary behavior from the contract: both the evaluator and the
        // failure classifier use the same threshold.
        let e = exec();
        assert_eq!(
            evaluate(&input("I cannot do that.", REFUSAL_NUDGE_WINDOW + 1, &e)),
            Verdict::Commit
        );
    }

    #[test]
    fn normal_text_mentioning_cannot_midsentence_commits() {
        let e = exec();
        assert_eq!(
            evaluate(&input("The borrow checker says we cannot alias here.", 1, &e)),
            Verdict::Commit
        );
    }

    // ── Hallucinated actions ──────────────────────────────────────────────────

    #[test]
    fn fabricated_visit_rolls_back_early() {
        let e = exec();
        assert_eq!(
            evaluate(&input("I visited the page and it shows prices.", 2, &e)),
            Verdict::Rollback(RollbackReason::ActionHallucination)
        );
    }

    #[test]
    fn backed_up_visit_commits() {
        let e = exec();
        e.record_visit("https://example.com");
        assert_eq!(
            evaluate(&input("I visited the page and it shows prices.", 2, &e)),
            Verdict::Commit
        );
    }

    #[test]
    fn fabricated_write_claim_rolls_back() {
        let e = exec();
        assert_eq!(
            evaluate(&input("I've created the file you asked for.", 1, &e)),
            Verdict::Rollback(RollbackReason::ActionHallucination)
        );
    }

    #[test]
    fn late_hallucination_is_committed() {
        let e = exec();
        assert_eq!(
            evaluate(&input("I visited the page earlier.", 4, &e)),
            Verdict::Commit
        );
    }

    // ── Code dumps ────────────────────────────────────────────────────────────

    #[test]
    fn raw_code_dump_rolls_back_at_iteration_two() {
        let e = exec();
        let dump = format!("```python\n{}\n```", "x = 1\n".repeat(200));
        assert_eq!(
            evaluate(&input(&dump, 2, &e)),
            Verdict::Rollback(RollbackReason::CodeDump)
        );
    }

    #[test]
    fn code_dump_after_iteration_two_commits() {
        let e = exec();
        let dump = format!("```python\n{}\n```", "x = 1\n".repeat(200));
        assert_eq!(evaluate(&input(&dump, 3, &e)), Verdict::Commit);
    }

    #[test]
    fn framed_code_block_commits() {
        let e = exec();
        let framed = format!(
            "Here is the implementation with notes on each step, explaining \
             the approach taken and the trade-offs involved in detail:\n```rust\n{}\n```\n\
             The key point is the iterator chain shown above, which avoids the \
             intermediate allocation entirely.",
            "let x = 1;\n".repeat(10)
        );
        assert_eq!(evaluate(&input(&framed, 1, &e)), Verdict::Commit);
    }

    // ── Truncation ────────────────────────────────────────────────────────────

    #[test]
    fn token_capped_midsentence_rolls_back() {
        let e = exec();
        let mut i = input("The result of the calculation is appro", 3, &e);
        i.hit_token_cap = true;
        assert_eq!(evaluate(&i), Verdict::Rollback(RollbackReason::Truncation));
    }

    #[test]
    fn token_capped_with_terminator_commits() {
        let e = exec();
        let mut i = input("Done. All files are updated.", 3, &e);
        i.hit_token_cap = true;
        assert_eq!(evaluate(&i), Verdict::Commit);
    }

    #[test]
    fn midsentence_without_cap_commits() {
        let e = exec();
        assert_eq!(
            evaluate(&input("Partial but not capped so", 3, &e)),
            Verdict::Commit
        );
    }
}
