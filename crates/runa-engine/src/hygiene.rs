// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming hygiene: think-tag suppression and ChatML garbage scrubbing.
//!
//! Two invariants live here:
//!
//! 1. A rolling tag buffer detects *partial* `<think>` open tags so that no
//!    fragment of a thinking block ever reaches user-facing output before it
//!    is classified.  On stream end, any remaining non-thinking buffer
//!    content is flushed.
//! 2. The in-stream scrubber and the stored-to-history sanitizer use the
//!    same regex ([`scrub_chatml`]).  Keeping a single definition is load
//!    bearing: if they diverge, a turn can pass streaming but fail the
//!    history invariant (no stored model turn may carry ChatML tokens).

use std::sync::OnceLock;

use regex::Regex;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// ChatML and template control tokens that leak out of some served models.
fn garbage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"<\|im_start\|>(?:system|user|assistant)?\n?|<\|im_end\|>|<\|endoftext\|>|<\|eot_id\|>|<\|start_header_id\|>[a-z]*<\|end_header_id\|>|<\|assistant\|>|<\|user\|>|<\|system\|>",
        )
        .expect("static regex")
    })
}

/// Remove leaked ChatML control tokens.
///
/// Used both for streamed deltas and for the final text stored into chat
/// history — callers must not introduce a second scrubbing definition.
pub fn scrub_chatml(text: &str) -> String {
    garbage_re().replace_all(text, "").into_owned()
}

/// Fraction of `text` (by bytes) that is ChatML control-token content.
pub fn chatml_fraction(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    let scrubbed = scrub_chatml(text);
    (text.len() - scrubbed.len()) as f32 / text.len() as f32
}

/// One classified chunk of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Visible(String),
    Thinking(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    InThink,
}

/// Stateful filter that splits a token stream into visible and thinking
/// chunks.  Tag fragments that arrive split across deltas (`<th` + `ink>`)
/// are held back until they can be classified.
#[derive(Debug)]
pub struct ThinkTagFilter {
    state: State,
    pending: String,
}

impl Default for ThinkTagFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkTagFilter {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            pending: String::new(),
        }
    }

    /// Feed one streamed delta; returns zero or more classified chunks.
    pub fn push(&mut self, delta: &str) -> Vec<StreamChunk> {
        self.pending.push_str(delta);
        let mut out = Vec::new();
        loop {
            match self.state {
                State::Normal => {
                    if let Some(pos) = self.pending.find(THINK_OPEN) {
                        if pos > 0 {
                            out.push(StreamChunk::Visible(self.pending[..pos].to_string()));
                        }
                        self.pending.drain(..pos + THINK_OPEN.len());
                        self.state = State::InThink;
                        continue;
                    }
                    // Hold back a tail that could still become "<think>".
                    let keep = partial_tag_suffix(&self.pending, THINK_OPEN);
                    let emit_to = self.pending.len() - keep;
                    if emit_to > 0 {
                        out.push(StreamChunk::Visible(
                            self.pending[..emit_to].to_string(),
                        ));
                        self.pending.drain(..emit_to);
                    }
                    break;
                }
                State::InThink => {
                    if let Some(pos) = self.pending.find(THINK_CLOSE) {
                        if pos > 0 {
                            out.push(StreamChunk::Thinking(self.pending[..pos].to_string()));
                        }
                        self.pending.drain(..pos + THINK_CLOSE.len());
                        self.state = State::Normal;
                        continue;
                    }
                    let keep = partial_tag_suffix(&self.pending, THINK_CLOSE);
                    let emit_to = self.pending.len() - keep;
                    if emit_to > 0 {
                        out.push(StreamChunk::Thinking(
                            self.pending[..emit_to].to_string(),
                        ));
                        self.pending.drain(..emit_to);
                    }
                    break;
                }
            }
        }
        // Drop empty chunks produced by pure-tag deltas.
        out.retain(|c| match c {
            StreamChunk::Visible(s) | StreamChunk::Thinking(s) => !s.is_empty(),
        });
        out
    }

    /// Flush the remaining buffer at stream end.  An unclosed think block
    /// (model truncated) counts as thinking; everything else is visible.
    pub fn finish(mut self) -> Vec<StreamChunk> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let chunk = match self.state {
            State::Normal => StreamChunk::Visible(std::mem::take(&mut self.pending)),
            State::InThink => StreamChunk::Thinking(std::mem::take(&mut self.pending)),
        };
        vec![chunk]
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        if tag.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
