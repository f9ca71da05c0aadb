// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call extraction from free-form model output.
//!
//! Five progressive methods run in order; the first that yields at least one
//! call wins:
//!
//! 1. fenced ```json blocks
//! 2. standalone raw `{"tool": …}` objects outside fences
//! 3. function-call variants: pythonic `name(arg=value)`, XML-ish
//!    `<tool_call>…</tool_call>`, the OpenAI array form, and the wrapped
//!    `{"function": {…}}` form
//! 4. inline bare JSON with `tool` + `params` keys buried in prose
//! 5. a repair pass that splices a following code block into an empty
//!    `write_file` content parameter
//!
//! Extracted calls are normalized (alias mapping, parameter coercions) and
//! validated against the registry name list.  Input is capped at 200 KB to
//! bound the quadratic brace scans.

mod extract;
mod normalize;

use runa_tools::{CallOrigin, ToolCall};
use tracing::debug;

pub use normalize::ALIASES;

/// Input cap.  Responses beyond this are truncated before scanning.
const INPUT_CAP_BYTES: usize = 200 * 1024;

/// A structured call before normalization.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawCall {
    pub name: String,
    pub params: serde_json::Value,
}

/// Extract tool calls from `text`.
///
/// `registry_names` is the set of valid tool names; calls that do not
/// resolve to one of them (after aliasing) are dropped.  When `chat_task` is
/// set and the response consists *only* of an OpenAI-style function array
/// whose tool is not in the registry, the whole response is treated as
/// fabricated and no calls are returned — the caller suppresses the output.
pub fn parse_tool_calls(
    text: &str,
    registry_names: &[String],
    chat_task: bool,
) -> Vec<ToolCall> {
    let text = cap_input(text);

    // Chat gate: a chat turn that is nothing but a made-up function-call
    // array is hallucinated tool use, not an answer.
    if chat_task && extract::is_pure_unknown_function_array(text, registry_names) {
        debug!("chat-task response is a fabricated function array; dropping");
        return Vec::new();
    }
    if chat_task {
        // Chat turns expose no tools; nothing to parse.
        return Vec::new();
    }

    let raw = extract::extract(text);
    if raw.is_empty() {
        return Vec::new();
    }

    let mut calls: Vec<ToolCall> = raw
        .into_iter()
        .filter_map(|r| normalize::normalize(r, registry_names))
        .map(|r| ToolCall::new(r.name, r.params, CallOrigin::TextParsed))
        .collect();

    extract::repair_empty_write_content(text, &mut calls);
    calls
}

/// True when a chat-classified response is nothing but a fabricated
/// function-call array (§ chat gate).  The loop uses this to suppress the
/// response entirely: no output is displayed and no tool is executed.
pub fn is_fabricated_chat_response(text: &str, registry_names: &[String]) -> bool {
    extract::is_pure_unknown_function_array(cap_input(text), registry_names)
}

/// Render a call in the canonical fenced form the parser's first method
/// reads back.  `parse(render(c))` reproduces the call (modulo the fresh id).
pub fn render_tool_call(call: &ToolCall) -> String {
    let body = serde_json::json!({
        "tool": call.name,
        "params": call.params,
    });
    format!("```json\n{}\n```", serde_json::to_string_pretty(&body).expect("object"))
}

fn cap_input(text: &str) -> &str {
    if text.len() <= INPUT_CAP_BYTES {
        return text;
    }
    let mut cut = INPUT_CAP_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
