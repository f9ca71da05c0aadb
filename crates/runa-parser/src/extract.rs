// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The five extraction methods.

use std::sync::OnceLock;

use regex::Regex;
use runa_tools::ToolCall;
use serde_json::Value;

use crate::normalize::resolve_alias;
use crate::RawCall;

/// Run the methods in order; the first that yields ≥ 1 call wins.
pub(crate) fn extract(text: &str) -> Vec<RawCall> {
    let from_fences = fenced_json_blocks(text);
    if !from_fences.is_empty() {
        return from_fences;
    }
    let from_raw = raw_json_blocks(text);
    if !from_raw.is_empty() {
        return from_raw;
    }
    let from_variants = function_call_variants(text);
    if !from_variants.is_empty() {
        return from_variants;
    }
    inline_bare_json(text)
}

// ── Balanced-delimiter scanning ──────────────────────────────────────────────

/// Find the byte index one past the delimiter that balances `text[start]`.
///
/// Strings are skipped with a simple escape-aware scanner: a quote preceded
/// by a backslash does not close the string.  This deliberately does not
/// model quadruple-backslash sequences (`\\\\"`); those are rare enough in
/// model output that the extra state machine is not worth carrying.
fn match_balanced(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let open = *bytes.get(start)?;
    let close = match open {
        b'{' => b'}',
        b'[' => b']',
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Interpret a parsed JSON value as zero or more canonical calls.
///
/// Accepted shapes:
/// - `{"tool": "...", "params": {...}}`
/// - `{"name": "...", "arguments": {...} | "json-string"}`
/// - `{"function": {"name": ..., "arguments": ...}}` (wrapped form)
/// - an array of any of the above (OpenAI parallel form)
fn calls_from_value(value: &Value) -> Vec<RawCall> {
    match value {
        Value::Array(items) => items.iter().flat_map(calls_from_value).collect(),
        Value::Object(map) => {
            if let Some(inner) = map.get("function") {
                return calls_from_value(inner);
            }
            let name = map
                .get("tool")
                .or_else(|| map.get("name"))
                .and_then(|v| v.as_str());
            let Some(name) = name else {
                return Vec::new();
            };
            let params = map
                .get("params")
                .or_else(|| map.get("arguments"))
                .or_else(|| map.get("parameters"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            // OpenAI-style string-encoded arguments.
            let params = match params {
                Value::String(s) => {
                    serde_json::from_str(&s).unwrap_or(Value::Object(Default::default()))
                }
                other => other,
            };
            if !params.is_object() {
                return Vec::new();
            }
            vec![RawCall {
                name: name.to_string(),
                params,
            }]
        }
        _ => Vec::new(),
    }
}

// ── Method 1: fenced ```json blocks ──────────────────────────────────────────

fn fenced_json_blocks(text: &str) -> Vec<RawCall> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find("```json") {
        let body_start = cursor + rel + "```json".len();
        let Some(rel_end) = text[body_start..].find("```") else {
            break;
        };
        let body = &text[body_start..body_start + rel_end];
        out.extend(parse_json_payloads(body));
        cursor = body_start + rel_end + 3;
    }
    out
}

/// Parse every balanced JSON payload in `body`.
fn parse_json_payloads(body: &str) -> Vec<RawCall> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let Some(rel) = body[pos..].find(|c| c == '{' || c == '[') else {
            break;
        };
        let start = pos + rel;
        match match_balanced(body, start) {
            Some(end) => {
                if let Ok(v) = serde_json::from_str::<Value>(&body[start..end]) {
                    out.extend(calls_from_value(&v));
                }
                pos = end;
            }
            None => break,
        }
    }
    out
}

// ── Method 2: standalone raw JSON ────────────────────────────────────────────

fn raw_json_blocks(text: &str) -> Vec<RawCall> {
    let mut out = Vec::new();
    for line_start in line_starts(text) {
        let rest = &text[line_start..];
        let trimmed_offset = rest.len() - rest.trim_start().len();
        let start = line_start + trimmed_offset;
        if !matches!(text.as_bytes().get(start), Some(b'{')) {
            continue;
        }
        if let Some(end) = match_balanced(text, start) {
            if let Ok(v) = serde_json::from_str::<Value>(&text[start..end]) {
                let calls = calls_from_value(&v);
                if !calls.is_empty() {
                    out.extend(calls);
                }
            }
        }
    }
    out
}

fn line_starts(text: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' && i + 1 < text.len() {
            starts.push(i + 1);
        }
    }
    starts
}

// ── Method 3: function-call variants ─────────────────────────────────────────

fn function_call_variants(text: &str) -> Vec<RawCall> {
    let xml = xml_tool_calls(text);
    if !xml.is_empty() {
        return xml;
    }
    let arrays = openai_arrays(text);
    if !arrays.is_empty() {
        return arrays;
    }
    pythonic_calls(text)
}

fn xml_tool_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("static regex"))
}

fn xml_tool_calls(text: &str) -> Vec<RawCall> {
    xml_tool_call_re()
        .captures_iter(text)
        .filter_map(|c| serde_json::from_str::<Value>(c[1].trim()).ok())
        .flat_map(|v| calls_from_value(&v))
        .collect()
}

fn openai_arrays(text: &str) -> Vec<RawCall> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('[') {
        let start = pos + rel;
        match match_balanced(text, start) {
            Some(end) => {
                if let Ok(Value::Array(items)) =
                    serde_json::from_str::<Value>(&text[start..end])
                {
                    let calls: Vec<RawCall> = items
                        .iter()
                        .filter(|i| i.get("name").is_some() || i.get("function").is_some())
                        .flat_map(calls_from_value)
                        .collect();
                    if !calls.is_empty() {
                        out.extend(calls);
                        pos = end;
                        continue;
                    }
                }
                pos = start + 1;
            }
            None => break,
        }
    }
    out
}

fn pythonic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_]*)\(([^()]+)\)").expect("static regex")
    })
}

/// Pythonic `tool_name(arg="value", n=3)` calls.
///
/// Requires at least one `key=value` pair so that prose like `helper(x)`
/// never parses, and requires the callee to resolve to a known alias or
/// registry-shaped name.
fn pythonic_calls(text: &str) -> Vec<RawCall> {
    let mut out = Vec::new();
    for caps in pythonic_re().captures_iter(text) {
        let name = caps[1].to_string();
        let Some(params) = parse_kwargs(&caps[2]) else {
            continue;
        };
        // Only treat it as a tool call when the name is plausibly a tool:
        // resolvable through the alias table keeps `println` etc. out.
        if resolve_alias(&name).is_none() {
            continue;
        }
        out.push(RawCall { name, params });
    }
    out
}

/// Parse `key="value", key2=42, flag=true` into a JSON object.
/// Returns `None` unless every comma-separated piece is a `key=value` pair.
fn parse_kwargs(args: &str) -> Option<Value> {
    let mut map = serde_json::Map::new();
    for piece in split_top_level_commas(args) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (key, value) = piece.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        map.insert(key.to_string(), parse_scalar(value.trim()));
    }
    if map.is_empty() {
        return None;
    }
    Some(Value::Object(map))
}

/// Split on commas that are not inside quotes.
fn split_top_level_commas(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for c in args.chars() {
        match in_string {
            Some(q) => {
                current.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    in_string = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    in_string = Some(c);
                    current.push(c);
                }
                ',' => {
                    out.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn parse_scalar(raw: &str) -> Value {
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    if raw == "true" || raw == "True" {
        return Value::Bool(true);
    }
    if raw == "false" || raw == "False" {
        return Value::Bool(false);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

// ── Method 4: inline bare JSON ───────────────────────────────────────────────

fn inline_bare_json(text: &str) -> Vec<RawCall> {
    let mut out = Vec::new();
    let mut seen_spans: Vec<(usize, usize)> = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find("\"tool\"") {
        let key_pos = cursor + rel;
        cursor = key_pos + 6;
        // Walk back to the nearest opening brace.
        let Some(start) = text[..key_pos].rfind('{') else {
            continue;
        };
        if seen_spans.iter().any(|&(s, e)| start >= s && start < e) {
            continue;
        }
        if let Some(end) = match_balanced(text, start) {
            if let Ok(v) = serde_json::from_str::<Value>(&text[start..end]) {
                let calls = calls_from_value(&v);
                if !calls.is_empty() {
                    seen_spans.push((start, end));
                    out.extend(calls);
                }
            }
        }
    }
    out
}

// ── Chat gate helper ─────────────────────────────────────────────────────────

/// True when the trimmed response is nothing but an OpenAI function array
/// whose every tool name fails registry resolution — the signature of a
/// fabricated call on a chat turn.
pub(crate) fn is_pure_unknown_function_array(text: &str, registry_names: &[String]) -> bool {
    let trimmed = text.trim();
    if !trimmed.starts_with('[') {
        return false;
    }
    let Some(end) = match_balanced(trimmed, 0) else {
        return false;
    };
    if !trimmed[end..].trim().is_empty() {
        return false;
    }
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) else {
        return false;
    };
    if items.is_empty() {
        return false;
    }
    items.iter().all(|item| {
        let name = item
            .get("name")
            .or_else(|| item.get("function").and_then(|f| f.get("name")))
            .and_then(|v| v.as_str());
        match name {
            Some(n) => {
                let resolved = resolve_alias(n).unwrap_or_else(|| n.to_string());
                !registry_names.iter().any(|r| r == &resolved)
            }
            None => true,
        }
    })
}

// ── Method 5: repair pass ────────────────────────────────────────────────────

/// Splice a following non-JSON code block into an empty `write_file`
/// content parameter.  Models regularly emit the call with empty content and
/// then "show" the file in a separate fence.
pub(crate) fn repair_empty_write_content(text: &str, calls: &mut [ToolCall]) {
    let blocks = non_json_code_blocks(text);
    if blocks.is_empty() {
        return;
    }
    let mut next_block = blocks.into_iter();
    for call in calls.iter_mut() {
        if call.name != "write_file" {
            continue;
        }
        let empty = call
            .params
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.is_empty())
            .unwrap_or(false);
        if !empty {
            continue;
        }
        if let Some(block) = next_block.next() {
            call.params["content"] = Value::String(block);
        }
    }
}

fn non_json_code_blocks(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find("```") {
        let fence_start = cursor + rel + 3;
        let Some(lang_end_rel) = text[fence_start..].find('\n') else {
            break;
        };
        let lang = text[fence_start..fence_start + lang_end_rel].trim();
        let body_start = fence_start + lang_end_rel + 1;
        let Some(body_end_rel) = text[body_start..].find("```") else {
            break;
        };
        let body = &text[body_start..body_start + body_end_rel];
        if lang != "json" {
            out.push(body.trim_end_matches('\n').to_string());
        }
        cursor = body_start + body_end_rel + 3;
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_simple_object() {
        let t = r#"{"a": 1}"#;
        assert_eq!(match_balanced(t, 0), Some(t.len()));
    }

    #[test]
    fn balanced_skips_braces_inside_strings() {
        let t = r#"{"a": "}}}"}"#;
        assert_eq!(match_balanced(t, 0), Some(t.len()));
    }

    #[test]
    fn balanced_handles_escaped_quote() {
        let t = r#"{"a": "say \"hi\" {ok}"}"#;
        assert_eq!(match_balanced(t, 0), Some(t.len()));
    }

    #[test]
    fn unbalanced_returns_none() {
        assert_eq!(match_balanced(r#"{"a": 1"#, 0), None);
    }

    #[test]
    fn calls_from_wrapped_function() {
        let v: Value = serde_json::from_str(
            r#"{"function": {"name": "read_file", "arguments": {"file_path": "x"}}}"#,
        )
        .unwrap();
        let calls = calls_from_value(&v);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
    }

    #[test]
    fn string_arguments_are_decoded() {
        let v: Value = serde_json::from_str(
            r#"{"name": "run_command", "arguments": "{\"command\": \"ls\"}"}"#,
        )
        .unwrap();
        let calls = calls_from_value(&v);
        assert_eq!(calls[0].params["command"], "ls");
    }

    #[test]
    fn kwargs_parse_scalars() {
        let v = parse_kwargs(r#"path="src", count=3, all=true"#).unwrap();
        assert_eq!(v["path"], "src");
        assert_eq!(v["count"], 3);
        assert_eq!(v["all"], true);
    }

    #[test]
    fn kwargs_reject_positional_args() {
        assert!(parse_kwargs("x").is_none());
        assert!(parse_kwargs("a, b").is_none());
    }

    #[test]
    fn kwargs_comma_inside_string_is_preserved() {
        let v = parse_kwargs(r#"content="a, b, c""#).unwrap();
        assert_eq!(v["content"], "a, b, c");
    }

    #[test]
    fn code_blocks_skip_json_fences() {
        let text = "```json\n{}\n```\n```rust\nfn main() {}\n```";
        let blocks = non_json_code_blocks(text);
        assert_eq!(blocks, vec!["fn main() {}".to_string()]);
    }
}
