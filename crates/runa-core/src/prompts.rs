// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt assembly.
//!
//! The system text is built in strict priority order — preamble, tool
//! definitions, memory, RAG context, file context, error-context header —
//! against ONE shared token budget.  Static and dynamic content compete for
//! the same budget; there are not two pools.
//!
//! Rendering to the backend's raw `/completion` prompt goes through the
//! selected chat wrapper.

use std::path::Path;

use runa_tools::ToolSchema;

use crate::classify::TaskKind;
use crate::history::{ChatTurn, Role};

/// Project-level prompt file injected verbatim into the preamble.
const PROJECT_PROMPT_FILE: &str = ".prompt.md";

pub struct PromptInputs<'a> {
    pub task: TaskKind,
    pub tools: &'a [ToolSchema],
    pub few_shot_count: u8,
    pub memory: Option<&'a str>,
    pub rag: Option<&'a str>,
    pub file_context: Option<&'a str>,
    pub error_context: Option<&'a str>,
    pub project_prompt: Option<&'a str>,
}

/// Read `.prompt.md` from the project root, if present.
pub fn load_project_prompt(root: &Path) -> Option<String> {
    std::fs::read_to_string(root.join(PROJECT_PROMPT_FILE)).ok()
}

fn preamble(task: TaskKind, project_prompt: Option<&str>) -> String {
    let mut out = String::from(
        "You are the coding assistant built into this IDE. You work inside \
         the user's project and act through tools. Ground every statement \
         about files, directories and pages in actual tool output — never \
         describe results from memory. When the task is done, answer \
         concisely in plain language.\n",
    );
    match task {
        TaskKind::Chat => {
            out.push_str("\nThis is a conversational turn. Reply briefly; do not call tools.\n");
        }
        TaskKind::Browser => {
            out.push_str(
                "\nThis task involves web pages. Navigate first, read the \
                 snapshot, then act. One page interaction at a time.\n",
            );
        }
        TaskKind::Code => {
            out.push_str(
                "\nThis is a code task. Read before you edit. Prefer \
                 edit_file over rewriting whole files.\n",
            );
        }
        TaskKind::General => {}
    }
    if let Some(project) = project_prompt {
        out.push('\n');
        out.push_str(project);
        if !project.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn render_tool_definitions(tools: &[ToolSchema], few_shot_count: u8) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "\n## Tools\n\
         Call a tool by replying with a fenced JSON block:\n\
         ```json\n{\"tool\": \"<name>\", \"params\": { ... }}\n```\n\
         One block per call. Available tools:\n\n",
    );
    for t in tools {
        out.push_str(&format!("### {}\n{}\nParameters: {}\n\n", t.name, t.description, t.parameters));
    }
    if few_shot_count > 0 {
        out.push_str("## Examples\n");
        out.push_str(&few_shots(few_shot_count));
    }
    out
}

/// Worked examples for small models; larger tiers get none.
fn few_shots(count: u8) -> String {
    let examples = [
        "User: what files are here?\n```json\n{\"tool\": \"list_directory\", \"params\": {\"path\": \".\"}}\n```\n",
        "User: create notes.txt saying hello\n```json\n{\"tool\": \"write_file\", \"params\": {\"file_path\": \"notes.txt\", \"content\": \"hello\"}}\n```\n",
        "User: run the tests\n```json\n{\"tool\": \"run_command\", \"params\": {\"command\": \"cargo test\"}}\n```\n",
    ];
    examples
        .iter()
        .take(count as usize)
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assemble the system text within `budget_tokens` (4 chars ≈ 1 token).
///
/// Sections are added in priority order; the first section that does not
/// fit is truncated and everything after it is dropped.
pub fn build_system_text(inputs: &PromptInputs<'_>, budget_tokens: usize) -> String {
    let budget_chars = budget_tokens.saturating_mul(4);
    let mut out = String::new();

    let sections: Vec<String> = vec![
        preamble(inputs.task, inputs.project_prompt),
        render_tool_definitions(inputs.tools, inputs.few_shot_count),
        inputs
            .memory
            .map(|m| format!("\n## Memory\n{m}\n"))
            .unwrap_or_default(),
        inputs
            .rag
            .map(|r| format!("\n## Related project context\n{r}\n"))
            .unwrap_or_default(),
        inputs
            .file_context
            .map(|f| format!("\n## Open files\n{f}\n"))
            .unwrap_or_default(),
        inputs
            .error_context
            .map(|e| format!("\n## Recent error\n{e}\n"))
            .unwrap_or_default(),
    ];

    for section in sections {
        if section.is_empty() {
            continue;
        }
        let remaining = budget_chars.saturating_sub(out.len());
        if remaining == 0 {
            break;
        }
        if section.len() <= remaining {
            out.push_str(&section);
        } else {
            let mut cut = remaining;
            while cut > 0 && !section.is_char_boundary(cut) {
                cut -= 1;
            }
            out.push_str(&section[..cut]);
            out.push_str("\n[context truncated to fit budget]\n");
            break;
        }
    }
    out
}

// ── Prompt rendering ─────────────────────────────────────────────────────────

/// Render the conversation for the backend's raw completion endpoint using
/// the selected chat wrapper.  Unknown wrappers fall back to a plain
/// role-tag format.
pub fn render_prompt(wrapper_name: Option<&str>, turns: &[ChatTurn]) -> String {
    match wrapper_name {
        Some("chatml") => render_chatml(turns),
        Some("llama-3") => render_llama3(turns),
        _ => render_generic(turns),
    }
}

fn render_chatml(turns: &[ChatTurn]) -> String {
    let mut out = String::new();
    for t in turns {
        let role = match t.role {
            Role::System => "system",
            Role::User => "user",
            Role::Model => "assistant",
        };
        out.push_str(&format!("<|im_start|>{role}\n{}<|im_end|>\n", t.text));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn render_llama3(turns: &[ChatTurn]) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for t in turns {
        let role = match t.role {
            Role::System => "system",
            Role::User => "user",
            Role::Model => "assistant",
        };
        out.push_str(&format!(
            "<|start_header_id|>{role}<|end_header_id|>\n\n{}<|eot_id|>",
            t.text
        ));
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

fn render_generic(turns: &[ChatTurn]) -> String {
    let mut out = String::new();
    for t in turns {
        let role = match t.role {
            Role::System => "### System",
            Role::User => "### User",
            Role::Model => "### Assistant",
        };
        out.push_str(&format!("{role}\n{}\n\n", t.text));
    }
    out.push_str("### Assistant\n");
    out
}

// ── Tool-call grammar ────────────────────────────────────────────────────────

/// GBNF grammar constraining output to the canonical tool-call envelope.
/// Passed to the backend only for grammar-preferring families, and dropped
/// for the session the first time a constrained generation stalls.
pub fn tool_call_grammar() -> &'static str {
    // The free-text alternative keeps final answers possible under the
    // constraint; the call branch pins the exact envelope shape.
    r#"root ::= call | freetext
freetext ::= [^{] [^\x00]*
call ::= "{" ws "\"tool\"" ws ":" ws string ws "," ws "\"params\"" ws ":" ws object ws "}"
object ::= "{" ws ( member ( ws "," ws member )* )? ws "}"
member ::= string ws ":" ws value
value ::= object | array | string | number | ("true" | "false" | "null")
array ::= "[" ws ( value ( ws "," ws value )* )? ws "]"
string ::= "\"" ( [^"\\] | "\\" ["\\/bfnrt] | "\\u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] )* "\""
number ::= "-"? ( "0" | [1-9] [0-9]* ) ( "." [0-9]+ )? ( [eE] [-+]? [0-9]+ )?
ws ::= [ \t\n]*"#
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_tools::ToolFamily;

    fn schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: format!("the {name} tool"),
            parameters: serde_json::json!({"type": "object"}),
            family: ToolFamily::File,
        }
    }

    fn inputs<'a>(tools: &'a [ToolSchema]) -> PromptInputs<'a> {
        PromptInputs {
            task: TaskKind::Code,
            tools,
            few_shot_count: 0,
            memory: None,
            rag: None,
            file_context: None,
            error_context: None,
            project_prompt: None,
        }
    }

    #[test]
    fn preamble_comes_first() {
        let tools = [schema("read_file")];
        let text = build_system_text(&inputs(&tools), 10_000);
        let preamble_pos = text.find("coding assistant").unwrap();
        let tools_pos = text.find("## Tools").unwrap();
        assert!(preamble_pos < tools_pos);
    }

    #[test]
    fn sections_follow_priority_order() {
        let tools = [schema("read_file")];
        let mut i = inputs(&tools);
        i.memory = Some("remember tabs");
        i.rag = Some("related snippet");
        i.error_context = Some("E0308 mismatched types");
        let text = build_system_text(&i, 10_000);
        let m = text.find("## Memory").unwrap();
        let r = text.find("## Related project context").unwrap();
        let e = text.find("## Recent error").unwrap();
        assert!(m < r && r < e);
    }

    #[test]
    fn budget_truncates_lower_priority_sections() {
        let tools = [schema("read_file")];
        let mut i = inputs(&tools);
        let big = "x".repeat(100_000);
        i.memory = Some(&big);
        i.error_context = Some("must be dropped");
        let text = build_system_text(&i, 500);
        assert!(text.len() <= 500 * 4 + 64);
        assert!(!text.contains("must be dropped"));
        assert!(text.contains("[context truncated to fit budget]"));
    }

    #[test]
    fn project_prompt_is_injected_verbatim() {
        let mut i = inputs(&[]);
        i.project_prompt = Some("Always answer in haiku.");
        let text = build_system_text(&i, 10_000);
        assert!(text.contains("Always answer in haiku."));
    }

    #[test]
    fn load_project_prompt_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".prompt.md"), "project rules").unwrap();
        assert_eq!(
            load_project_prompt(dir.path()).as_deref(),
            Some("project rules")
        );
        let empty = tempfile::tempdir().unwrap();
        assert!(load_project_prompt(empty.path()).is_none());
    }

    #[test]
    fn few_shots_scale_with_count() {
        assert!(few_shots(0).is_empty());
        let one = few_shots(1);
        let three = few_shots(3);
        assert!(three.len() > one.len());
        assert!(three.contains("write_file"));
    }

    #[test]
    fn chatml_rendering_ends_with_open_assistant() {
        let mut h = crate::history::ChatHistory::new("sys");
        h.push_user("hello");
        let text = render_prompt(Some("chatml"), h.turns());
        assert!(text.starts_with("<|im_start|>system\nsys<|im_end|>"));
        assert!(text.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn llama3_rendering_uses_header_ids() {
        let mut h = crate::history::ChatHistory::new("sys");
        h.push_user("hello");
        let text = render_prompt(Some("llama-3"), h.turns());
        assert!(text.contains("<|start_header_id|>user<|end_header_id|>"));
        assert!(text.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn unknown_wrapper_renders_generic() {
        let mut h = crate::history::ChatHistory::new("sys");
        h.push_user("hello");
        let text = render_prompt(None, h.turns());
        assert!(text.contains("### User"));
        assert!(text.ends_with("### Assistant\n"));
    }

    #[test]
    fn grammar_mentions_tool_and_params() {
        let g = tool_call_grammar();
        assert!(g.contains("\\\"tool\\\""));
        assert!(g.contains("\\\"params\\\""));
        assert!(g.starts_with("root ::="));
    }
}
