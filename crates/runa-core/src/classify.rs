// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Task-type classification.
//!
//! One shared classifier labels each user message; the label routes tool
//! exposure (Chat exposes none — a hard gate), system prompt flavor and the
//! anti-hallucination guards.

/// What kind of work a user message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Social/small-talk turn.  Exposes zero tools.
    Chat,
    /// Web-page driving.
    Browser,
    /// Code and file work.
    Code,
    /// Everything else (research, mixed, unclear).
    General,
}

const SOCIAL_PATTERNS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "yo",
    "thanks",
    "thank you",
    "how are you",
    "good morning",
    "good evening",
    "good night",
    "what's up",
    "whats up",
    "who are you",
    "nice",
    "cool",
    "ok",
    "okay",
    "bye",
    "goodbye",
];

const ACTION_WORDS: &[&str] = &[
    "create", "write", "make", "run", "open", "search", "find", "read", "delete", "fix",
    "show", "list", "go to", "visit", "download", "save", "update", "check", "build",
    "install", "edit", "add", "remove", "rename", "move", "copy", "implement", "refactor",
    "debug", "test", "look up", "summarize", "fetch",
];

const BROWSER_KEYWORDS: &[&str] = &[
    "browse", "browser", "website", "webpage", "web page", "url", "http://", "https://",
    "click", "login", "log in", "navigate", ".com", ".org", ".io", "youtube", "wikipedia",
];

const CODE_KEYWORDS: &[&str] = &[
    "code", "file", "function", "bug", "compile", "implement", "refactor", "test", "error",
    "class", "struct", "script", "build", "directory", "folder", "repo", "repository",
    "commit", "branch", "cargo", "npm", "python", "rust", ".rs", ".py", ".js", ".ts",
    ".json", ".toml", ".md", "variable", "module", "crate", "api",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify one user message.
///
/// A message is `Chat` only when it is short (< 15 chars) or matches a
/// social pattern, AND carries no action words AND no browser/code keywords.
/// Everything with browser keywords routes `Browser`, code keywords `Code`,
/// otherwise `General`.
pub fn classify(message: &str) -> TaskKind {
    let lower = message.trim().to_lowercase();

    let has_action = contains_any(&lower, ACTION_WORDS);
    let has_browser = contains_any(&lower, BROWSER_KEYWORDS);
    let has_code = contains_any(&lower, CODE_KEYWORDS);

    let social = lower.len() < 15
        || SOCIAL_PATTERNS
            .iter()
            .any(|p| lower == *p || lower.starts_with(&format!("{p} ")) || lower.starts_with(&format!("{p}!")) || lower.starts_with(&format!("{p},")));

    if social && !has_action && !has_browser && !has_code {
        return TaskKind::Chat;
    }
    if has_browser {
        return TaskKind::Browser;
    }
    if has_code {
        return TaskKind::Code;
    }
    TaskKind::General
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_chat() {
        assert_eq!(classify("Hi"), TaskKind::Chat);
        assert_eq!(classify("hello!"), TaskKind::Chat);
        assert_eq!(classify("thanks"), TaskKind::Chat);
        assert_eq!(classify("how are you doing today my friend"), TaskKind::Chat);
    }

    #[test]
    fn short_message_with_action_word_is_not_chat() {
        assert_ne!(classify("run tests"), TaskKind::Chat);
        assert_ne!(classify("fix bug"), TaskKind::Chat);
    }

    #[test]
    fn file_work_is_code() {
        assert_eq!(
            classify("Create a file hello.txt with 'Hello, world!'"),
            TaskKind::Code
        );
        assert_eq!(classify("refactor the parser module please"), TaskKind::Code);
    }

    #[test]
    fn url_work_is_browser() {
        assert_eq!(
            classify("open https://example.com and click the login button"),
            TaskKind::Browser
        );
        assert_eq!(classify("go to wikipedia and look up rust"), TaskKind::Browser);
    }

    #[test]
    fn research_is_general() {
        assert_eq!(
            classify("what are the top 3 pizza places in dallas, save them for me"),
            TaskKind::General
        );
    }

    #[test]
    fn greeting_with_url_is_browser() {
        assert_eq!(classify("hi, open https://example.com"), TaskKind::Browser);
    }
}
