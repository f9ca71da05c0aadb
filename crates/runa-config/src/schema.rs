// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agent: LoopConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Where to place model layers when loading a GGUF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuPreference {
    /// Probe the maximum layer count and fall back on OOM.
    #[default]
    Auto,
    /// Never offload; tensor compute stays on the CPU.
    Cpu,
    /// Offload exactly this many layers (no probe).
    Layers(u32),
}

// ── Engine ───────────────────────────────────────────────────────────────────

fn default_server_binary() -> String {
    "llama-server".to_string()
}
fn default_server_port() -> u16 {
    8734
}
fn default_load_timeout_secs() -> u64 {
    180
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_grammar_first_token_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// GPU layer placement for model loads.
    #[serde(default)]
    pub gpu: GpuPreference,
    /// llama.cpp server binary used to serve GGUF files.  Resolved via PATH
    /// when not absolute.
    #[serde(default = "default_server_binary")]
    pub server_binary: String,
    /// Local port the inference server listens on.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Context size override.  `None` uses the model profile's effective
    /// context ceiling.
    #[serde(default)]
    pub ctx_size: Option<u32>,
    /// Whether grammar-constrained tool-call generation is attempted at all.
    /// Grammar can still be disabled at runtime for the session lifetime when
    /// a constrained generation stalls.
    #[serde(default = "default_true")]
    pub grammar: bool,
    /// Hard deadline for a model load, including server spawn and probe.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    /// Hard deadline for one free-text generation.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// First-token deadline for grammar-constrained generation.  Short on
    /// purpose: rejection-sampling hangs have been observed in the wild, and
    /// a stalled grammar generation blocks the whole session.
    #[serde(default = "default_grammar_first_token_timeout_secs")]
    pub grammar_first_token_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gpu: GpuPreference::Auto,
            server_binary: default_server_binary(),
            server_port: default_server_port(),
            ctx_size: None,
            grammar: true,
            load_timeout_secs: default_load_timeout_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            grammar_first_token_timeout_secs: default_grammar_first_token_timeout_secs(),
        }
    }
}

// ── Agent loop ───────────────────────────────────────────────────────────────

fn default_max_iterations() -> u32 {
    30
}
fn default_wall_clock_secs() -> u64 {
    600
}
fn default_rollback_retry_budget() -> u8 {
    3
}
fn default_browser_actions_per_iteration() -> u32 {
    2
}
fn default_todo_mutations_per_iteration() -> u32 {
    6
}
fn default_compact_threshold() -> f32 {
    0.55
}
fn default_rotate_threshold() -> f32 {
    0.80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum generation+tool iterations per user message.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock deadline for one user message, checked at the top of every
    /// iteration.
    #[serde(default = "default_wall_clock_secs")]
    pub wall_clock_secs: u64,
    /// How many times a ROLLBACK verdict may retry the same iteration before
    /// the response is committed anyway.
    #[serde(default = "default_rollback_retry_budget")]
    pub rollback_retry_budget: u8,
    /// Browser actions executed per iteration.  Kept low so navigate →
    /// snapshot → click sequences across iterations instead of cascading
    /// stale element references inside one.
    #[serde(default = "default_browser_actions_per_iteration")]
    pub browser_actions_per_iteration: u32,
    /// `update_todo` mutations accepted per iteration.
    #[serde(default = "default_todo_mutations_per_iteration")]
    pub todo_mutations_per_iteration: u32,
    /// Context fraction at which progressive compaction starts pruning the
    /// oldest tool results and assistant messages.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: f32,
    /// Context fraction at which the session is hard-rotated through the
    /// summarizer ledger.
    #[serde(default = "default_rotate_threshold")]
    pub rotate_threshold: f32,
    /// Optional system-prompt override injected verbatim by the host.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            wall_clock_secs: default_wall_clock_secs(),
            rollback_retry_budget: default_rollback_retry_budget(),
            browser_actions_per_iteration: default_browser_actions_per_iteration(),
            todo_mutations_per_iteration: default_todo_mutations_per_iteration(),
            compact_threshold: default_compact_threshold(),
            rotate_threshold: default_rotate_threshold(),
            system_prompt: None,
        }
    }
}

// ── Tools ────────────────────────────────────────────────────────────────────

/// What to do with a tool result that exceeds the result cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Truncate in place with an explicit omission marker.
    #[default]
    Truncate,
    /// Write the full output to a `.scratch/` file inside the project root
    /// and return the path instead.
    Scratchpad,
}

fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_run_command_timeout_secs() -> u64 {
    30
}
fn default_result_cap_bytes() -> usize {
    50 * 1024
}
fn default_auto_approve_patterns() -> Vec<String> {
    ["ls*", "cat *", "git status*", "git log*", "git diff*", "grep *", "rg *"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_deny_patterns() -> Vec<String> {
    ["rm -rf /*", "*mkfs*", "*> /dev/sd*"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Command glob patterns that run without approval.
    #[serde(default = "default_auto_approve_patterns")]
    pub auto_approve_patterns: Vec<String>,
    /// Command glob patterns that are always refused.  Deny wins over auto.
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
    /// Per-tool execution deadline unless the tool overrides it.
    #[serde(default = "default_tool_timeout_secs")]
    pub default_timeout_secs: u64,
    /// `run_command` deadline; callers may raise it per invocation.
    #[serde(default = "default_run_command_timeout_secs")]
    pub run_command_timeout_secs: u64,
    /// Largest tool output that may enter chat history unmodified.
    #[serde(default = "default_result_cap_bytes")]
    pub result_cap_bytes: usize,
    /// How oversized outputs are handled.
    #[serde(default)]
    pub oversize: OversizePolicy,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: default_auto_approve_patterns(),
            deny_patterns: default_deny_patterns(),
            default_timeout_secs: default_tool_timeout_secs(),
            run_command_timeout_secs: default_run_command_timeout_secs(),
            result_cap_bytes: default_result_cap_bytes(),
            oversize: OversizePolicy::Truncate,
        }
    }
}

// ── Web ──────────────────────────────────────────────────────────────────────

fn default_fetch_cap_bytes() -> usize {
    200 * 1024
}
fn default_search_results() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Body cap for `fetch_webpage`.
    #[serde(default = "default_fetch_cap_bytes")]
    pub fetch_cap_bytes: usize,
    /// Result count returned by `web_search`.
    #[serde(default = "default_search_results")]
    pub search_results: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            fetch_cap_bytes: default_fetch_cap_bytes(),
            search_results: default_search_results(),
        }
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

fn default_value_cap_bytes() -> usize {
    10 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Per-value cap for the append-only key/value store.
    #[serde(default = "default_value_cap_bytes")]
    pub value_cap_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            value_cap_bytes: default_value_cap_bytes(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_iterations_is_thirty() {
        let c = Config::default();
        assert_eq!(c.agent.max_iterations, 30);
    }

    #[test]
    fn default_thresholds_are_ordered() {
        let c = Config::default();
        assert!(c.agent.compact_threshold < c.agent.rotate_threshold);
        assert!(c.agent.rotate_threshold < 1.0);
    }

    #[test]
    fn default_result_cap_is_fifty_kib() {
        let c = Config::default();
        assert_eq!(c.tools.result_cap_bytes, 50 * 1024);
    }

    #[test]
    fn default_browser_cap_is_two() {
        let c = Config::default();
        assert_eq!(c.agent.browser_actions_per_iteration, 2);
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.agent.max_iterations, 30);
        assert_eq!(c.engine.server_binary, "llama-server");
        assert!(c.engine.grammar);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let c: Config =
            serde_json::from_str(r#"{"agent": {"max_iterations": 5}}"#).unwrap();
        assert_eq!(c.agent.max_iterations, 5);
        // Untouched sections keep defaults.
        assert_eq!(c.agent.rollback_retry_budget, 3);
        assert_eq!(c.tools.default_timeout_secs, 30);
    }

    #[test]
    fn gpu_preference_layers_round_trips() {
        let g = GpuPreference::Layers(33);
        let json = serde_json::to_string(&g).unwrap();
        let back: GpuPreference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn oversize_policy_defaults_to_truncate() {
        assert_eq!(OversizePolicy::default(), OversizePolicy::Truncate);
    }

    #[test]
    fn grammar_timeout_is_much_shorter_than_generation_timeout() {
        let c = EngineConfig::default();
        assert!(c.grammar_first_token_timeout_secs * 10 <= c.generation_timeout_secs);
    }
}
