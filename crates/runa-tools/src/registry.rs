// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use runa_config::{OversizePolicy, ToolsConfig};

use crate::policy::ApprovalPolicy;
use crate::scratchpad::spill_to_scratchpad;
use crate::sanitize::SharedRoot;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

/// A tool schema as exposed to the prompt builder.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub family: ToolFamily,
}

/// Permission hook consulted for `Ask`-policy tools.  Hosts wire this to a
/// user-approval prompt; headless runs leave it unset (approve).
pub type ApprovalHook = Arc<dyn Fn(&ToolCall) -> bool + Send + Sync>;

/// Consecutive identical-params failures before a tool is skipped.
const BREAKER_THRESHOLD: u32 = 5;

/// Central registry holding all available tools.
///
/// Owns the cross-cutting execution concerns so individual tools stay small:
/// approval policy, per-call deadline, the result cap with its oversize
/// policy, and the circuit breaker.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    config: ToolsConfig,
    project_root: SharedRoot,
    approval_hook: Mutex<Option<ApprovalHook>>,
    /// `(tool, params_digest)` → consecutive failure count.  Cleared at the
    /// start of every user turn.
    breaker: Mutex<HashMap<(String, String), u32>>,
}

impl ToolRegistry {
    pub fn new(config: ToolsConfig, project_root: SharedRoot) -> Self {
        Self {
            tools: HashMap::new(),
            config,
            project_root,
            approval_hook: Mutex::new(None),
            breaker: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn set_approval_hook(&self, hook: ApprovalHook) {
        *self.approval_hook.lock().unwrap() = Some(hook);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Produce schemas for ALL registered tools.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                family: t.family(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas restricted to an explicit name list (progressive disclosure).
    /// Unknown names are skipped; the order of `names` is preserved so the
    /// prompt builder controls presentation order.
    pub fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                family: t.family(),
            })
            .collect()
    }

    pub fn output_category(&self, name: &str) -> OutputCategory {
        self.tools
            .get(name)
            .map(|t| t.output_category())
            .unwrap_or_default()
    }

    pub fn family_of(&self, name: &str) -> Option<ToolFamily> {
        self.tools.get(name).map(|t| t.family())
    }

    /// Reset the circuit breaker.  Called when a new user turn begins.
    pub fn reset_turn(&self) {
        self.breaker.lock().unwrap().clear();
    }

    /// Execute one call with policy, deadline, breaker and result cap applied.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                format!("unknown tool: {}", call.name),
            );
        };

        let breaker_key = (call.name.clone(), params_digest(call));
        {
            let breaker = self.breaker.lock().unwrap();
            if breaker.get(&breaker_key).copied().unwrap_or(0) >= BREAKER_THRESHOLD {
                warn!(tool = %call.name, "circuit breaker open; skipping call");
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::ExternalError,
                    format!(
                        "{} failed {BREAKER_THRESHOLD} times in a row with these exact \
                         parameters and is paused until the next user message. \
                         Change the parameters or try a different approach.",
                        call.name
                    ),
                );
            }
        }

        match tool.default_policy() {
            ApprovalPolicy::Deny => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::DangerousRejected,
                    format!("{} is disabled by policy", call.name),
                );
            }
            ApprovalPolicy::Ask => {
                let approved = {
                    let hook = self.approval_hook.lock().unwrap();
                    hook.as_ref().map(|h| h(call)).unwrap_or(true)
                };
                if !approved {
                    return ToolOutput::err(
                        call.id,
                        ToolErrorKind::PermissionDenied,
                        format!("{} was not approved", call.name),
                    );
                }
            }
            ApprovalPolicy::Auto => {}
        }

        debug!(tool = %call.name, "executing tool");
        let deadline = Duration::from_secs(tool_timeout_secs(&self.config, &call.name));
        let output = match tokio::time::timeout(deadline, tool.execute(call)).await {
            Ok(o) => o,
            Err(_) => ToolOutput::err(
                call.id,
                ToolErrorKind::Timeout,
                format!("{} timed out after {deadline:?}", call.name),
            ),
        };

        {
            let mut breaker = self.breaker.lock().unwrap();
            if output.success {
                breaker.remove(&breaker_key);
            } else {
                *breaker.entry(breaker_key).or_insert(0) += 1;
            }
        }

        self.apply_result_cap(&call.name, output)
    }

    /// Enforce the invariant that no result larger than the cap reaches chat
    /// history unmodified: either truncate with an explicit marker or spill
    /// to the scratchpad and return the path reference.
    fn apply_result_cap(&self, tool_name: &str, mut output: ToolOutput) -> ToolOutput {
        let cap = self.config.result_cap_bytes;
        if cap == 0 || output.output.len() <= cap {
            return output;
        }
        match self.config.oversize {
            OversizePolicy::Truncate => {
                let omitted = output.output.len() - cap;
                let mut cut = cap;
                while !output.output.is_char_boundary(cut) {
                    cut -= 1;
                }
                output.output.truncate(cut);
                output
                    .output
                    .push_str(&format!("\n[... {omitted} bytes omitted: output truncated ...]"));
                output
            }
            OversizePolicy::Scratchpad => {
                let root = self.project_root.read().unwrap().clone();
                match spill_to_scratchpad(&root, tool_name, &output.output) {
                    Ok(path) => {
                        let size = output.output.len();
                        output.output = format!(
                            "[output of {size} bytes exceeds the {cap} byte cap; \
                             full output written to: {}]",
                            path.display()
                        );
                        output.artifacts.push(path);
                        output
                    }
                    Err(e) => {
                        warn!("scratchpad spill failed ({e}); truncating instead");
                        let mut cut = cap;
                        while !output.output.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        output.output.truncate(cut);
                        output.output.push_str("\n[... output truncated ...]");
                        output
                    }
                }
            }
        }
    }
}

fn tool_timeout_secs(config: &ToolsConfig, tool_name: &str) -> u64 {
    if tool_name == "run_command" {
        config.run_command_timeout_secs.max(config.default_timeout_secs)
    } else {
        config.default_timeout_secs
    }
}

/// Stable digest of a call's parameters, for breaker keys and stuck
/// detection.  serde_json renders object keys sorted, so the digest is
/// insertion-order independent.
pub fn params_digest(call: &ToolCall) -> String {
    let mut hasher = Sha256::new();
    hasher.update(call.name.as_bytes());
    hasher.update(call.params.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::RwLock;

    use crate::tool::CallOrigin;

    fn shared_root(path: PathBuf) -> SharedRoot {
        Arc::new(RwLock::new(path))
    }

    /// Tool that always fails, counting invocations.
    struct FailingTool {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn family(&self) -> ToolFamily {
            ToolFamily::File
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutput::err(call.id, ToolErrorKind::ExternalError, "nope")
        }
    }

    struct BigOutputTool;

    #[async_trait]
    impl Tool for BigOutputTool {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "emits a lot"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn family(&self) -> ToolFamily {
            ToolFamily::Terminal
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(call.id, "x".repeat(200 * 1024))
        }
    }

    struct AskTool;

    #[async_trait]
    impl Tool for AskTool {
        fn name(&self) -> &str {
            "ask_tool"
        }
        fn description(&self) -> &str {
            "requires approval"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn family(&self) -> ToolFamily {
            ToolFamily::File
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Ask
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(call.id, "ran")
        }
    }

    fn call(name: &str, params: Value) -> ToolCall {
        ToolCall::new(name, params, CallOrigin::Native)
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ToolRegistry::new(ToolsConfig::default(), shared_root(dir.path().into()));
        let out = reg.execute(&call("missing", json!({}))).await;
        assert!(!out.success);
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }

    #[tokio::test]
    async fn breaker_opens_after_five_identical_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg =
            ToolRegistry::new(ToolsConfig::default(), shared_root(dir.path().into()));
        let calls = Arc::new(AtomicU32::new(0));
        reg.register(FailingTool {
            calls: Arc::clone(&calls),
        });

        for _ in 0..7 {
            let _ = reg.execute(&call("failing", json!({"p": 1}))).await;
        }
        // Only the first five reach the tool; the breaker eats the rest.
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn breaker_is_per_params() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg =
            ToolRegistry::new(ToolsConfig::default(), shared_root(dir.path().into()));
        let calls = Arc::new(AtomicU32::new(0));
        reg.register(FailingTool {
            calls: Arc::clone(&calls),
        });

        for _ in 0..5 {
            let _ = reg.execute(&call("failing", json!({"p": 1}))).await;
        }
        // Different params — the breaker key differs, so the tool runs again.
        let _ = reg.execute(&call("failing", json!({"p": 2}))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn reset_turn_closes_the_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg =
            ToolRegistry::new(ToolsConfig::default(), shared_root(dir.path().into()));
        let calls = Arc::new(AtomicU32::new(0));
        reg.register(FailingTool {
            calls: Arc::clone(&calls),
        });

        for _ in 0..6 {
            let _ = reg.execute(&call("failing", json!({"p": 1}))).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        reg.reset_turn();
        let _ = reg.execute(&call("failing", json!({"p": 1}))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg =
            ToolRegistry::new(ToolsConfig::default(), shared_root(dir.path().into()));
        reg.register(BigOutputTool);
        let out = reg.execute(&call("big", json!({}))).await;
        assert!(out.success);
        assert!(out.output.len() < 60 * 1024);
        assert!(out.output.contains("omitted"));
    }

    #[tokio::test]
    async fn oversized_output_spills_to_scratchpad_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ToolsConfig {
            oversize: OversizePolicy::Scratchpad,
            ..ToolsConfig::default()
        };
        let mut reg = ToolRegistry::new(cfg, shared_root(dir.path().into()));
        reg.register(BigOutputTool);
        let out = reg.execute(&call("big", json!({}))).await;
        assert!(out.success);
        assert_eq!(out.artifacts.len(), 1);
        assert!(out.artifacts[0].starts_with(dir.path()));
        assert!(out.output.contains(".scratch"));
        // The spilled file holds the full output.
        let spilled = std::fs::read_to_string(&out.artifacts[0]).unwrap();
        assert_eq!(spilled.len(), 200 * 1024);
    }

    #[tokio::test]
    async fn ask_policy_consults_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg =
            ToolRegistry::new(ToolsConfig::default(), shared_root(dir.path().into()));
        reg.register(AskTool);

        // Default (no hook): approved.
        let out = reg.execute(&call("ask_tool", json!({}))).await;
        assert!(out.success);

        // Hook denies.
        reg.set_approval_hook(Arc::new(|_| false));
        let out = reg.execute(&call("ask_tool", json!({}))).await;
        assert!(!out.success);
        assert_eq!(out.error, Some(ToolErrorKind::PermissionDenied));
    }

    #[test]
    fn params_digest_is_stable_across_key_order() {
        let a = call("t", json!({"a": 1, "b": 2}));
        let b = ToolCall {
            id: a.id,
            name: "t".into(),
            params: json!({"b": 2, "a": 1}),
            origin: CallOrigin::Native,
        };
        assert_eq!(params_digest(&a), params_digest(&b));
    }
}
