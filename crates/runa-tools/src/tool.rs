// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::policy::ApprovalPolicy;

/// Where a tool call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOrigin {
    /// Emitted through the backend's structured tool-call channel.
    Native,
    /// Extracted from free-form model text by the parser.
    TextParsed,
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Fresh per call; used for deduplication and result correlation.
    pub id: Uuid,
    pub name: String,
    /// Parsed JSON argument object.
    pub params: Value,
    pub origin: CallOrigin,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, params: Value, origin: CallOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            params,
            origin,
        }
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    pub fn u64_param(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }
}

/// Tool failure taxonomy.  Never fatal — every variant is returned to the
/// model as a tool result so it can retry or pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorKind {
    NotFound,
    PermissionDenied,
    Timeout,
    InvalidParams,
    DangerousRejected,
    ExternalError,
}

impl ToolErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::PermissionDenied => "permission_denied",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::InvalidParams => "invalid_params",
            ToolErrorKind::DangerousRejected => "dangerous_rejected",
            ToolErrorKind::ExternalError => "external_error",
        }
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: Uuid,
    pub success: bool,
    /// Plain-text output.  The registry caps this at the configured result
    /// limit before it can reach chat history.
    pub output: String,
    pub error: Option<ToolErrorKind>,
    /// Files produced as side effects (screenshots, scratchpad spills).
    /// Returned by path reference, never inlined.
    pub artifacts: Vec<PathBuf>,
}

impl ToolOutput {
    pub fn ok(call_id: Uuid, output: impl Into<String>) -> Self {
        Self {
            call_id,
            success: true,
            output: output.into(),
            error: None,
            artifacts: Vec::new(),
        }
    }

    pub fn err(call_id: Uuid, kind: ToolErrorKind, msg: impl Into<String>) -> Self {
        Self {
            call_id,
            success: false,
            output: msg.into(),
            error: Some(kind),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, path: PathBuf) -> Self {
        self.artifacts.push(path);
        self
    }

    /// Fixed JSON-in-text envelope returned to the model:
    /// `{"tool":"name","success":bool,"output":"…","error":"…"?}`.
    pub fn envelope(&self, tool_name: &str) -> String {
        let mut v = serde_json::json!({
            "tool": tool_name,
            "success": self.success,
            "output": self.output,
        });
        if let Some(kind) = self.error {
            v["error"] = serde_json::json!(kind.as_str());
        }
        v.to_string()
    }
}

/// Tool family, used for task-filtered exposure and progressive disclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolFamily {
    File,
    Terminal,
    Git,
    Web,
    Browser,
    Memory,
    Todo,
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a result exceeds the configured cap, the compactor uses this category
/// to pick the right extraction strategy.  Each tool declares its own
/// category; the core never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the head and the tail so both the
    /// command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches.
    MatchList,
    /// File content: balanced head + tail with a separator.
    FileContent,
    /// Generic text: hard-truncate at the nearest line boundary.
    #[default]
    Generic,
}

/// Trait that every built-in tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    fn family(&self) -> ToolFamily;
    /// Default approval level for this tool
    fn default_policy(&self) -> ApprovalPolicy;
    /// Describes the shape of this tool's output for context-aware truncation.
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool.  Errors are wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
