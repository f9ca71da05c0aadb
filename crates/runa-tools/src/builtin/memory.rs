// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistent key/value memory.
//!
//! Append-only from the model's perspective: updating a key appends to the
//! existing value rather than replacing it, and keys are never deleted.
//! Values are truncated to the configured cap (oldest content dropped first,
//! so the most recent notes survive).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

pub struct MemoryStore {
    path: PathBuf,
    value_cap_bytes: usize,
    lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(path: PathBuf, value_cap_bytes: usize) -> Self {
        Self {
            path,
            value_cap_bytes,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> BTreeMap<String, String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save(&self, map: &BTreeMap<String, String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(map).expect("string map serializes");
        std::fs::write(&self.path, text)
    }

    /// Append `value` under `key`, truncating to the per-value cap.
    pub fn append(&self, key: &str, value: &str) -> std::io::Result<usize> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load();
        let slot = map.entry(key.to_string()).or_default();
        if !slot.is_empty() {
            slot.push('\n');
        }
        slot.push_str(value);
        if slot.len() > self.value_cap_bytes {
            // Keep the tail — the most recent notes matter most.
            let excess = slot.len() - self.value_cap_bytes;
            let mut cut = excess;
            while cut < slot.len() && !slot.is_char_boundary(cut) {
                cut += 1;
            }
            slot.drain(..cut);
        }
        let len = slot.len();
        self.save(&map)?;
        Ok(len)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap();
        self.load().get(key).cloned()
    }

    pub fn render_all(&self) -> String {
        let _guard = self.lock.lock().unwrap();
        let map = self.load();
        if map.is_empty() {
            return "(memory is empty)".to_string();
        }
        map.iter()
            .map(|(k, v)| format!("## {k}\n{v}"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// ── update_memory ────────────────────────────────────────────────────────────

pub struct UpdateMemoryTool {
    pub store: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for UpdateMemoryTool {
    fn name(&self) -> &str {
        "update_memory"
    }

    fn description(&self) -> &str {
        "Append a note to persistent memory under a key. Memory survives \
         across sessions. Notes are appended, never overwritten; large \
         values are truncated keeping the most recent content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "Topic key, e.g. 'project-conventions'"
                },
                "value": {
                    "type": "string",
                    "description": "Note to append"
                }
            },
            "required": ["key", "value"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Memory
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (Some(key), Some(value)) = (call.str_param("key"), call.str_param("value")) else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "update_memory requires 'key' and 'value'",
            );
        };
        debug!(key, bytes = value.len(), "update_memory tool");
        match self.store.append(key, value) {
            Ok(len) => ToolOutput::ok(
                call.id,
                format!("memory '{key}' updated ({len} bytes stored)"),
            ),
            Err(e) => ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("memory write failed: {e}"),
            ),
        }
    }
}

// ── read_memory ──────────────────────────────────────────────────────────────

pub struct ReadMemoryTool {
    pub store: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for ReadMemoryTool {
    fn name(&self) -> &str {
        "read_memory"
    }

    fn description(&self) -> &str {
        "Read persistent memory. Pass key for one entry; omit it for all."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "Topic key to read (optional)"
                }
            },
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Memory
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match call.str_param("key") {
            Some(key) => match self.store.get(key) {
                Some(value) => ToolOutput::ok(call.id, value),
                None => ToolOutput::err(
                    call.id,
                    ToolErrorKind::NotFound,
                    format!("no memory stored under '{key}'"),
                ),
            },
            None => ToolOutput::ok(call.id, self.store.render_all()),
        }
    }
}
