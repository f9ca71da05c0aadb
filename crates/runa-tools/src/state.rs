// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ground-truth record of tool-induced side effects.
//!
//! Updated only by tool executions; consulted by the response evaluator and
//! the anti-hallucination guards to detect fabricated claims ("I visited X",
//! "I wrote file Y") that have no corresponding entry here.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    browser_visits: Vec<String>,
    files_written: Vec<PathBuf>,
    commands_run: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ExecutionState {
    inner: Mutex<Inner>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_visit(&self, url: impl Into<String>) {
        self.inner.lock().unwrap().browser_visits.push(url.into());
    }

    pub fn record_write(&self, path: impl Into<PathBuf>) {
        self.inner.lock().unwrap().files_written.push(path.into());
    }

    pub fn record_command(&self, cmd: impl Into<String>) {
        self.inner.lock().unwrap().commands_run.push(cmd.into());
    }

    pub fn visited(&self, url_fragment: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .browser_visits
            .iter()
            .any(|u| u.contains(url_fragment))
    }

    pub fn wrote(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .unwrap()
            .files_written
            .iter()
            .any(|p| p == path)
    }

    pub fn wrote_fragment(&self, fragment: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .files_written
            .iter()
            .any(|p| p.to_string_lossy().contains(fragment))
    }

    pub fn ran(&self, cmd_fragment: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .commands_run
            .iter()
            .any(|c| c.contains(cmd_fragment))
    }

    /// Any data-gathering side effect at all this session.
    pub fn has_gathered_data(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.browser_visits.is_empty() || !inner.commands_run.is_empty()
    }

    pub fn files_written(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().files_written.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
