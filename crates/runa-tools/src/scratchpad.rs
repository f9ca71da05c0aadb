// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scratchpad spill for oversized tool output.
//!
//! When a tool result exceeds the configured cap and the oversize policy is
//! `Scratchpad`, the full output is written to a file under `.scratch/` in
//! the project root and the chat history only carries the path reference.

use std::path::{Path, PathBuf};

use uuid::Uuid;

const SCRATCH_DIR: &str = ".scratch";

/// Write `content` to a fresh scratchpad file and return its path.
/// The path is always inside the project root.
pub fn spill_to_scratchpad(
    project_root: &Path,
    tool_name: &str,
    content: &str,
) -> std::io::Result<PathBuf> {
    let dir = project_root.join(SCRATCH_DIR);
    std::fs::create_dir_all(&dir)?;
    let file = dir.join(format!("{tool_name}-{}.txt", Uuid::new_v4()));
    std::fs::write(&file, content)?;
    Ok(file)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
