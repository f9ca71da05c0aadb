// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use runa_tools::TodoItem;

/// Loop phase, surfaced so the host can show progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generating,
    ExecutingTools,
    Compacting,
    Summarizing,
}

/// Why a turn finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    Complete,
    Cancelled,
    IterationCap,
    Deadline,
    Stuck,
}

/// Events streamed to the caller during one user turn.
/// Consumers (the host IDE) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum Event {
    /// A user-facing text chunk streamed from the model
    Token(String),
    /// A reasoning-channel chunk (shown collapsed by default)
    ThinkingToken(String),
    /// A tool is about to run
    ToolExecuting {
        name: String,
        params: serde_json::Value,
    },
    /// A tool finished
    ToolResult {
        name: String,
        success: bool,
        /// First part of the output, for inline display
        preview: String,
    },
    /// Iteration counter update
    IterationProgress { n: u32, max: u32 },
    /// The loop moved to a new phase
    PhaseChange { phase: Phase, status: String },
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The turn is complete
    Finish {
        full_response: String,
        status: FinishStatus,
    },
    /// An unrecoverable error; the session has stopped processing this turn
    Error { kind: String, msg: String },
}
