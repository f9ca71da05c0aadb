// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
}

/// A structured todo item managed by the update_todo tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    pub status: TodoStatus,
}

/// Events emitted by tools to communicate state changes back to the agent loop.
/// The loop translates these into session events for the UI.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    TodoUpdate(Vec<TodoItem>),
}
