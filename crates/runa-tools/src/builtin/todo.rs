// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{TodoItem, TodoStatus, ToolEvent};
use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

/// Model-managed task list.
///
/// The tool replaces the whole list on each call; the loop enforces the
/// per-iteration mutation cap and forwards [`ToolEvent::TodoUpdate`] to the
/// host UI.
pub struct UpdateTodoTool {
    pub todos: Arc<Mutex<Vec<TodoItem>>>,
    pub events: mpsc::UnboundedSender<ToolEvent>,
}

#[async_trait]
impl Tool for UpdateTodoTool {
    fn name(&self) -> &str {
        "update_todo"
    }

    fn description(&self) -> &str {
        "Replace the working todo list. Use for multi-step tasks so the user \
         can follow progress. Each item: {id, text, status} with status one \
         of pending | in_progress | done | cancelled."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The complete new todo list",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "text": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "done", "cancelled"]
                            }
                        },
                        "required": ["text", "status"]
                    }
                }
            },
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Todo
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(items) = call.params.get("todos").and_then(|v| v.as_array()) else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'todos'",
            );
        };

        let mut parsed = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let Some(text) = item.get("text").and_then(|v| v.as_str()) else {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::InvalidParams,
                    format!("todo {i} is missing 'text'"),
                );
            };
            let status = match item.get("status").and_then(|v| v.as_str()) {
                Some("pending") | None => TodoStatus::Pending,
                Some("in_progress") => TodoStatus::InProgress,
                Some("done") => TodoStatus::Done,
                Some("cancelled") => TodoStatus::Cancelled,
                Some(other) => {
                    return ToolOutput::err(
                        call.id,
                        ToolErrorKind::InvalidParams,
                        format!("todo {i} has unknown status '{other}'"),
                    )
                }
            };
            let id = item
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("todo-{}", i + 1));
            parsed.push(TodoItem {
                id,
                text: text.to_string(),
                status,
            });
        }

        debug!(count = parsed.len(), "update_todo tool");
        *self.todos.lock().unwrap() = parsed.clone();
        let _ = self.events.send(ToolEvent::TodoUpdate(parsed.clone()));

        let done = parsed
            .iter()
            .filter(|t| t.status == TodoStatus::Done)
            .count();
        ToolOutput::ok(
            call.id,
            format!("todo list updated: {} items, {done} done", parsed.len()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::CallOrigin;
    use serde_json::json;

    fn setup() -> (UpdateTodoTool, mpsc::UnboundedReceiver<ToolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            UpdateTodoTool {
                todos: Arc::new(Mutex::new(Vec::new())),
                events: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn replaces_list_and_emits_event() {
        let (tool, mut rx) = setup();
        let out = tool
            .execute(&ToolCall::new(
                "update_todo",
                json!({"todos": [
                    {"id": "1", "text": "write tests", "status": "in_progress"},
                    {"text": "ship", "status": "pending"}
                ]}),
                CallOrigin::Native,
            ))
            .await;
        assert!(out.success, "{}", out.output);
        assert_eq!(tool.todos.lock().unwrap().len(), 2);

        let ToolEvent::TodoUpdate(items) = rx.try_recv().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, TodoStatus::InProgress);
        // Missing id gets a generated one.
        assert_eq!(items[1].id, "todo-2");
    }

    #[tokio::test]
    async fn unknown_status_is_invalid() {
        let (tool, _rx) = setup();
        let out = tool
            .execute(&ToolCall::new(
                "update_todo",
                json!({"todos": [{"text": "x", "status": "someday"}]}),
                CallOrigin::Native,
            ))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }

    #[tokio::test]
    async fn missing_todos_is_invalid() {
        let (tool, _rx) = setup();
        let out = tool
            .execute(&ToolCall::new("update_todo", json!({}), CallOrigin::Native))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }
}
