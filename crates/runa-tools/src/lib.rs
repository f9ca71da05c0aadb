// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod backups;
pub mod builtin;
pub mod events;
pub mod policy;
pub mod registry;
pub mod sanitize;
pub mod scratchpad;
pub mod state;
pub mod tool;

pub use backups::BackupStore;
pub use events::{TodoItem, TodoStatus, ToolEvent};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use sanitize::{sanitize_command, validate_path, SecurityError, SharedRoot};
pub use scratchpad::spill_to_scratchpad;
pub use state::ExecutionState;
pub use tool::{
    CallOrigin, OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput,
};

pub use builtin::browser::{BrowserSession, BrowserClickTool, BrowserNavigateTool, BrowserSnapshotTool, BrowserTypeTool};
pub use builtin::delete_file::DeleteFileTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::fetch_webpage::FetchWebpageTool;
pub use builtin::find_file::FindFileTool;
pub use builtin::git::{GitCommitTool, GitDiffTool, GitLogTool, GitStatusTool};
pub use builtin::list_dir::ListDirectoryTool;
pub use builtin::memory::{MemoryStore, ReadMemoryTool, UpdateMemoryTool};
pub use builtin::read_file::ReadFileTool;
pub use builtin::run_command::RunCommandTool;
pub use builtin::todo::UpdateTodoTool;
pub use builtin::undo_edit::UndoEditTool;
pub use builtin::web_search::WebSearchTool;
pub use builtin::write_file::WriteFileTool;
