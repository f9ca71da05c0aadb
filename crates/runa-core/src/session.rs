// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session handle — the runtime's caller API.
//!
//! One session owns one engine (model + context + sequence), one tool
//! registry and one conversation.  Concurrent `send_message` calls on the
//! same session are rejected with [`SessionError::Busy`]; the host creates
//! separate sessions for separate panes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use runa_config::{Config, GpuPreference};
use runa_engine::{CancelToken, Engine, InferenceBackend, LoadReport};
use runa_tools::{
    BackupStore, BrowserClickTool, BrowserNavigateTool, BrowserSession, BrowserSnapshotTool,
    BrowserTypeTool, DeleteFileTool, EditFileTool, ExecutionState, FetchWebpageTool,
    FindFileTool, GitCommitTool, GitDiffTool, GitLogTool, GitStatusTool, ListDirectoryTool,
    MemoryStore, ReadFileTool, ReadMemoryTool, RunCommandTool, SharedRoot, TodoItem,
    ToolRegistry, UndoEditTool, UpdateMemoryTool, UpdateTodoTool, WebSearchTool, WriteFileTool,
};

use crate::agent::Agent;
use crate::error::SessionError;
use crate::events::Event;
use crate::prompts::load_project_prompt;

/// Host-facing construction parameters.
pub struct SessionConfig {
    pub config: Config,
    pub project_root: PathBuf,
}

pub struct Session {
    engine: Arc<Engine>,
    agent: Arc<Mutex<Agent>>,
    root: SharedRoot,
    cancel: CancelToken,
    project_prompt: Arc<RwLock<Option<String>>>,
    memory: Arc<MemoryStore>,
    memory_note: Arc<RwLock<Option<String>>>,
    browser: BrowserSession,
}

impl Session {
    /// Build a session over `backend` with the full tool set registered.
    pub fn new(session_config: SessionConfig, backend: Arc<dyn InferenceBackend>) -> Self {
        let SessionConfig {
            config,
            project_root,
        } = session_config;
        let config = Arc::new(config);
        let engine = Arc::new(Engine::new(backend, config.engine.clone()));

        let root: SharedRoot = Arc::new(RwLock::new(project_root.clone()));
        let exec = Arc::new(ExecutionState::new());
        let backups = Arc::new(BackupStore::new());
        let todos = Arc::new(StdMutex::new(Vec::<TodoItem>::new()));
        let memory = Arc::new(MemoryStore::new(
            project_root.join(".runa/memory.json"),
            config.memory.value_cap_bytes,
        ));
        let browser = BrowserSession::new();
        let (tool_event_tx, tool_event_rx) = mpsc::unbounded_channel();

        let mut registry = ToolRegistry::new(config.tools.clone(), Arc::clone(&root));
        registry.register(ReadFileTool {
            root: Arc::clone(&root),
        });
        registry.register(WriteFileTool {
            root: Arc::clone(&root),
            backups: Arc::clone(&backups),
            state: Arc::clone(&exec),
        });
        registry.register(EditFileTool {
            root: Arc::clone(&root),
            backups: Arc::clone(&backups),
            state: Arc::clone(&exec),
        });
        registry.register(DeleteFileTool {
            root: Arc::clone(&root),
            backups: Arc::clone(&backups),
        });
        registry.register(UndoEditTool {
            root: Arc::clone(&root),
            backups: Arc::clone(&backups),
        });
        registry.register(ListDirectoryTool {
            root: Arc::clone(&root),
        });
        registry.register(FindFileTool {
            root: Arc::clone(&root),
        });
        registry.register(RunCommandTool {
            root: Arc::clone(&root),
            state: Arc::clone(&exec),
            timeout_secs: config.tools.run_command_timeout_secs,
        });
        registry.register(GitStatusTool {
            root: Arc::clone(&root),
        });
        registry.register(GitLogTool {
            root: Arc::clone(&root),
        });
        registry.register(GitDiffTool {
            root: Arc::clone(&root),
        });
        registry.register(GitCommitTool {
            root: Arc::clone(&root),
        });
        registry.register(WebSearchTool {
            max_results: config.web.search_results,
        });
        registry.register(FetchWebpageTool {
            state: Arc::clone(&exec),
            body_cap_bytes: config.web.fetch_cap_bytes,
        });
        registry.register(BrowserNavigateTool {
            session: browser.clone(),
            state: Arc::clone(&exec),
        });
        registry.register(BrowserSnapshotTool {
            session: browser.clone(),
        });
        registry.register(BrowserClickTool {
            session: browser.clone(),
        });
        registry.register(BrowserTypeTool {
            session: browser.clone(),
        });
        registry.register(UpdateMemoryTool {
            store: Arc::clone(&memory),
        });
        registry.register(ReadMemoryTool {
            store: Arc::clone(&memory),
        });
        registry.register(UpdateTodoTool {
            todos: Arc::clone(&todos),
            events: tool_event_tx,
        });
        let tools = Arc::new(registry);

        let project_prompt = Arc::new(RwLock::new(load_project_prompt(&project_root)));
        let memory_note = Arc::new(RwLock::new(None));

        let agent = Agent::new(
            Arc::clone(&engine),
            tools,
            Arc::clone(&config),
            exec,
            todos,
            tool_event_rx,
            Arc::clone(&project_prompt),
            Arc::clone(&memory_note),
        );

        Self {
            engine,
            agent: Arc::new(Mutex::new(agent)),
            root,
            cancel: CancelToken::new(),
            project_prompt,
            memory,
            memory_note,
            browser,
        }
    }

    /// Load (or swap) the model.  On a family change, prior assistant tool
    /// JSON is stripped from history — the new model's wrapper renders tool
    /// calls differently.
    pub async fn load_model(
        &self,
        model_path: &Path,
        gpu: GpuPreference,
    ) -> Result<LoadReport, SessionError> {
        let previous_family = self.engine.profile().map(|p| p.family);
        let report = self.engine.load(model_path, gpu).await?;
        if let Some(old) = previous_family {
            if old != report.profile.family {
                debug!(?old, new = ?report.profile.family, "cross-model handoff");
                self.agent.lock().await.prepare_for_model_handoff();
            }
        }
        Ok(report)
    }

    /// Submit one user message.  Returns the event receiver; the final
    /// event is always `Finish` or `Error`.  Rejects with [`SessionError::Busy`]
    /// while a previous message is still processing.
    pub fn send_message(
        self: &Arc<Self>,
        text: impl Into<String>,
    ) -> Result<mpsc::Receiver<Event>, SessionError> {
        let guard = Arc::clone(&self.agent)
            .try_lock_owned()
            .map_err(|_| SessionError::Busy)?;

        // Fresh memory rendering for the prompt builder.
        let rendered = self.memory.render_all();
        *self.memory_note.write().unwrap() = if rendered == "(memory is empty)" {
            None
        } else {
            Some(rendered)
        };

        self.cancel.reset();
        let cancel = self.cancel.clone();
        let text = text.into();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut agent = guard;
            if let Err(e) = agent.submit(&text, tx.clone(), cancel).await {
                warn!("session error: {e}");
                let _ = tx
                    .send(Event::Error {
                        kind: error_kind(&e),
                        msg: e.to_string(),
                    })
                    .await;
            }
        });
        Ok(rx)
    }

    /// Cooperative cancel.  The stream stops at the next token boundary and
    /// the partial turn is committed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clear the conversation and the engine's sequence, reapplying the
    /// chat wrapper.
    pub async fn reset_session(&self) -> Result<(), SessionError> {
        let mut agent = self.agent.lock().await;
        agent.clear_history();
        self.engine.reset_session().await?;
        Ok(())
    }

    /// Point the session at a different project root.
    pub fn set_project_root(&self, path: PathBuf) {
        *self.project_prompt.write().unwrap() = load_project_prompt(&path);
        *self.root.write().unwrap() = path;
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Shut down owned externals (browser).  Called by the host on teardown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.browser.shutdown().await;
    }
}

fn error_kind(e: &SessionError) -> String {
    match e {
        SessionError::Busy => "busy",
        SessionError::NoModel => "no_model",
        SessionError::Engine(_) => "engine",
        SessionError::Io(_) => "io",
    }
    .to_string()
}
