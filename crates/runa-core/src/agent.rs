// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use runa_config::Config;
use runa_engine::{CancelToken, Engine, EngineToken};
use runa_parser::{is_fabricated_chat_response, parse_tool_calls};
use runa_tools::{
    registry::params_digest, ExecutionState, TodoItem, ToolCall, ToolErrorKind, ToolEvent,
    ToolFamily, ToolOutput, ToolRegistry,
};

use crate::classify::{classify, TaskKind};
use crate::context::{ContextAction, ContextManager};
use crate::disclosure::Disclosure;
use crate::error::SessionError;
use crate::evaluator::{evaluate, EvalInput, Verdict};
use crate::events::{Event, FinishStatus, Phase};
use crate::history::ChatHistory;
use crate::prompts::{build_system_text, render_prompt, tool_call_grammar, PromptInputs};
use crate::stuck::StuckDetector;
use crate::summarize::ConversationLedger;
use crate::transaction::Checkpoint;

/// Temperature reduction applied per ROLLBACK retry.
const ROLLBACK_TEMP_STEP: f32 = 0.2;
/// Empty/thinking-only responses retried silently before giving up.
const MAX_SKIP_RETRIES: u8 = 2;
/// write_file content above this with no prior data gathering is treated as
/// fabricated.
const FABRICATED_WRITE_BYTES: usize = 4 * 1024;
/// Share of the context window the system text may occupy.
const SYSTEM_BUDGET_FRACTION: f32 = 0.5;

/// The agentic loop: one user message in, a bounded sequence of generations
/// and tool executions out, streamed as [`Event`]s.
pub struct Agent {
    engine: Arc<Engine>,
    tools: Arc<ToolRegistry>,
    config: Arc<Config>,
    exec: Arc<ExecutionState>,
    history: ChatHistory,
    context: ContextManager,
    todos: Arc<Mutex<Vec<TodoItem>>>,
    tool_events: mpsc::UnboundedReceiver<ToolEvent>,
    project_prompt: Arc<RwLock<Option<String>>>,
    memory_note: Arc<RwLock<Option<String>>>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<Engine>,
        tools: Arc<ToolRegistry>,
        config: Arc<Config>,
        exec: Arc<ExecutionState>,
        todos: Arc<Mutex<Vec<TodoItem>>>,
        tool_events: mpsc::UnboundedReceiver<ToolEvent>,
        project_prompt: Arc<RwLock<Option<String>>>,
        memory_note: Arc<RwLock<Option<String>>>,
    ) -> Self {
        let context = ContextManager::new(
            config.agent.compact_threshold,
            config.agent.rotate_threshold,
        );
        Self {
            engine,
            tools,
            config,
            exec,
            history: ChatHistory::new(String::new()),
            context,
            todos,
            tool_events,
            project_prompt,
            memory_note,
        }
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Clear the conversation (explicit user action).
    pub fn clear_history(&mut self) {
        self.history = ChatHistory::new(String::new());
    }

    /// Drop tool-call JSON from prior assistant turns.  Called on
    /// cross-model handoff only — same-model turns keep their JSON so the
    /// prefix cache stays warm.
    pub fn prepare_for_model_handoff(&mut self) {
        self.history.strip_tool_json_for_handoff();
    }

    /// Process one user message.  Streams [`Event`]s through `tx`; the
    /// final event is always `Finish` or `Error`.
    pub async fn submit(
        &mut self,
        user_msg: &str,
        tx: mpsc::Sender<Event>,
        cancel: CancelToken,
    ) -> Result<(), SessionError> {
        let profile = self.engine.profile().ok_or(SessionError::NoModel)?;
        let task = classify(user_msg);
        debug!(?task, "classified user message");

        // The circuit breaker spans one user turn.
        self.tools.reset_turn();

        let registry_names = self.tools.names();
        let mut disclosure = Disclosure::new();
        let mut stuck = StuckDetector::new();
        let mut stuck_nudges = 0u32;
        let mut no_tool_nudge_sent = false;
        // Most recent tool failure, surfaced as a prompt header so the model
        // addresses it instead of re-discovering it from the transcript.
        let mut error_context: Option<String> = None;
        let mut iteration = 0u32;
        let max_iterations = self.config.agent.max_iterations;
        let deadline = Instant::now() + Duration::from_secs(self.config.agent.wall_clock_secs);

        self.history.push_user(user_msg);

        loop {
            iteration += 1;

            // ── Termination checks, at the top of every iteration ────────
            if cancel.is_cancelled() {
                let _ = tx
                    .send(Event::Finish {
                        full_response: String::new(),
                        status: FinishStatus::Cancelled,
                    })
                    .await;
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("wall-clock deadline reached");
                self.finish_with_wrapup(&tx, task, FinishStatus::Deadline, &cancel)
                    .await;
                return Ok(());
            }
            if iteration > max_iterations {
                self.finish_with_wrapup(&tx, task, FinishStatus::IterationCap, &cancel)
                    .await;
                return Ok(());
            }
            let _ = tx
                .send(Event::IterationProgress {
                    n: iteration,
                    max: max_iterations,
                })
                .await;

            // ── Prompt assembly (one shared budget) ──────────────────────
            let exposed = disclosure.tools_for_iteration(task, iteration, &registry_names);
            let schemas = self.tools.schemas_for(&exposed);
            let memory = self.memory_note.read().unwrap().clone();
            let project_prompt = self.project_prompt.read().unwrap().clone();
            let system_budget =
                (profile.effective_ctx as f32 * SYSTEM_BUDGET_FRACTION) as usize;
            let system_text = build_system_text(
                &PromptInputs {
                    task,
                    tools: &schemas,
                    few_shot_count: profile.few_shot_count,
                    memory: memory.as_deref(),
                    rag: None,
                    file_context: None,
                    error_context: error_context.as_deref(),
                    project_prompt: project_prompt.as_deref(),
                },
                system_budget,
            );
            // Equality guard: unchanged text leaves the turn alone so the
            // KV prefix survives.
            if self.history.set_system_text(&system_text) {
                self.engine.invalidate_kv();
            }

            // ── Budget gate before the model call ────────────────────────
            self.apply_context_budget(&tx).await;

            // ── Open the transaction ─────────────────────────────────────
            let mut checkpoint = Checkpoint::open(
                &self.history,
                &self.engine,
                Some(profile.sampling.temperature),
            );
            let mut temp_override: Option<f32> = None;

            let grammar = if profile.grammar_preferred
                && self.config.engine.grammar
                && !self.engine.grammar_disabled()
                && !exposed.is_empty()
            {
                Some(tool_call_grammar().to_string())
            } else {
                None
            };

            // ── Generate until a committable response ────────────────────
            let mut overflow_recovery_used = false;
            let text = loop {
                let prompt = render_prompt(
                    self.engine.wrapper().and_then(|w| w.name()),
                    self.history.turns(),
                );
                if tracing::enabled!(tracing::Level::DEBUG) {
                    debug!(iteration, prompt_chars = prompt.len(), "prompt assembled");
                }
                let _ = tx
                    .send(Event::PhaseChange {
                        phase: Phase::Generating,
                        status: format!("iteration {iteration}"),
                    })
                    .await;

                let outcome = match self
                    .stream_once(&prompt, temp_override, grammar.clone(), &cancel, &tx)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(SessionError::Engine(
                        runa_engine::EngineError::ContextOverflow { n_ctx },
                    )) if !overflow_recovery_used => {
                        // The server was loaded with a smaller window than the
                        // profile claimed.  Rotate through the ledger and
                        // retry once against the real ceiling.
                        warn!(n_ctx, "context overflow; rotating and retrying once");
                        overflow_recovery_used = true;
                        let todos = self.todos.lock().unwrap().clone();
                        let ledger = ConversationLedger::build(&self.history, &todos);
                        self.history.rotate(ledger.render());
                        self.engine.invalidate_kv();
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if outcome.cancelled {
                    // Commit the partial turn so the user message is never
                    // orphaned; placeholder text when nothing arrived.
                    let text = if outcome.visible.trim().is_empty() {
                        "[Generation cancelled]".to_string()
                    } else {
                        outcome.visible.clone()
                    };
                    self.history.push_model(&text, vec![]);
                    checkpoint.commit();
                    let _ = tx
                        .send(Event::Finish {
                            full_response: text,
                            status: FinishStatus::Cancelled,
                        })
                        .await;
                    return Ok(());
                }

                let thinking_only =
                    outcome.visible.trim().is_empty() && !outcome.thinking.is_empty();
                let verdict = evaluate(&EvalInput {
                    text: &outcome.visible,
                    thinking_only,
                    iteration,
                    hit_token_cap: outcome.hit_token_cap,
                    task,
                    exec: self.exec.as_ref(),
                });

                match verdict {
                    Verdict::Skip => {
                        // Retry silently — nothing is appended to history.
                        checkpoint.consecutive_empty_grammar_retries += 1;
                        if checkpoint.consecutive_empty_grammar_retries > MAX_SKIP_RETRIES {
                            break String::new();
                        }
                        debug!("empty/thinking-only response; retrying silently");
                        continue;
                    }
                    Verdict::Rollback(reason)
                        if checkpoint.rollback_retries
                            < self.config.agent.rollback_retry_budget =>
                    {
                        warn!(?reason, "rolling back response");
                        checkpoint.rollback(&mut self.history, &self.engine);
                        let current =
                            temp_override.unwrap_or(profile.sampling.temperature);
                        temp_override = Some((current - ROLLBACK_TEMP_STEP).max(0.1));
                        continue;
                    }
                    Verdict::Rollback(reason) => {
                        // Budget exhausted: commit the last response anyway.
                        warn!(?reason, "rollback budget exhausted; committing response");
                        break outcome.visible;
                    }
                    Verdict::Commit => break outcome.visible,
                }
            };

            // COMMIT: counters reset; the temperature reduction dies with
            // the iteration (next one starts from the caller's value).
            checkpoint.commit();

            // ── Chat gate ────────────────────────────────────────────────
            if task == TaskKind::Chat && is_fabricated_chat_response(&text, &registry_names) {
                // Fabricated function array on a chat turn: nothing is
                // displayed and nothing is executed.
                self.history.push_model("", vec![]);
                let _ = tx
                    .send(Event::Finish {
                        full_response: String::new(),
                        status: FinishStatus::Complete,
                    })
                    .await;
                return Ok(());
            }

            // ── Parse tool calls ─────────────────────────────────────────
            let mut calls = parse_tool_calls(&text, &exposed, task == TaskKind::Chat);

            if let Some(cap) = profile.max_tools_per_iter {
                if calls.len() > cap as usize {
                    debug!(cap, dropped = calls.len() - cap as usize, "tool cap applied");
                    calls.truncate(cap as usize);
                }
            }
            let mut guard_nudges = Vec::new();
            apply_browser_cap(
                &mut calls,
                self.config.agent.browser_actions_per_iteration as usize,
                &self.tools,
                &mut guard_nudges,
            );
            defer_cobatched_writes(&mut calls, &self.tools, &mut guard_nudges);
            self.apply_fabricated_write_guard(&mut calls, &mut guard_nudges);

            if calls.is_empty() {
                // No (surviving) tool calls: either this is the final
                // answer, or the model is describing instead of acting.
                self.history.push_model(&text, vec![]);
                for nudge in &guard_nudges {
                    self.history.push_user(nudge.clone());
                }
                if !guard_nudges.is_empty() {
                    continue;
                }

                // The model wrote tool-call markup the parser could not use
                // (XML/Hermes tags, unknown names).  Correct the format once
                // rather than returning the markup as the "answer".
                if contains_malformed_tool_call(&text)
                    && !no_tool_nudge_sent
                    && iteration < max_iterations
                {
                    no_tool_nudge_sent = true;
                    self.history.push_user(
                        "You output a tool call in an unsupported format. Use a \
                         fenced JSON block: ```json\n{\"tool\": \"<name>\", \
                         \"params\": { ... }}\n``` with a tool name from the \
                         provided list.",
                    );
                    continue;
                }

                if task != TaskKind::Chat
                    && !no_tool_nudge_sent
                    && iteration < max_iterations
                    && (mentions_paths(&text) || is_vague_summary(&text))
                {
                    // Described-not-executed: one nudge, then accept the
                    // next tool-free response as final.
                    no_tool_nudge_sent = true;
                    self.history.push_user(
                        "Use the list_directory and read_file tools to inspect real \
                         data — don't describe results from memory. Quote what the \
                         tools actually returned.",
                    );
                    continue;
                }

                let _ = tx
                    .send(Event::Finish {
                        full_response: text,
                        status: FinishStatus::Complete,
                    })
                    .await;
                return Ok(());
            }

            // ── Execute, strictly in text order ──────────────────────────
            self.history.push_model(&text, calls.clone());
            for nudge in guard_nudges.drain(..) {
                self.history.push_user(nudge);
            }

            let _ = tx
                .send(Event::PhaseChange {
                    phase: Phase::ExecutingTools,
                    status: format!("{} call(s)", calls.len()),
                })
                .await;

            let mut results: Vec<(String, ToolOutput)> = Vec::new();
            let mut todo_mutations = 0u32;
            for call in &calls {
                if cancel.is_cancelled() {
                    break;
                }
                if call.name == "update_todo" {
                    todo_mutations += 1;
                    if todo_mutations > self.config.agent.todo_mutations_per_iteration {
                        results.push((
                            call.name.clone(),
                            ToolOutput::err(
                                call.id,
                                ToolErrorKind::InvalidParams,
                                "todo mutation cap reached for this iteration",
                            ),
                        ));
                        continue;
                    }
                }
                let _ = tx
                    .send(Event::ToolExecuting {
                        name: call.name.clone(),
                        params: call.params.clone(),
                    })
                    .await;

                // Every tool future is raced against the session cancel
                // token so nothing outlives its session.
                let output = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ToolOutput::err(
                        call.id,
                        ToolErrorKind::ExternalError,
                        "cancelled",
                    ),
                    out = self.tools.execute(call) => out,
                };

                stuck.record(&call.name, &params_digest(call));
                disclosure.observe(&call.name, self.tools.family_of(&call.name), output.success);
                self.drain_tool_events(&tx).await;

                let _ = tx
                    .send(Event::ToolResult {
                        name: call.name.clone(),
                        success: output.success,
                        preview: preview_of(&output.output),
                    })
                    .await;
                results.push((call.name.clone(), output));
            }
            error_context = results
                .iter()
                .find(|(_, out)| !out.success)
                .map(|(name, out)| format!("{name}: {}", preview_of(&out.output)));
            self.history.push_tool_results(results);

            if cancel.is_cancelled() {
                let _ = tx
                    .send(Event::Finish {
                        full_response: text,
                        status: FinishStatus::Cancelled,
                    })
                    .await;
                return Ok(());
            }

            // ── Stuck detection ──────────────────────────────────────────
            if stuck.is_stuck() {
                stuck_nudges += 1;
                stuck.reset();
                if stuck_nudges >= 2 {
                    warn!("stuck twice; terminating with summary");
                    self.finish_with_wrapup(&tx, task, FinishStatus::Stuck, &cancel)
                        .await;
                    return Ok(());
                }
                self.history.push_user(
                    "The last approach isn't working — the same tool calls keep \
                     repeating with the same arguments. Try a different tool or \
                     a different approach.",
                );
            }

            // ── Budget gate after tool results ───────────────────────────
            self.apply_context_budget(&tx).await;
        }
    }

    /// One engine stream with token forwarding to the event channel.
    async fn stream_once(
        &self,
        prompt: &str,
        temp_override: Option<f32>,
        grammar: Option<String>,
        cancel: &CancelToken,
        tx: &mpsc::Sender<Event>,
    ) -> Result<runa_engine::StreamOutcome, SessionError> {
        let (token_tx, mut token_rx) = mpsc::channel::<EngineToken>(128);
        let event_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(token) = token_rx.recv().await {
                let event = match token {
                    EngineToken::Visible(t) => Event::Token(t),
                    EngineToken::Thinking(t) => Event::ThinkingToken(t),
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let overrides = runa_model::SamplingOverrides {
            temperature: temp_override,
            ..Default::default()
        };
        let outcome = self
            .engine
            .stream(prompt, overrides, grammar, cancel, token_tx)
            .await?;
        let _ = forwarder.await;
        Ok(outcome)
    }

    /// Check thresholds; compact in place or rotate through the ledger.
    async fn apply_context_budget(&mut self, tx: &mpsc::Sender<Event>) {
        let effective_ctx = self.engine.effective_ctx();
        match self.context.check(&mut self.history, 0, effective_ctx) {
            ContextAction::None => {}
            ContextAction::Compacted => {
                let _ = tx
                    .send(Event::PhaseChange {
                        phase: Phase::Compacting,
                        status: "progressive compaction".to_string(),
                    })
                    .await;
            }
            ContextAction::NeedsRotation => {
                let _ = tx
                    .send(Event::PhaseChange {
                        phase: Phase::Summarizing,
                        status: "rotating context".to_string(),
                    })
                    .await;
                let todos = self.todos.lock().unwrap().clone();
                let ledger = ConversationLedger::build(&self.history, &todos);
                self.history.rotate(ledger.render());
                // The rotated prompt shares no prefix with the old one.
                self.engine.invalidate_kv();
            }
        }
    }

    /// Give the model one final tool-free turn to summarise, then finish.
    async fn finish_with_wrapup(
        &mut self,
        tx: &mpsc::Sender<Event>,
        _task: TaskKind,
        status: FinishStatus,
        cancel: &CancelToken,
    ) {
        self.history.push_user(
            "Stop here. Do not call any more tools. Write a concise summary of \
             (1) what has been completed, (2) what remains, and (3) how to \
             continue.",
        );
        let prompt = render_prompt(
            self.engine.wrapper().and_then(|w| w.name()),
            self.history.turns(),
        );
        let full_response = match self.stream_once(&prompt, None, None, cancel, tx).await {
            Ok(outcome) if !outcome.visible.trim().is_empty() => {
                self.history.push_model(&outcome.visible, vec![]);
                outcome.visible
            }
            _ => String::new(),
        };
        let _ = tx
            .send(Event::Finish {
                full_response,
                status,
            })
            .await;
    }

    async fn drain_tool_events(&mut self, tx: &mpsc::Sender<Event>) {
        while let Ok(event) = self.tool_events.try_recv() {
            match event {
                ToolEvent::TodoUpdate(todos) => {
                    *self.todos.lock().unwrap() = todos.clone();
                    let _ = tx.send(Event::TodoUpdate(todos)).await;
                }
            }
        }
    }

    /// Drop oversized write_file calls whose content cannot have come from
    /// gathered data.
    fn apply_fabricated_write_guard(
        &self,
        calls: &mut Vec<ToolCall>,
        nudges: &mut Vec<String>,
    ) {
        let before = calls.len();
        calls.retain(|c| {
            if c.name != "write_file" {
                return true;
            }
            let content_len = c
                .params
                .get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.len())
                .unwrap_or(0);
            content_len <= FABRICATED_WRITE_BYTES || self.exec.has_gathered_data()
        });
        if calls.len() < before {
            nudges.push(
                "That write_file content is too large to be grounded — no data \
                 was gathered this session. Read or fetch the real data first, \
                 then write the file from it."
                    .to_string(),
            );
        }
    }
}

/// Keep at most `cap` browser actions per iteration; the rest are dropped
/// with a nudge so navigate → snapshot → click sequences across iterations
/// instead of cascading stale element references inside one.
fn apply_browser_cap(
    calls: &mut Vec<ToolCall>,
    cap: usize,
    tools: &ToolRegistry,
    nudges: &mut Vec<String>,
) {
    let mut seen = 0usize;
    let before = calls.len();
    calls.retain(|c| {
        if tools.family_of(&c.name) == Some(ToolFamily::Browser) {
            seen += 1;
            seen <= cap
        } else {
            true
        }
    });
    if calls.len() < before {
        nudges.push(format!(
            "Only {cap} browser actions run per iteration; the page changes \
             under you otherwise. The remaining actions were dropped — take \
             them next iteration from the fresh snapshot."
        ));
    }
}

/// Defer writes that are co-batched with data-gathering tools: the write
/// runs next iteration, after the data has actually landed.
fn defer_cobatched_writes(
    calls: &mut Vec<ToolCall>,
    tools: &ToolRegistry,
    nudges: &mut Vec<String>,
) {
    let gathering = calls.iter().any(|c| {
        matches!(
            tools.family_of(&c.name),
            Some(ToolFamily::Web) | Some(ToolFamily::Browser)
        )
    });
    if !gathering {
        return;
    }
    let before = calls.len();
    calls.retain(|c| c.name != "write_file");
    if calls.len() < before {
        nudges.push(
            "The write_file call was deferred: it was batched with data \
             gathering, so its content could not include the gathered data. \
             Write the file next iteration once the results are in."
                .to_string(),
        );
    }
}

/// Tool-call markup written into the text stream instead of the JSON
/// protocol.  Some fine-tuned families fall back to the syntax of the stack
/// they were trained on.
fn contains_malformed_tool_call(text: &str) -> bool {
    text.contains("<tool_call>")
        || text.contains("</tool_call>")
        || text.contains("<function=")
        || text.contains("[TOOL_CALL]")
}

fn preview_of(output: &str) -> String {
    let mut preview: String = output.chars().take(160).collect();
    if output.len() > preview.len() {
        preview.push('…');
    }
    preview
}

/// Path-like strings in a response that executed no tools — the signature
/// of describing a filesystem from memory.
fn mentions_paths(text: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?:^|[\s`(])(?:\./|/|~/)?(?:[\w.-]+/)+[\w.-]+").expect("static regex")
    });
    re.is_match(text)
}

/// Vague "people discussed X" summaries with no quoted material.
fn is_vague_summary(text: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(people|users|commenters|posters)\s+(discussed|talked about|mentioned|are saying)")
            .expect("static regex")
    });
    re.is_match(text) && !text.contains('"')
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_detection() {
        assert!(mentions_paths("look in src/main.rs for the entry point"));
        assert!(mentions_paths("the config lives at ./config/app.toml"));
        assert!(!mentions_paths("no file references here at all"));
    }

    #[test]
    fn vague_summary_detection() {
        assert!(is_vague_summary("People discussed the new release."));
        assert!(!is_vague_summary(
            "People discussed the release: \"it's faster\" was the top comment."
        ));
        assert!(!is_vague_summary("The release notes list three fixes."));
    }

    #[test]
    fn preview_is_bounded() {
        let long = "x".repeat(500);
        let p = preview_of(&long);
        assert!(p.chars().count() <= 161);
        assert!(p.ends_with('…'));
    }
}
