// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use runa_config::{EngineConfig, GpuPreference};
use runa_model::{
    profile_for_filename, select_wrapper, ModelProfile, SamplingOverrides, ThinkPolicy,
    WrapperSelection,
};

use crate::backend::{GenRequest, InferEvent, InferenceBackend, KvMarker};
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::hygiene::{scrub_chatml, StreamChunk, ThinkTagFilter};

/// Layer count meaning "offload everything" for llama.cpp.
const ALL_LAYERS: u32 = 99;
/// GPU ladder decay factor per OOM retry.
const LADDER_DECAY: f32 = 0.84;
/// Maximum OOM retries before falling back to CPU-only.
const MAX_GPU_RETRIES: u32 = 6;
/// Context shrink factor per OOM retry once on CPU.
const CTX_SHRINK: f32 = 0.84;
const MAX_CTX_RETRIES: u32 = 6;

/// One classified, scrubbed token emitted to the caller during streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineToken {
    Visible(String),
    Thinking(String),
}

/// Result of one `stream` call.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    /// Scrubbed user-facing text.  Passes the same sanitizer used at store
    /// time — the two must not diverge.
    pub visible: String,
    /// Accumulated thinking-channel text (already tag-stripped).
    pub thinking: String,
    /// The model hit its token cap; the response is likely truncated.
    pub hit_token_cap: bool,
    pub cancelled: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub profile: ModelProfile,
    pub n_ctx: u32,
    pub gpu_layers: u32,
    pub attempts: u32,
}

#[derive(Default)]
struct EngineState {
    profile: Option<ModelProfile>,
    wrapper: Option<WrapperSelection>,
    n_ctx: u32,
    supports_thinking: bool,
    last_eval: Option<KvMarker>,
}

/// The inference engine.  Owns exactly one loaded model, one context and one
/// active sequence; all session state lives behind a single lock that is
/// never held across an await.
pub struct Engine {
    backend: Arc<dyn InferenceBackend>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    /// Monotonic load generation.  Every `load` call takes a fresh id and
    /// checks `superseded` after each heavy await; a superseded load aborts
    /// without touching engine state.
    load_generation: AtomicU64,
    /// Set when a grammar-constrained generation stalls.  Session-lifetime:
    /// deliberately never cleared on COMMIT — once grammar has stalled it
    /// stays off until the next model load.
    grammar_disabled: AtomicBool,
}

impl Engine {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            config,
            state: Mutex::new(EngineState::default()),
            load_generation: AtomicU64::new(0),
            grammar_disabled: AtomicBool::new(false),
        }
    }

    fn superseded(&self, my_generation: u64) -> bool {
        self.load_generation.load(Ordering::SeqCst) != my_generation
    }

    pub fn profile(&self) -> Option<ModelProfile> {
        self.state.lock().unwrap().profile.clone()
    }

    pub fn wrapper(&self) -> Option<WrapperSelection> {
        self.state.lock().unwrap().wrapper.clone()
    }

    pub fn last_eval(&self) -> Option<KvMarker> {
        self.state.lock().unwrap().last_eval
    }

    /// Drop the KV marker so the next prompt re-tokenizes from scratch.
    pub fn invalidate_kv(&self) {
        self.state.lock().unwrap().last_eval = None;
    }

    /// Context window of the loaded model (post-clamp, post-shrink).
    pub fn effective_ctx(&self) -> u32 {
        self.state.lock().unwrap().n_ctx
    }

    pub fn grammar_disabled(&self) -> bool {
        self.grammar_disabled.load(Ordering::SeqCst)
    }

    /// Load a model with a GPU fallback ladder.
    ///
    /// Attempts `N` layers, then `floor(N · 0.84)` per OOM up to
    /// [`MAX_GPU_RETRIES`] times, then CPU-only.  A CPU-side OOM additionally
    /// shrinks the context by 16 % per retry.  Cancel-safety comes from the
    /// generation counter: a `load` superseded by a newer call returns
    /// [`EngineError::Superseded`] and leaves current state untouched.
    pub async fn load(
        &self,
        model_path: &Path,
        gpu: GpuPreference,
    ) -> Result<LoadReport, EngineError> {
        let my_generation = self.load_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let filename = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut profile = profile_for_filename(&filename);

        let mut ctx = self
            .config
            .ctx_size
            .unwrap_or(profile.effective_ctx)
            .min(profile.effective_ctx);

        let mut layers = match gpu {
            GpuPreference::Auto => ALL_LAYERS,
            GpuPreference::Cpu => 0,
            GpuPreference::Layers(n) => n,
        };

        let deadline = Duration::from_secs(self.config.load_timeout_secs);
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut gpu_retries = 0u32;
        let mut ctx_retries = 0u32;

        let info = loop {
            if self.superseded(my_generation) {
                return Err(EngineError::Superseded);
            }
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or(EngineError::Timeout(deadline))?;

            attempts += 1;
            let result =
                tokio::time::timeout(remaining, self.backend.load(model_path, layers, ctx))
                    .await
                    .map_err(|_| EngineError::Timeout(deadline))?;

            if self.superseded(my_generation) {
                return Err(EngineError::Superseded);
            }

            match result {
                Ok(info) => break info,
                Err(e) if e.is_oom() && layers > 0 && gpu_retries < MAX_GPU_RETRIES => {
                    gpu_retries += 1;
                    layers = (layers as f32 * LADDER_DECAY).floor() as u32;
                    warn!(layers, gpu_retries, "load OOM; retrying with fewer GPU layers");
                }
                Err(e) if e.is_oom() && layers > 0 => {
                    layers = 0;
                    warn!("GPU ladder exhausted; falling back to CPU-only");
                }
                Err(e) if e.is_oom() && ctx_retries < MAX_CTX_RETRIES => {
                    ctx_retries += 1;
                    ctx = (ctx as f32 * CTX_SHRINK).floor() as u32;
                    warn!(ctx, ctx_retries, "CPU load OOM; shrinking context");
                }
                Err(e) => return Err(e),
            }
        };

        // Thinking support is decided by the loaded model, not the profile.
        // A non-thinking model gets its think budget zeroed even when the
        // family table expected support.
        if !info.supports_thinking {
            profile.think = ThinkPolicy::DISABLED;
        }
        if info.n_ctx > 0 {
            profile.effective_ctx = profile.effective_ctx.min(info.n_ctx);
        }

        let wrapper = select_wrapper(profile.family);
        debug!(
            family = ?profile.family,
            tier = ?profile.tier,
            wrapper = ?wrapper.name(),
            n_ctx = info.n_ctx,
            gpu_layers = info.gpu_layers,
            "model loaded"
        );

        {
            let mut state = self.state.lock().unwrap();
            state.profile = Some(profile.clone());
            state.wrapper = Some(wrapper);
            state.n_ctx = profile.effective_ctx;
            state.supports_thinking = info.supports_thinking;
            // Markers from the previous model are worthless.
            state.last_eval = None;
        }
        // Grammar is re-enabled per loaded model, not per COMMIT.
        self.grammar_disabled.store(false, Ordering::SeqCst);

        Ok(LoadReport {
            profile,
            n_ctx: info.n_ctx,
            gpu_layers: info.gpu_layers,
            attempts,
        })
    }

    /// Stream one generation.
    ///
    /// Emits scrubbed, think-classified tokens into `sink` as they arrive and
    /// returns the accumulated outcome.  Cancellation is cooperative: the
    /// token is polled at every per-token suspension point, and a cancelled
    /// stream returns the partial text (never an error) so the caller can
    /// store it — a user turn is never orphaned.
    pub async fn stream(
        &self,
        prompt: &str,
        overrides: SamplingOverrides,
        grammar: Option<String>,
        cancel: &CancelToken,
        sink: mpsc::Sender<EngineToken>,
    ) -> Result<StreamOutcome, EngineError> {
        let profile = self.profile().ok_or(EngineError::NoModel)?;
        let my_generation = self.load_generation.load(Ordering::SeqCst);
        let sampling = overrides.apply(profile.sampling);

        let grammar_active =
            grammar.is_some() && self.config.grammar && !self.grammar_disabled();
        let effective_grammar = if grammar_active { grammar } else { None };

        let mut req = GenRequest::text(prompt, sampling);
        req.grammar = effective_grammar;

        match self
            .consume_stream(req.clone(), cancel, &sink, my_generation)
            .await
        {
            Err(EngineError::GrammarStall) => {
                // Known llama.cpp failure mode: rejection sampling can stall
                // before the first token.  Disable grammar for the rest of
                // the session (not reset on COMMIT) and retry unconstrained.
                warn!("grammar generation stalled; disabling grammar for this session");
                self.grammar_disabled.store(true, Ordering::SeqCst);
                req.grammar = None;
                self.consume_stream(req, cancel, &sink, my_generation).await
            }
            other => other,
        }
    }

    async fn consume_stream(
        &self,
        req: GenRequest,
        cancel: &CancelToken,
        sink: &mpsc::Sender<EngineToken>,
        my_generation: u64,
    ) -> Result<StreamOutcome, EngineError> {
        let grammar_active = req.grammar.is_some();
        let mut stream = self.backend.generate(req).await?;

        let mut outcome = StreamOutcome::default();
        let mut filter = ThinkTagFilter::new();
        let mut first_token_seen = false;

        let overall = Duration::from_secs(self.config.generation_timeout_secs);
        let first_token_deadline =
            Duration::from_secs(self.config.grammar_first_token_timeout_secs);
        let started = Instant::now();

        // Poll in short ticks so the cancel flag is observed within ~100 ms
        // even when the backend produces nothing at all.
        let tick = Duration::from_millis(100);
        loop {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let deadline = if grammar_active && !first_token_seen {
                first_token_deadline
            } else {
                overall
            };
            let remaining = match deadline.checked_sub(started.elapsed()) {
                Some(d) => d,
                None if grammar_active && !first_token_seen => {
                    return Err(EngineError::GrammarStall);
                }
                None => {
                    outcome.timed_out = true;
                    break;
                }
            };

            let event = match tokio::time::timeout(tick.min(remaining), stream.next()).await {
                Ok(Some(Ok(ev))) => ev,
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => break,
                // Tick elapsed with no event — loop back to re-check the
                // cancel flag and the deadlines.
                Err(_) => continue,
            };

            match event {
                InferEvent::Token(raw) => {
                    first_token_seen = true;
                    let scrubbed = scrub_chatml(&raw);
                    for chunk in filter.push(&scrubbed) {
                        match chunk {
                            StreamChunk::Visible(t) => {
                                outcome.visible.push_str(&t);
                                let _ = sink.send(EngineToken::Visible(t)).await;
                            }
                            StreamChunk::Thinking(t) => {
                                outcome.thinking.push_str(&t);
                                let _ = sink.send(EngineToken::Thinking(t)).await;
                            }
                        }
                    }
                }
                InferEvent::Done {
                    prefix_tokens,
                    hit_token_cap,
                } => {
                    outcome.hit_token_cap = hit_token_cap;
                    // The backend's evaluated range is the canonical history
                    // marker; reusing it across iterations avoids full
                    // re-tokenization of the prompt.
                    let mut state = self.state.lock().unwrap();
                    state.last_eval = Some(KvMarker {
                        prefix_tokens,
                        generation: my_generation,
                    });
                    break;
                }
            }
        }

        // Flush whatever the tag filter still holds.
        for chunk in filter.finish() {
            match chunk {
                StreamChunk::Visible(t) => {
                    outcome.visible.push_str(&t);
                    let _ = sink.send(EngineToken::Visible(t)).await;
                }
                StreamChunk::Thinking(t) => {
                    outcome.thinking.push_str(&t);
                    let _ = sink.send(EngineToken::Thinking(t)).await;
                }
            }
        }

        Ok(outcome)
    }

    /// One-shot utility completion (summaries, classification).
    ///
    /// Runs on a temporary secondary sequence when the backend has one; if it
    /// had to fall back to the main sequence, the KV marker is invalidated so
    /// the next real prompt re-tokenizes cleanly.
    pub async fn evaluate_only(&self, prompt: &str) -> Result<String, EngineError> {
        let profile = self.profile().ok_or(EngineError::NoModel)?;
        let mut req = GenRequest::text(prompt, profile.sampling);
        req.cache_prompt = false;

        let outcome = self.backend.evaluate(req).await?;
        if outcome.used_main_slot {
            self.invalidate_kv();
        }
        Ok(scrub_chatml(&outcome.text))
    }

    /// Dispose the active sequence and reapply the selected chat wrapper.
    ///
    /// The wrapper re-application matters: a freshly created session would
    /// otherwise fall back to the backend's default template, which produces
    /// word salad for families with a registry entry.
    pub async fn reset_session(&self) -> Result<(), EngineError> {
        self.backend.reset_sequence().await?;
        let mut state = self.state.lock().unwrap();
        state.last_eval = None;
        if let Some(profile) = &state.profile {
            let wrapper = select_wrapper(profile.family);
            debug!(wrapper = ?wrapper.name(), "reapplied chat wrapper after session reset");
            state.wrapper = Some(wrapper);
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
