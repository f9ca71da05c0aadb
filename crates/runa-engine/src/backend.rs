// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use runa_model::SamplingParams;

use crate::error::EngineError;

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<InferEvent, EngineError>> + Send>>;

/// Marker into the backend's KV cache: how many prompt tokens of the current
/// sequence are already evaluated.  A prompt sharing this prefix skips
/// re-tokenization entirely — the single biggest latency win in the loop.
/// `generation` ties the marker to one loaded model; markers from a previous
/// load are worthless and must be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvMarker {
    pub prefix_tokens: u32,
    pub generation: u64,
}

/// What the backend reports after a successful load.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Context window the server was actually loaded with.  May be smaller
    /// than requested after auto-shrink.
    pub n_ctx: u32,
    /// Whether the loaded model's template advertises a thinking channel.
    /// This — not the filename — decides whether think budgets apply.
    pub supports_thinking: bool,
    /// Number of parallel slots.  ≥ 2 means `evaluate` can run on a
    /// temporary secondary slot without touching the main sequence.
    pub slots: u32,
    /// GPU layers actually offloaded (0 = CPU only).
    pub gpu_layers: u32,
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenRequest {
    /// Fully rendered prompt text (wrapper already applied).
    pub prompt: String,
    pub sampling: SamplingParams,
    /// Maximum tokens to generate.
    pub n_predict: u32,
    /// GBNF grammar constraining the output, when tool-call grammar is active.
    pub grammar: Option<String>,
    /// Stop sequences.
    pub stop: Vec<String>,
    /// Ask the server to reuse the evaluated KV prefix for this prompt.
    pub cache_prompt: bool,
}

impl GenRequest {
    pub fn text(prompt: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            prompt: prompt.into(),
            sampling,
            n_predict: 2_048,
            grammar: None,
            stop: Vec::new(),
            cache_prompt: true,
        }
    }
}

/// A single streamed event from the backend.
#[derive(Debug, Clone)]
pub enum InferEvent {
    /// One decoded token (or token fragment) of model output.
    Token(String),
    /// The generation finished.
    Done {
        /// Prompt tokens evaluated into the KV cache for this sequence.  The
        /// engine stores this as the canonical history marker.
        prefix_tokens: u32,
        /// The generation stopped because it hit `n_predict`, not a stop
        /// condition — i.e. the response is likely truncated.
        hit_token_cap: bool,
    },
}

/// Result of a one-shot `evaluate` call.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub text: String,
    /// The backend had no secondary slot and ran on the main sequence; the
    /// caller must invalidate its KV marker.
    pub used_main_slot: bool,
}

/// The inference library surface the engine drives.
///
/// Implemented by [`crate::LlamaServerBackend`] for real GGUF inference and by
/// [`crate::mock::ScriptedBackend`] for tests.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Load `model_path` with `gpu_layers` offloaded and a context of
    /// `ctx_size` tokens.  Any previously loaded model is disposed first.
    async fn load(
        &self,
        model_path: &Path,
        gpu_layers: u32,
        ctx_size: u32,
    ) -> Result<BackendInfo, EngineError>;

    /// Dispose the loaded model, context and sequences.
    async fn unload(&self);

    /// Stream a generation on the main sequence.
    async fn generate(&self, req: GenRequest) -> Result<TokenStream, EngineError>;

    /// One-shot completion for utility calls (summaries, classifications).
    /// Runs on a temporary secondary slot when the backend has one; both the
    /// slot and its tokens are released on all exit paths.
    async fn evaluate(&self, req: GenRequest) -> Result<EvalOutcome, EngineError>;

    /// Drop the evaluated sequence so the next prompt starts from scratch.
    async fn reset_sequence(&self) -> Result<(), EngineError>;
}
