// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic in-memory backends for tests.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::backend::{
    BackendInfo, EvalOutcome, GenRequest, InferEvent, InferenceBackend, TokenStream,
};
use crate::error::EngineError;

/// A pre-scripted backend.  Each `generate` call pops the next event script
/// from the front of the queue, letting tests specify exact token sequences
/// without a server.  `last_request` records what the engine actually sent.
pub struct ScriptedBackend {
    scripts: Arc<Mutex<Vec<Vec<InferEvent>>>>,
    info: BackendInfo,
    /// Loads that should fail with OOM before one succeeds.  Used to test the
    /// GPU fallback ladder.
    oom_loads_remaining: Arc<Mutex<u32>>,
    pub last_request: Arc<Mutex<Option<GenRequest>>>,
    pub load_calls: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Vec<InferEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            info: BackendInfo {
                n_ctx: 8_192,
                supports_thinking: false,
                slots: 2,
                gpu_layers: 0,
            },
            oom_loads_remaining: Arc::new(Mutex::new(0)),
            last_request: Arc::new(Mutex::new(None)),
            load_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: a backend that always streams `reply` token by token.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        let mut events: Vec<InferEvent> =
            r.split_inclusive(' ').map(|t| InferEvent::Token(t.to_string())).collect();
        events.push(InferEvent::Done {
            prefix_tokens: 32,
            hit_token_cap: false,
        });
        Self::new(vec![events])
    }

    pub fn with_thinking_support(mut self) -> Self {
        self.info.supports_thinking = true;
        self
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.info.slots = slots;
        self
    }

    pub fn with_ctx(mut self, n_ctx: u32) -> Self {
        self.info.n_ctx = n_ctx;
        self
    }

    /// Make the next `n` loads fail with [`EngineError::OutOfMemory`].
    pub fn failing_loads(self, n: u32) -> Self {
        *self.oom_loads_remaining.lock().unwrap() = n;
        self
    }

    fn next_script(&self) -> Vec<InferEvent> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            vec![
                InferEvent::Token("[script exhausted]".to_string()),
                InferEvent::Done {
                    prefix_tokens: 0,
                    hit_token_cap: false,
                },
            ]
        } else {
            scripts.remove(0)
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(
        &self,
        _model_path: &Path,
        gpu_layers: u32,
        ctx_size: u32,
    ) -> Result<BackendInfo, EngineError> {
        self.load_calls.lock().unwrap().push((gpu_layers, ctx_size));
        {
            let mut remaining = self.oom_loads_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::OutOfMemory);
            }
        }
        let mut info = self.info.clone();
        info.gpu_layers = gpu_layers;
        Ok(info)
    }

    async fn unload(&self) {}

    async fn generate(&self, req: GenRequest) -> Result<TokenStream, EngineError> {
        *self.last_request.lock().unwrap() = Some(req);
        let events: Vec<Result<InferEvent, EngineError>> =
            self.next_script().into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)) as TokenStream)
    }

    async fn evaluate(&self, req: GenRequest) -> Result<EvalOutcome, EngineError> {
        *self.last_request.lock().unwrap() = Some(req);
        let text = self
            .next_script()
            .into_iter()
            .filter_map(|e| match e {
                InferEvent::Token(t) => Some(t),
                InferEvent::Done { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Ok(EvalOutcome {
            text,
            used_main_slot: self.info.slots < 2,
        })
    }

    async fn reset_sequence(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Backend that never produces a token.  Used to exercise the grammar
/// first-token deadline.
pub struct StallingBackend;

#[async_trait]
impl InferenceBackend for StallingBackend {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn load(
        &self,
        _model_path: &Path,
        gpu_layers: u32,
        _ctx_size: u32,
    ) -> Result<BackendInfo, EngineError> {
        Ok(BackendInfo {
            n_ctx: 4_096,
            supports_thinking: false,
            slots: 1,
            gpu_layers,
        })
    }

    async fn unload(&self) {}

    async fn generate(&self, _req: GenRequest) -> Result<TokenStream, EngineError> {
        // Pends forever; the engine's deadline must fire.
        Ok(Box::pin(stream::pending()) as TokenStream)
    }

    async fn evaluate(&self, _req: GenRequest) -> Result<EvalOutcome, EngineError> {
        futures::future::pending::<()>().await;
        unreachable!()
    }

    async fn reset_sequence(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
