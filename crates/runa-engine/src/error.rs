// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

/// Engine failure taxonomy.
///
/// Load and OOM failures are recovered locally (reduced GPU layers or a
/// shrunken context) and only surface after retry exhaustion.  Context errors
/// invalidate the KV marker; the caller rotates and retries.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Load(String),

    /// The backend ran out of device memory.  Triggers the GPU layer ladder.
    #[error("backend out of memory")]
    OutOfMemory,

    /// The prompt exceeded the context the server was actually loaded with.
    #[error("context window exceeded (n_ctx = {n_ctx})")]
    ContextOverflow { n_ctx: u32 },

    /// A handle was used after the model/context it belonged to was disposed.
    #[error("context disposed")]
    Disposed,

    #[error("chat wrapper mismatch: {0}")]
    WrapperMismatch(String),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// Grammar-constrained generation produced no token within its deadline.
    /// Grammar stays disabled for the rest of the session once this fires.
    #[error("grammar-constrained generation stalled before first token")]
    GrammarStall,

    /// This load was superseded by a newer `load` call and aborted without
    /// touching engine state.
    #[error("load superseded by a newer request")]
    Superseded,

    #[error("no model loaded")]
    NoModel,

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the GPU fallback ladder should retry after this error.
    pub fn is_oom(&self) -> bool {
        matches!(self, EngineError::OutOfMemory)
    }
}
