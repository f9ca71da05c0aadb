// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The LLM engine.
//!
//! Owns exactly one loaded model at a time, one context window and one active
//! generation slot.  Streams tokens with cooperative cancellation, reuses the
//! backend's KV prefix across iterations, and recovers locally from GPU and
//! context OOM via fallback ladders.
//!
//! The inference backend is a llama.cpp-compatible server owned as a child
//! process; tests run against a scripted in-memory backend.

mod backend;
mod cancel;
mod engine;
mod error;
mod hygiene;
mod llama_server;
pub mod mock;

pub use backend::{
    BackendInfo, EvalOutcome, GenRequest, InferEvent, InferenceBackend, KvMarker, TokenStream,
};
pub use cancel::CancelToken;
pub use engine::{Engine, EngineToken, LoadReport, StreamOutcome};
pub use error::EngineError;
pub use hygiene::{chatml_fraction, scrub_chatml, StreamChunk, ThinkTagFilter};
pub use llama_server::LlamaServerBackend;
