// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use runa_engine::EngineError;

/// Session-level failures.  Only these (and fatal panics) ever reach the
/// caller as error events; tool and parser failures are absorbed inside the
/// loop.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A message was submitted while another is still being processed.
    /// The session is strictly one-request-at-a-time.
    #[error("session is busy processing another message")]
    Busy,

    #[error("no model loaded")]
    NoModel,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
