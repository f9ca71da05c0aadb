// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model profile registry.
//!
//! Given the filename of a GGUF model, [`profile_for_filename`] returns a
//! [`ModelProfile`]: sampling parameters, tool-per-iteration caps, context
//! ceilings, few-shot counts and think-token policy, derived from a static
//! family × size-tier table.  Matching is longest-pattern-wins; an unknown
//! family falls back to base defaults with a warning, never an error.

mod families;
mod profile;
mod wrapper;

pub use families::{profile_for_filename, FAMILY_TABLE};
pub use profile::{
    Family, ModelProfile, Quirks, SamplingOverrides, SamplingParams, ThinkPolicy, Tier,
};
pub use wrapper::{select_wrapper, WrapperSelection};
