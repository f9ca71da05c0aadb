// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat-wrapper (prompt template) selection.
//!
//! A small registry of trusted family templates is checked first.  For a
//! trusted family the backend's auto-detected wrapper is kept, with the
//! template's date variables zeroed (`today_date` and
//! `cutting_knowledge_date` render as null) so the preamble does not drift
//! between sessions and invalidate the KV prefix.  Unknown families and
//! models shipping an explicit Jinja template run raw.

use crate::profile::Family;

/// How the engine should wrap chat turns for a given model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapperSelection {
    /// Keep the auto-detected wrapper under this registry name, with date
    /// variables zeroed.
    Trusted { name: &'static str },
    /// No registry entry — run the model's own template untouched.
    Raw,
}

impl WrapperSelection {
    /// Name to persist and reapply after `reset_session`.  Raw selections
    /// have no name; reapplication is a no-op for them.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            WrapperSelection::Trusted { name } => Some(name),
            WrapperSelection::Raw => None,
        }
    }
}

/// Look up the trusted wrapper for `family`.
pub fn select_wrapper(family: Family) -> WrapperSelection {
    let name = match family {
        Family::Llama3 => "llama-3",
        Family::Llama => "llama-2",
        Family::Qwen | Family::Qwen3 | Family::Yi | Family::InternLm | Family::SmolLm => "chatml",
        Family::Mistral | Family::Mixtral => "mistral",
        Family::Gemma => "gemma",
        Family::Phi => "phi-3",
        Family::DeepSeek | Family::DeepSeekR1 => "deepseek",
        Family::CommandR => "command-r",
        Family::Granite => "granite",
        // Hermes ships its own Jinja template; trust it as-is.
        Family::Hermes | Family::Unknown => return WrapperSelection::Raw,
    };
    WrapperSelection::Trusted { name }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qwen_families_share_chatml() {
        assert_eq!(select_wrapper(Family::Qwen), select_wrapper(Family::Qwen3));
        assert_eq!(
            select_wrapper(Family::Qwen).name(),
            Some("chatml")
        );
    }

    #[test]
    fn unknown_family_runs_raw() {
        assert_eq!(select_wrapper(Family::Unknown), WrapperSelection::Raw);
        assert!(select_wrapper(Family::Unknown).name().is_none());
    }

    #[test]
    fn llama3_has_its_own_wrapper() {
        assert_eq!(select_wrapper(Family::Llama3).name(), Some("llama-3"));
        assert_ne!(
            select_wrapper(Family::Llama3),
            select_wrapper(Family::Llama)
        );
    }
}
