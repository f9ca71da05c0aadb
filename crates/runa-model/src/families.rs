// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static family table and GGUF filename matching.

use regex::Regex;
use tracing::warn;

use crate::profile::{
    Family, ModelProfile, Quirks, SamplingOverrides, ThinkPolicy, Tier,
};

/// One row in the family table.
///
/// `patterns` are matched case-insensitively against the filename; the table
/// row whose matching pattern is **longest** wins, so `deepseek-r1` beats
/// `deepseek` and `qwen3` beats `qwen`.
pub struct FamilyEntry {
    pub family: Family,
    pub patterns: &'static [&'static str],
    /// Sampling adjustments relative to the global defaults.
    pub sampling: SamplingOverrides,
    pub think: ThinkPolicy,
    pub grammar_preferred: bool,
    pub quirks: Quirks,
}

const NO_OVERRIDES: SamplingOverrides = SamplingOverrides {
    temperature: None,
    top_p: None,
    top_k: None,
    repeat_penalty: None,
    frequency_penalty: None,
    presence_penalty: None,
};

/// The family registry.  Order is irrelevant — longest matching pattern wins.
pub const FAMILY_TABLE: &[FamilyEntry] = &[
    FamilyEntry {
        family: Family::Llama3,
        patterns: &["llama-3", "llama3", "meta-llama-3"],
        sampling: SamplingOverrides {
            temperature: Some(0.6),
            ..NO_OVERRIDES
        },
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(0),
    },
    FamilyEntry {
        family: Family::Llama,
        patterns: &["llama", "tinyllama"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(0),
    },
    FamilyEntry {
        family: Family::Qwen3,
        patterns: &["qwen3", "qwen-3", "qwq"],
        sampling: SamplingOverrides {
            temperature: Some(0.6),
            top_p: Some(0.95),
            ..NO_OVERRIDES
        },
        think: ThinkPolicy {
            budget: Some(2_048),
            expected_support: true,
        },
        grammar_preferred: false,
        quirks: Quirks(Quirks::INLINE_THINK_TAGS.0 | Quirks::CHATML_LEAKAGE.0),
    },
    FamilyEntry {
        family: Family::Qwen,
        patterns: &["qwen"],
        sampling: SamplingOverrides {
            temperature: Some(0.7),
            ..NO_OVERRIDES
        },
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(Quirks::CHATML_LEAKAGE.0),
    },
    FamilyEntry {
        family: Family::Mixtral,
        patterns: &["mixtral"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(0),
    },
    FamilyEntry {
        family: Family::Mistral,
        patterns: &["mistral", "ministral", "codestral"],
        sampling: SamplingOverrides {
            temperature: Some(0.3),
            ..NO_OVERRIDES
        },
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(Quirks::NO_SYSTEM_ROLE.0),
    },
    FamilyEntry {
        family: Family::Phi,
        patterns: &["phi-3", "phi-4", "phi3", "phi4", "phi"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: false,
        quirks: Quirks(Quirks::PYTHONIC_TOOL_CALLS.0),
    },
    FamilyEntry {
        family: Family::Gemma,
        patterns: &["gemma", "codegemma"],
        sampling: SamplingOverrides {
            temperature: Some(0.9),
            top_k: Some(64),
            ..NO_OVERRIDES
        },
        think: ThinkPolicy::DISABLED,
        grammar_preferred: false,
        quirks: Quirks(Quirks::NO_SYSTEM_ROLE.0),
    },
    FamilyEntry {
        family: Family::DeepSeekR1,
        patterns: &["deepseek-r1", "deepseek_r1", "r1-distill"],
        sampling: SamplingOverrides {
            temperature: Some(0.6),
            ..NO_OVERRIDES
        },
        think: ThinkPolicy {
            budget: Some(4_096),
            expected_support: true,
        },
        grammar_preferred: false,
        quirks: Quirks(Quirks::INLINE_THINK_TAGS.0),
    },
    FamilyEntry {
        family: Family::DeepSeek,
        patterns: &["deepseek"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(0),
    },
    FamilyEntry {
        family: Family::Yi,
        patterns: &["yi-", "yi_"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: false,
        quirks: Quirks(Quirks::CHATML_LEAKAGE.0),
    },
    FamilyEntry {
        family: Family::InternLm,
        patterns: &["internlm"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: false,
        quirks: Quirks(Quirks::CHATML_LEAKAGE.0),
    },
    FamilyEntry {
        family: Family::CommandR,
        patterns: &["command-r", "command_r", "c4ai"],
        sampling: SamplingOverrides {
            temperature: Some(0.3),
            ..NO_OVERRIDES
        },
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(0),
    },
    FamilyEntry {
        family: Family::Granite,
        patterns: &["granite"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: true,
        quirks: Quirks(0),
    },
    FamilyEntry {
        family: Family::SmolLm,
        patterns: &["smollm", "smol-lm"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: false,
        quirks: Quirks(Quirks::CHATML_LEAKAGE.0),
    },
    FamilyEntry {
        family: Family::Hermes,
        patterns: &["hermes", "nous-hermes"],
        sampling: NO_OVERRIDES,
        think: ThinkPolicy::DISABLED,
        grammar_preferred: false,
        quirks: Quirks(Quirks::PYTHONIC_TOOL_CALLS.0),
    },
];

/// Extract the parameter count in billions from a filename, e.g. `7B`,
/// `0.6b`, `70-B`.  Returns `None` when no size marker is present.
fn params_from_filename(name: &str) -> Option<f32> {
    // Common GGUF naming: "<family>-<size>B-<variant>.<quant>.gguf".
    // The size may carry a decimal point (0.6B) and is occasionally
    // separated from the B by a dash or underscore.
    let re = Regex::new(r"(?i)(?:^|[-_.])(\d+(?:\.\d+)?)\s*[-_]?b(?:$|[-_.])").ok()?;
    let caps = re.captures(name)?;
    caps.get(1)?.as_str().parse::<f32>().ok()
}

/// Resolve a [`ModelProfile`] for a GGUF filename.
///
/// Family matching is longest-pattern-wins across [`FAMILY_TABLE`]; the tier
/// comes from the parameter count embedded in the name.  Unknown families and
/// unparseable sizes fall back conservatively (base defaults / `Tiny`).
pub fn profile_for_filename(filename: &str) -> ModelProfile {
    let lower = filename.to_lowercase();

    let mut best: Option<(&FamilyEntry, usize)> = None;
    for entry in FAMILY_TABLE {
        for pat in entry.patterns {
            if lower.contains(pat) {
                let better = match best {
                    Some((_, len)) => pat.len() > len,
                    None => true,
                };
                if better {
                    best = Some((entry, pat.len()));
                }
            }
        }
    }

    let tier = match params_from_filename(&lower) {
        Some(b) => Tier::from_params_b(b),
        None => Tier::Tiny,
    };

    let Some((entry, _)) = best else {
        warn!(filename, "unknown model family; using base defaults");
        let mut p = ModelProfile::base_defaults();
        p.tier = tier;
        p.max_tools_per_iter = tier.max_tools_per_iter();
        p.effective_ctx = tier.effective_ctx_ceiling();
        p.few_shot_count = tier.few_shot_count();
        return p;
    };

    ModelProfile {
        family: entry.family,
        tier,
        sampling: entry.sampling.apply(Default::default()),
        think: entry.think,
        max_tools_per_iter: tier.max_tools_per_iter(),
        grammar_preferred: entry.grammar_preferred,
        effective_ctx: tier.effective_ctx_ceiling(),
        few_shot_count: tier.few_shot_count(),
        quirks: entry.quirks,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
