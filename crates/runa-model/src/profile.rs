// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Model family, recognized from the GGUF filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Llama,
    Llama3,
    Qwen,
    Qwen3,
    Mistral,
    Mixtral,
    Phi,
    Gemma,
    DeepSeek,
    DeepSeekR1,
    Yi,
    InternLm,
    CommandR,
    Granite,
    SmolLm,
    Hermes,
    Unknown,
}

/// Size tier inferred from the parameter count embedded in the filename.
///
/// The tier governs how much the runtime trusts the model: tool caps,
/// effective context ceiling and few-shot counts all key off it.  An
/// unparseable size maps to `Tiny` — the most conservative tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Tiny,
    Small,
    Base,
    Medium,
    Large,
    XLarge,
}

impl Tier {
    /// Map a parameter count (in billions) to a tier.
    pub fn from_params_b(params_b: f32) -> Self {
        match params_b {
            p if p < 2.0 => Tier::Tiny,
            p if p < 5.0 => Tier::Small,
            p if p < 10.0 => Tier::Base,
            p if p < 35.0 => Tier::Medium,
            p if p < 100.0 => Tier::Large,
            _ => Tier::XLarge,
        }
    }

    /// Tool calls allowed per iteration.  `None` means unlimited.
    pub fn max_tools_per_iter(self) -> Option<u8> {
        match self {
            Tier::Tiny => Some(8),
            Tier::Small => Some(12),
            Tier::Base => Some(16),
            Tier::Medium => Some(24),
            Tier::Large | Tier::XLarge => None,
        }
    }

    /// Context ceiling in tokens, applied regardless of the model's claim.
    /// Small models degrade sharply near their trained window; clamping keeps
    /// generations coherent.
    pub fn effective_ctx_ceiling(self) -> u32 {
        match self {
            Tier::Tiny => 5_632,
            Tier::Small => 8_192,
            Tier::Base => 16_384,
            Tier::Medium => 32_768,
            Tier::Large => 65_536,
            Tier::XLarge => 131_072,
        }
    }

    /// How many few-shot tool-call examples the prompt builder includes.
    pub fn few_shot_count(self) -> u8 {
        match self {
            Tier::Tiny => 3,
            Tier::Small => 2,
            Tier::Base => 2,
            Tier::Medium => 1,
            Tier::Large | Tier::XLarge => 0,
        }
    }
}

/// Sampling parameters sent with every generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

/// Partial sampling overrides.  Merged right-over-left:
/// `defaults ⊕ family-tier overrides ⊕ explicit call args`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

impl SamplingOverrides {
    /// Apply these overrides on top of `base`.
    pub fn apply(self, base: SamplingParams) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.unwrap_or(base.top_p),
            top_k: self.top_k.unwrap_or(base.top_k),
            repeat_penalty: self.repeat_penalty.unwrap_or(base.repeat_penalty),
            frequency_penalty: self.frequency_penalty.unwrap_or(base.frequency_penalty),
            presence_penalty: self.presence_penalty.unwrap_or(base.presence_penalty),
        }
    }
}

/// Think-token policy for reasoning-capable models.
///
/// A budget is applied **only when** the loaded model advertises thinking
/// support — never from the filename alone.  Feeding a think budget to a
/// non-thinking model corrupts its output, so the engine re-checks the
/// loaded model's capabilities and zeroes the budget when they disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkPolicy {
    /// Token budget for the reasoning block.  `None` disables thinking.
    pub budget: Option<u32>,
    /// Whether this family is *expected* to support thinking.  Advisory only;
    /// the engine trusts the loaded model, not this flag.
    pub expected_support: bool,
}

impl ThinkPolicy {
    pub const DISABLED: ThinkPolicy = ThinkPolicy {
        budget: None,
        expected_support: false,
    };
}

/// Per-family behavioral quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quirks(pub u32);

impl Quirks {
    /// Leaks ChatML control tokens (`<|im_start|>`…) into text output.
    pub const CHATML_LEAKAGE: Quirks = Quirks(1 << 0);
    /// Emits `<think>` blocks as plain text rather than a reasoning channel.
    pub const INLINE_THINK_TAGS: Quirks = Quirks(1 << 1);
    /// Writes tool calls as pythonic `name(arg=…)` text.
    pub const PYTHONIC_TOOL_CALLS: Quirks = Quirks(1 << 2);
    /// Ignores the system role; system content must be folded into the first
    /// user turn.
    pub const NO_SYSTEM_ROLE: Quirks = Quirks(1 << 3);

    pub fn contains(self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Quirks) -> Quirks {
        Quirks(self.0 | other.0)
    }
}

/// Everything the runtime needs to know about a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub family: Family,
    pub tier: Tier,
    pub sampling: SamplingParams,
    pub think: ThinkPolicy,
    /// `None` = unlimited.
    pub max_tools_per_iter: Option<u8>,
    /// Whether grammar-constrained tool-call generation is preferred for this
    /// family.  The engine may still disable grammar for the session when a
    /// constrained generation stalls.
    pub grammar_preferred: bool,
    pub effective_ctx: u32,
    pub few_shot_count: u8,
    pub quirks: Quirks,
}

impl ModelProfile {
    /// Conservative base defaults used for unrecognized families.
    pub fn base_defaults() -> Self {
        Self {
            family: Family::Unknown,
            tier: Tier::Tiny,
            sampling: SamplingParams::default(),
            think: ThinkPolicy::DISABLED,
            max_tools_per_iter: Tier::Tiny.max_tools_per_iter(),
            grammar_preferred: false,
            effective_ctx: Tier::Tiny.effective_ctx_ceiling(),
            few_shot_count: Tier::Tiny.few_shot_count(),
            quirks: Quirks::default(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
