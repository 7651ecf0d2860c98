
use serde::{Deserialize, Serialize};

use tessera_core::config::LinkAnalysisConfig;

/// Which bonuses a strength computation applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrengthOptions {
    #[serde(default)]
    pub frequency: bool,
    #[serde(default)]
    pub semantic: bool,
    #[serde(default)]
    pub context: bool,
}

impl StrengthOptions {
    pub fn all() -> Self {
        Self {
            frequency: true,
            semantic: true,
            context: true,
        }
    }
}

/// Observed signals the bonuses are computed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrengthSignals {
    /// Times the link was traversed.
    #[serde(default)]
    pub interaction_count: u64,
    /// Similarity of the linked entities, in [0, 1].
    #[serde(default)]
    pub semantic_similarity: f64,
    /// Relevance of the link's node context, in [0, 1].
    #[serde(default)]
    pub context_relevance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrengthBreakdown {
    pub base: f64,
    pub frequency_bonus: f64,
    pub semantic_bonus: f64,
    pub context_bonus: f64,
    /// `base` plus bonuses, never above 1.0.
    pub final_strength: f64,
}

/// Combines a stored base strength with bounded bonuses.
#[derive(Debug, Clone, Copy)]
pub struct StrengthScorer {
    frequency_cap: f64,
    semantic_cap: f64,
    context_cap: f64,
}

impl StrengthScorer {
    pub fn new(config: &LinkAnalysisConfig) -> Self {
        Self {
            frequency_cap: config.frequency_bonus_cap.max(0.0),
            semantic_cap: config.semantic_bonus_cap.max(0.0),
            context_cap: config.context_bonus_cap.max(0.0),
        }
    }

    pub fn score(
        &self,
        base: f64,
        signals: &StrengthSignals,
        options: StrengthOptions,
    ) -> StrengthBreakdown {
        let base = clamp_unit(base);

        // Saturates towards the cap as interactions accumulate.
        let frequency_bonus = if options.frequency {
            self.frequency_cap * (1.0 - (-(signals.interaction_count as f64) / 10.0).exp())
        } else {
            0.0
        };
        let semantic_bonus = if options.semantic {
            self.semantic_cap * clamp_unit(signals.semantic_similarity)
        } else {
            0.0
        };
        let context_bonus = if options.context {
            self.context_cap * clamp_unit(signals.context_relevance)
        } else {
            0.0
        };

        let final_strength = (base + frequency_bonus + semantic_bonus + context_bonus).min(1.0);
        StrengthBreakdown {
            base,
            frequency_bonus,
            semantic_bonus,
            context_bonus,
            final_strength,
        }
    }
}

impl Default for StrengthScorer {
    fn default() -> Self {
        Self::new(&LinkAnalysisConfig::default())
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
