//! Token and cost estimation.
//!
//! Exact token counts are only known after a service call, so planning and
//! budget checks rely on a deterministic approximation. The estimator is
//! deliberately conservative: over-estimating wastes a little headroom,
//! under-estimating would let an oversized prompt reach the service.

use serde::{Deserialize, Serialize};

use super::model::ModelConfig;

/// Fraction of the context window treated as the usable ceiling. The
/// remaining headroom absorbs estimation error.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.9;

/// Conservative token estimator.
///
/// Estimates both by character ratio (~3.5 chars per token) and by word
/// count (~1.3 tokens per word) and takes the larger of the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEstimator {
    /// Characters per token for the character-based estimate.
    chars_per_token: f64,
    /// Tokens per word for the word-based estimate.
    tokens_per_word: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 3.5,
            tokens_per_word: 1.3,
        }
    }
}

impl TokenEstimator {
    /// Create an estimator with a custom character ratio. Values below 1.0
    /// are clamped; a smaller ratio means a more conservative estimate.
    pub fn with_chars_per_token(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1.0),
            ..Self::default()
        }
    }

    /// Estimate the token count of `text`.
    ///
    /// Deterministic and monotone in the input length: appending text never
    /// lowers the estimate.
    pub fn estimate(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let by_chars = (text.chars().count() as f64 / self.chars_per_token).ceil() as u64;
        let by_words = (text.split_whitespace().count() as f64 * self.tokens_per_word).ceil() as u64;
        by_chars.max(by_words)
    }

    /// Project the monetary cost of a call given per-million-token rates.
    /// Unset (zero) rates contribute nothing.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64, model: &ModelConfig) -> f64 {
        let input = input_tokens as f64 / 1_000_000.0 * model.input_cost_per_mtok;
        let output = output_tokens as f64 / 1_000_000.0 * model.output_cost_per_mtok;
        input + output
    }

    /// Whether a payload of `input_tokens` plus `reserved_output_tokens`
    /// would overflow the model's usable context window.
    ///
    /// This is the single choke point that keeps oversized prompts away from
    /// the external service; `safety_margin` shrinks the window to leave
    /// room for estimation error.
    pub fn will_exceed_limit(
        &self,
        input_tokens: u64,
        reserved_output_tokens: u64,
        model: &ModelConfig,
        safety_margin: f64,
    ) -> bool {
        let ceiling = (model.context_length as f64 * safety_margin.clamp(0.0, 1.0)) as u64;
        input_tokens.saturating_add(reserved_output_tokens) > ceiling
    }
}
