//! Target model description used for budgeting decisions.

use serde::{Deserialize, Serialize};

/// Context-window size and pricing of the model a phase talks to.
///
/// Rates are expressed per million tokens; a rate of zero means "unpriced"
/// and yields a zero cost projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier, kept for reporting only.
    pub name: String,
    /// Maximum combined input+output tokens the service accepts per call.
    pub context_length: u64,
    /// Output tokens reserved for the completion when checking the window.
    pub max_output_tokens: u64,
    /// Cost per million input tokens.
    pub input_cost_per_mtok: f64,
    /// Cost per million output tokens.
    pub output_cost_per_mtok: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            context_length: 128_000,
            max_output_tokens: 4_096,
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
        }
    }
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, context_length: u64) -> Self {
        Self {
            name: name.into(),
            context_length,
            ..Self::default()
        }
    }

    /// Set the reserved output token count.
    pub fn with_max_output_tokens(mut self, tokens: u64) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Set per-million-token pricing.
    pub fn with_pricing(mut self, input_per_mtok: f64, output_per_mtok: f64) -> Self {
        self.input_cost_per_mtok = input_per_mtok;
        self.output_cost_per_mtok = output_per_mtok;
        self
    }

    /// Whether any pricing is configured.
    pub fn is_priced(&self) -> bool {
        self.input_cost_per_mtok > 0.0 || self.output_cost_per_mtok > 0.0
    }
}
