//! Run configuration surface consumed by the pipeline engine.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::{ModelConfig, DEFAULT_SAFETY_MARGIN};
use crate::error::PipelineError;
use crate::executor::ExecutorConfig;
use crate::state::Phase;

/// How previously failed units are treated on resume.
///
/// With `retry_failed` (the default), failed units are re-dispatched while
/// completed units stay untouched. `clear_errors` resets failed units to
/// pending before the resume pass. `skip_failed` leaves failed units as-is
/// and lets the phase finish around them. When no flag is set, failed units
/// stay failed and the phase is recorded failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryControl {
    pub skip_failed: bool,
    pub retry_failed: bool,
    pub clear_errors: bool,
}

impl Default for RetryControl {
    fn default() -> Self {
        Self {
            skip_failed: false,
            retry_failed: true,
            clear_errors: false,
        }
    }
}

/// Chunk-splitting parameters for oversized chapter payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Token ceiling per chunk before the prompt envelope is added.
    pub max_chunk_tokens: u64,
    /// Characters carried over across a chunk boundary.
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 8_000,
            overlap_chars: 400,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum unit jobs in flight during an execute step. Minimum 1.
    pub max_concurrency: usize,
    /// Retry ceiling for retryable service errors.
    pub max_retries: u32,
    /// Initial retry backoff in milliseconds; doubles per retry.
    pub retry_timeout_ms: u64,
    /// Per-attempt service-call timeout in milliseconds.
    pub job_timeout_ms: u64,
    /// Usable fraction of the model context window (0, 1].
    pub token_safety_margin: f64,
    pub retry_control: RetryControl,
    /// Phases whose completed units are regenerated from scratch.
    pub force_regenerate: BTreeSet<Phase>,
    pub chunking: ChunkingConfig,
    /// Fatal service errors tolerated within one phase before the phase
    /// aborts with a run-level error instead of burning retry budget
    /// unit by unit.
    pub fatal_error_threshold: u32,
    /// Whether a phase with leftover failed units may still be recorded
    /// completed under `skip_failed`.
    pub tolerate_partial_failure: bool,
    /// Target model for budgeting and service calls.
    pub model: ModelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 3,
            retry_timeout_ms: 1_000,
            job_timeout_ms: 120_000,
            token_safety_margin: DEFAULT_SAFETY_MARGIN,
            retry_control: RetryControl::default(),
            force_regenerate: BTreeSet::new(),
            chunking: ChunkingConfig::default(),
            fatal_error_threshold: 3,
            tolerate_partial_failure: false,
            model: ModelConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a TOML file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_token_safety_margin(mut self, margin: f64) -> Self {
        self.token_safety_margin = margin;
        self
    }

    pub fn with_retry_control(mut self, control: RetryControl) -> Self {
        self.retry_control = control;
        self
    }

    /// Force-regenerate every unit of `phase`, completed or not.
    pub fn with_force_regenerate(mut self, phase: Phase) -> Self {
        self.force_regenerate.insert(phase);
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_fatal_error_threshold(mut self, threshold: u32) -> Self {
        self.fatal_error_threshold = threshold;
        self
    }

    pub fn with_tolerate_partial_failure(mut self, tolerate: bool) -> Self {
        self.tolerate_partial_failure = tolerate;
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Whether `phase` is flagged for forced regeneration.
    pub fn forces(&self, phase: Phase) -> bool {
        self.force_regenerate.contains(&phase)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_concurrency < 1 {
            return Err(PipelineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if !(self.token_safety_margin > 0.0 && self.token_safety_margin <= 1.0) {
            return Err(PipelineError::Config(format!(
                "token_safety_margin must be in (0, 1], got {}",
                self.token_safety_margin
            )));
        }
        if self.chunking.max_chunk_tokens == 0 {
            return Err(PipelineError::Config(
                "chunking.max_chunk_tokens must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Executor settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new()
            .with_max_concurrency(self.max_concurrency)
            .with_max_retries(self.max_retries)
            .with_retry_timeout(self.retry_timeout())
            .with_job_timeout(self.job_timeout())
    }
}
