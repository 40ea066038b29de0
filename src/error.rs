//! Crate-level error taxonomy.
//!
//! Unit-level failures (budget, service) are recorded against their unit and
//! never abort sibling units; state-store and input failures are fatal to
//! the phase or run. `classify` separates transient from permanent causes
//! so callers can decide whether a retry is worthwhile.

use thiserror::Error;

use crate::executor::ServiceError;
use crate::state::{Phase, StateError, StateStoreError};

/// Coarse error classification used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth retrying: timeouts, rate limits, transient server errors.
    Transient,
    /// Retrying cannot help: bad input, corrupt state, auth failures.
    Fatal,
}

/// Errors surfaced by the pipeline engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or missing prior-phase data; aborts the phase before
    /// dispatch.
    #[error("invalid input for {phase} phase: {reason}")]
    Input { phase: Phase, reason: String },

    /// A unit's payload still exceeds the context limit after chunking.
    #[error("unit {unit} exceeds the context window even after chunking (~{tokens} tokens)")]
    Budget { unit: String, tokens: u64 },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Fatal service errors recurred across enough units that continuing
    /// would only burn retry budget.
    #[error(
        "{count} units hit fatal service errors in the {phase} phase (threshold {threshold}); aborting"
    )]
    FatalErrorStorm {
        phase: Phase,
        count: u32,
        threshold: u32,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Classify this error for retry decisions.
    pub fn classify(&self) -> ErrorCategory {
        match self {
            PipelineError::Service(err) if err.is_retryable() => ErrorCategory::Transient,
            PipelineError::Cancelled => ErrorCategory::Transient,
            _ => ErrorCategory::Fatal,
        }
    }
}
