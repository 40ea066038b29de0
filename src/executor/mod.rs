//! Bounded-parallel dispatch of unit-level jobs against an external service.
//!
//! The executor owns no business logic: it takes prepared jobs, runs at most
//! `max_concurrency` of them at once, retries retryable failures with
//! exponential backoff, bounds each attempt with a timeout, and streams one
//! outcome per job back to the caller as it resolves. Cancellation is
//! cooperative through a `watch` channel: new dispatch stops immediately,
//! and a cancelled job never reports success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use crate::budget::ModelConfig;

/// Structured failure from the service collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Transient: timeouts, rate limits, 5xx. Retried with backoff.
    #[error("retryable service error: {reason}")]
    Retryable { reason: String },

    /// Permanent: malformed request, authentication, configuration. Fails
    /// the unit immediately without consuming retry budget.
    #[error("fatal service error: {reason}")]
    Fatal { reason: String },
}

impl ServiceError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Token usage reported by the service for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Successful service response: an opaque payload plus usage counts.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub content: Value,
    pub tokens: TokenUsage,
}

/// Call contract for the completion / image-generation collaborator. The
/// engine is agnostic to which concrete service answers it.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        model: &ModelConfig,
    ) -> Result<ServiceResponse, ServiceError>;
}

/// One prepared unit of work. A chunked unit carries several prompts that
/// run sequentially within the job; their payloads are combined into one
/// result.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unit key this job resolves (chapter number or element name).
    pub unit: String,
    pub prompts: Vec<String>,
    pub model: ModelConfig,
}

impl Job {
    pub fn new(unit: impl Into<String>, prompts: Vec<String>, model: ModelConfig) -> Self {
        Self {
            unit: unit.into(),
            prompts,
            model,
        }
    }
}

/// Terminal result of one job, streamed to the caller as it resolves.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        unit: String,
        result: Value,
        tokens: TokenUsage,
        attempts: u32,
    },
    Failed {
        unit: String,
        error: ServiceError,
        /// Usage accumulated before the terminal failure (partial chunks).
        tokens: TokenUsage,
        attempts: u32,
    },
    Cancelled {
        unit: String,
    },
}

impl JobOutcome {
    pub fn unit(&self) -> &str {
        match self {
            JobOutcome::Completed { unit, .. }
            | JobOutcome::Failed { unit, .. }
            | JobOutcome::Cancelled { unit } => unit,
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum jobs in flight at any instant. Minimum 1.
    pub max_concurrency: usize,
    /// Retry ceiling per service call for retryable failures.
    pub max_retries: u32,
    /// Initial backoff delay; doubles per retry.
    pub retry_timeout: Duration,
    /// Per-attempt timeout for one service call.
    pub job_timeout: Duration,
    /// When true, cancellation abandons in-flight calls; when false,
    /// the current attempt is allowed to finish but nothing further runs.
    pub abandon_in_flight_on_cancel: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 3,
            retry_timeout: Duration::from_millis(1_000),
            job_timeout: Duration::from_secs(120),
            abandon_in_flight_on_cancel: true,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_abandon_in_flight_on_cancel(mut self, abandon: bool) -> Self {
        self.abandon_in_flight_on_cancel = abandon;
        self
    }
}

/// Bounded-parallel job executor.
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Run `jobs` with bounded parallelism, streaming a [`JobOutcome`] per
    /// job through `outcome_tx` as each resolves. Jobs start in submission
    /// order; completion order is unspecified. Returns once every job has
    /// resolved or been reported cancelled.
    pub async fn run(
        &self,
        jobs: Vec<Job>,
        client: Arc<dyn ServiceClient>,
        cancel_rx: watch::Receiver<bool>,
        outcome_tx: mpsc::Sender<JobOutcome>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            if *cancel_rx.borrow() {
                let _ = outcome_tx
                    .send(JobOutcome::Cancelled { unit: job.unit })
                    .await;
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if *cancel_rx.borrow() {
                drop(permit);
                let _ = outcome_tx
                    .send(JobOutcome::Cancelled { unit: job.unit })
                    .await;
                continue;
            }

            let client = client.clone();
            let config = self.config.clone();
            let cancel = cancel_rx.clone();
            let tx = outcome_tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = run_job(job, client, &config, cancel).await;
                let _ = tx.send(outcome).await;
            }));
        }

        futures::future::join_all(handles).await;
    }
}

/// Drive one job to a terminal outcome: every prompt in order, each with
/// its own retry budget.
async fn run_job(
    job: Job,
    client: Arc<dyn ServiceClient>,
    config: &ExecutorConfig,
    mut cancel: watch::Receiver<bool>,
) -> JobOutcome {
    let mut tokens = TokenUsage::default();
    let mut attempts = 0u32;
    let mut parts: Vec<Value> = Vec::with_capacity(job.prompts.len());

    for prompt in &job.prompts {
        match call_with_retry(&job, prompt, client.as_ref(), config, &mut cancel, &mut attempts)
            .await
        {
            CallResult::Ok(response) => {
                tokens.add(response.tokens);
                parts.push(response.content);
            }
            CallResult::Err(error) => {
                return JobOutcome::Failed {
                    unit: job.unit,
                    error,
                    tokens,
                    attempts,
                };
            }
            CallResult::Cancelled => {
                return JobOutcome::Cancelled { unit: job.unit };
            }
        }

        if *cancel.borrow() {
            // Remaining prompts are skipped; the unit stays incomplete.
            return JobOutcome::Cancelled { unit: job.unit };
        }
    }

    let result = combine_parts(parts);
    JobOutcome::Completed {
        unit: job.unit,
        result,
        tokens,
        attempts,
    }
}

enum CallResult {
    Ok(ServiceResponse),
    Err(ServiceError),
    Cancelled,
}

async fn call_with_retry(
    job: &Job,
    prompt: &str,
    client: &dyn ServiceClient,
    config: &ExecutorConfig,
    cancel: &mut watch::Receiver<bool>,
    attempts: &mut u32,
) -> CallResult {
    let mut retries_used = 0u32;
    let mut backoff = config.retry_timeout;

    loop {
        *attempts += 1;

        let attempt = tokio::time::timeout(config.job_timeout, client.complete(prompt, &job.model));
        let result = if config.abandon_in_flight_on_cancel {
            tokio::select! {
                result = attempt => Some(result),
                _ = cancelled(cancel) => None,
            }
        } else {
            Some(attempt.await)
        };

        let error = match result {
            None => return CallResult::Cancelled,
            Some(Ok(Ok(response))) => return CallResult::Ok(response),
            Some(Ok(Err(err))) if !err.is_retryable() => {
                warn!(unit = %job.unit, error = %err, "fatal service error");
                return CallResult::Err(err);
            }
            Some(Ok(Err(err))) => err,
            Some(Err(_elapsed)) => ServiceError::retryable(format!(
                "service call timed out after {:?}",
                config.job_timeout
            )),
        };

        if retries_used >= config.max_retries {
            return CallResult::Err(error);
        }
        retries_used += 1;
        debug!(
            unit = %job.unit,
            retry = retries_used,
            delay_ms = backoff.as_millis() as u64,
            error = %error,
            "retrying after transient failure"
        );

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancelled(cancel) => return CallResult::Cancelled,
        }
        backoff = backoff.saturating_mul(2);
    }
}

/// Resolve once the cancel flag flips to true.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            // Sender gone: treat as never-cancelled.
            std::future::pending::<()>().await;
        }
    }
}

/// Fold chunk payloads into the unit's single opaque result.
fn combine_parts(mut parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        Value::Array(parts)
    }
}
