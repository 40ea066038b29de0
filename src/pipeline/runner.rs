//! The resumable engine loop.
//!
//! [`PipelineRunner`] drives the four phases in order, each through its five
//! sub-phases (plan, estimate, prepare, execute, save). State is persisted
//! after every unit resolves, so an interrupted run resumes from the last
//! durable point without repeating completed service calls.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::book::ParsedBook;
use crate::budget::TokenEstimator;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::{EventBus, EventReceiver, ProgressEvent, StatsSnapshot};
use crate::executor::{Executor, Job, JobOutcome, ServiceClient};
use crate::state::{
    Phase, PipelineState, StateStore, Status, SubPhase, TocEntry, TokenStats,
};

use super::work;

/// Cloneable handle for cancelling a running pipeline from another task.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Request cancellation. In-flight service calls are abandoned, their
    /// units roll back to pending, and the run returns
    /// [`PipelineError::Cancelled`] after a final save.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Outcome of one phase within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub status: Status,
    pub units_completed: usize,
    pub units_failed: usize,
    pub tokens_used: u64,
}

/// Final report for one `run` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub phases: Vec<PhaseSummary>,
    pub token_stats: TokenStats,
    /// True when every phase finished completed; false when a phase failed
    /// or left downstream phases blocked.
    pub completed: bool,
}

/// Orchestrates a full book-processing run against a [`ServiceClient`].
pub struct PipelineRunner {
    config: PipelineConfig,
    store: StateStore,
    estimator: TokenEstimator,
    bus: Arc<EventBus>,
    client: Arc<dyn ServiceClient>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl PipelineRunner {
    pub fn new(
        config: PipelineConfig,
        store: StateStore,
        client: Arc<dyn ServiceClient>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        Ok(Self {
            config,
            store,
            estimator: TokenEstimator::default(),
            bus: Arc::new(EventBus::new()),
            client,
            cancel_tx: Arc::new(cancel_tx),
        })
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Subscribe to progress events. Safe to call before or during a run.
    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    /// Handle for cancelling the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Drive every phase of the pipeline for `book`, resuming from persisted
    /// state when present. Starting a run clears any prior cancellation.
    pub async fn run(&mut self, book: &ParsedBook) -> Result<RunReport, PipelineError> {
        let _ = self.cancel_tx.send(false);

        let mut state = match self.store.load()? {
            Some(state) => state,
            None => PipelineState::new(
                &book.metadata.source_file,
                &book.metadata.title,
                book.metadata.total_pages,
            ),
        };

        let mut phases = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            if *self.cancel_tx.borrow() {
                self.store.save(&mut state)?;
                return Err(PipelineError::Cancelled);
            }

            let already_completed =
                state.phase(phase).map(|p| p.status) == Some(Status::Completed);
            if already_completed && !self.config.forces(phase) {
                debug!(%phase, "phase already completed, skipping");
                phases.push(self.summarize(phase, &state));
                continue;
            }

            if !state.predecessors_completed(phase) {
                warn!(%phase, "predecessor phase not completed, leaving pending");
                phases.push(self.summarize(phase, &state));
                continue;
            }

            let summary = self.run_phase(phase, book, &mut state).await?;
            phases.push(summary);
        }

        let completed = phases.iter().all(|p| p.status == Status::Completed);
        Ok(RunReport {
            phases,
            token_stats: state.token_stats,
            completed,
        })
    }

    async fn run_phase(
        &mut self,
        phase: Phase,
        book: &ParsedBook,
        state: &mut PipelineState,
    ) -> Result<PhaseSummary, PipelineError> {
        info!(%phase, "starting phase");
        let forced = self.config.forces(phase);
        {
            let phase_state = state.phase_mut(phase);
            if forced {
                info!(%phase, "force-regenerating phase");
                for unit in phase_state.units.values_mut() {
                    unit.force_reset();
                }
                phase_state.sub_phases = SubPhase::ALL
                    .iter()
                    .map(|sp| (*sp, Status::Pending))
                    .collect();
                phase_state.current_sub_phase = SubPhase::Plan;
            }
            // Units a crash left in progress roll back to pending.
            for unit in phase_state.units.values_mut() {
                unit.cancel();
            }
            if self.config.retry_control.clear_errors {
                for unit in phase_state.units.values_mut() {
                    unit.clear_error();
                }
            }
            phase_state.status = Status::InProgress;
        }
        self.store.save(state)?;

        // Plan: decide the full unit set. The plan is authoritative: units
        // left over from an earlier plan whose keys are no longer in the
        // set (extract can switch between element and chapter keys when
        // analyze is regenerated) are dropped so they never reach prepare.
        let keys = work::plan_units(phase, book, state)?;
        {
            let phase_state = state.phase_mut(phase);
            let before = phase_state.units.len();
            phase_state
                .units
                .retain(|key, _| keys.iter().any(|k| k == key));
            let stale = before - phase_state.units.len();
            if stale > 0 {
                warn!(%phase, stale, "dropped units absent from the current plan");
            }
            if !phase_state.sub_phase_completed(SubPhase::Plan) {
                phase_state.begin_sub_phase(SubPhase::Plan);
            }
            for key in &keys {
                phase_state.ensure_unit(key);
            }
            phase_state.complete_sub_phase(SubPhase::Plan);
        }
        self.store.save(state)?;
        self.bus.publish(ProgressEvent::PhaseStarted {
            phase,
            total_units: keys.len(),
        });

        // Estimate: project usage before spending anything.
        if !self.sub_phase_done(phase, state, SubPhase::Estimate) {
            state.phase_mut(phase).begin_sub_phase(SubPhase::Estimate);
            if phase != Phase::Parse {
                let projections = work::project_units(
                    phase,
                    &keys,
                    book,
                    state,
                    &self.config,
                    &self.estimator,
                );
                let input_tokens: u64 = projections.iter().map(|p| p.input_tokens).sum();
                let cost: f64 = projections.iter().map(|p| p.cost).sum();
                let chunked = projections.iter().filter(|p| p.needs_chunking).count();
                info!(
                    %phase,
                    units = keys.len(),
                    projected_input_tokens = input_tokens,
                    projected_cost = cost,
                    chunked_units = chunked,
                    "projected phase budget"
                );
            }
            state.phase_mut(phase).complete_sub_phase(SubPhase::Estimate);
            self.store.save(state)?;
        }

        if phase == Phase::Parse {
            self.run_parse_units(book, state)?;
        } else {
            self.prepare_and_execute(phase, book, state).await?;
        }

        // Save: phase-specific assembly, then finalize.
        state.phase_mut(phase).begin_sub_phase(SubPhase::Save);
        match phase {
            Phase::Parse => {
                if state.table_of_contents.is_empty() {
                    let toc = self.build_toc(book);
                    state.set_table_of_contents(toc)?;
                }
            }
            Phase::Extract => {
                state.elements = Some(work::assemble_element_catalog(state));
            }
            Phase::Analyze | Phase::Illustrate => {}
        }
        let status = state
            .phase_mut(phase)
            .try_complete(phase, self.config.tolerate_partial_failure)?;
        state.phase_mut(phase).complete_sub_phase(SubPhase::Save);
        self.store.save(state)?;

        let summary = self.summarize(phase, state);
        self.bus.publish(ProgressEvent::PhaseCompleted {
            phase,
            status,
            units_completed: summary.units_completed,
            units_failed: summary.units_failed,
        });
        info!(%phase, ?status, units = summary.units_completed, "phase finished");
        Ok(summary)
    }

    /// Parse units resolve locally: the chapters are already in hand, so
    /// each unit's result is its table-of-contents descriptor. No service
    /// calls, no retries.
    fn run_parse_units(
        &self,
        book: &ParsedBook,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        let phase_state = state.phase_mut(Phase::Parse);
        phase_state.begin_sub_phase(SubPhase::Prepare);
        phase_state.complete_sub_phase(SubPhase::Prepare);
        phase_state.begin_sub_phase(SubPhase::Execute);

        for chapter in &book.chapters {
            let key = chapter.unit_key();
            let unit = phase_state.ensure_unit(&key);
            if unit.status == Status::Completed {
                continue;
            }
            let tokens = chapter.effective_tokens(&self.estimator);
            let descriptor = json!({
                "number": chapter.number,
                "title": chapter.title,
                "pages": { "first": chapter.pages.first, "last": chapter.pages.last },
                "token_count": tokens,
            });
            unit.begin(&key)?;
            unit.complete(&key, descriptor, 0)?;
            self.bus.publish(ProgressEvent::UnitCompleted {
                phase: Phase::Parse,
                unit: key,
                tokens_used: 0,
            });
        }

        phase_state.complete_sub_phase(SubPhase::Execute);
        self.store.save(state)?;
        Ok(())
    }

    /// Prepare payloads for every dispatchable unit and stream them through
    /// the executor, persisting after each outcome.
    async fn prepare_and_execute(
        &mut self,
        phase: Phase,
        book: &ParsedBook,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        state.phase_mut(phase).begin_sub_phase(SubPhase::Prepare);

        let dispatch = self.dispatchable_units(phase, state);
        let mut jobs = Vec::with_capacity(dispatch.len());
        for key in &dispatch {
            let prepared =
                work::prepare_unit(phase, key, book, state, &self.config, &self.estimator)?;
            if prepared.oversized {
                let reason = PipelineError::Budget {
                    unit: key.clone(),
                    tokens: prepared.approx_tokens,
                }
                .to_string();
                warn!(%phase, unit = %key, %reason, "unit failed budget check");
                state
                    .phase_mut(phase)
                    .unit_mut(phase, key)?
                    .fail(key, &reason, 0)?;
                self.bus.publish(ProgressEvent::UnitFailed {
                    phase,
                    unit: key.clone(),
                    error: reason,
                });
                continue;
            }
            jobs.push(Job::new(
                key.clone(),
                prepared.prompts,
                self.config.model.clone(),
            ));
        }

        for job in &jobs {
            state
                .phase_mut(phase)
                .unit_mut(phase, &job.unit)?
                .begin(&job.unit)?;
            self.bus.publish(ProgressEvent::UnitStarted {
                phase,
                unit: job.unit.clone(),
            });
        }
        state.phase_mut(phase).complete_sub_phase(SubPhase::Prepare);
        self.store.save(state)?;

        state.phase_mut(phase).begin_sub_phase(SubPhase::Execute);
        let mut fatal_errors = 0u32;
        let mut storm = false;

        if !jobs.is_empty() {
            let executor = Executor::new(self.config.executor_config());
            let (outcome_tx, mut outcome_rx) = mpsc::channel(jobs.len());
            let cancel_rx = self.cancel_tx.subscribe();
            let client = self.client.clone();
            let batch = jobs;
            let executor_task = tokio::spawn(async move {
                executor.run(batch, client, cancel_rx, outcome_tx).await;
            });

            while let Some(outcome) = outcome_rx.recv().await {
                self.apply_outcome(phase, outcome, state, &mut fatal_errors)?;
                if !storm
                    && self.config.fatal_error_threshold > 0
                    && fatal_errors >= self.config.fatal_error_threshold
                {
                    storm = true;
                    warn!(
                        %phase,
                        fatal_errors,
                        threshold = self.config.fatal_error_threshold,
                        "fatal error threshold reached, cancelling remaining units"
                    );
                    let _ = self.cancel_tx.send(true);
                }
                self.store.save(state)?;
            }

            if executor_task.await.is_err() {
                warn!(%phase, "executor task aborted unexpectedly");
            }
        }

        if storm {
            let err = PipelineError::FatalErrorStorm {
                phase,
                count: fatal_errors,
                threshold: self.config.fatal_error_threshold,
            };
            state.phase_mut(phase).status = Status::Failed;
            self.store.save(state)?;
            self.bus.publish(ProgressEvent::RunError {
                message: err.to_string(),
            });
            return Err(err);
        }
        if *self.cancel_tx.borrow() {
            self.store.save(state)?;
            self.bus.publish(ProgressEvent::RunError {
                message: "run cancelled".to_string(),
            });
            return Err(PipelineError::Cancelled);
        }

        state.phase_mut(phase).complete_sub_phase(SubPhase::Execute);
        self.store.save(state)?;
        Ok(())
    }

    /// Units that get dispatched this pass, honoring retry controls.
    /// Completed units are never re-dispatched here; forced regeneration
    /// already reset them to pending before planning.
    fn dispatchable_units(&self, phase: Phase, state: &PipelineState) -> Vec<String> {
        let controls = self.config.retry_control;
        let Some(phase_state) = state.phase(phase) else {
            return Vec::new();
        };
        phase_state
            .units
            .iter()
            .filter(|(_, unit)| match unit.status {
                Status::Completed => false,
                Status::Failed => controls.retry_failed && !controls.skip_failed,
                Status::Pending | Status::InProgress => true,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn apply_outcome(
        &self,
        phase: Phase,
        outcome: JobOutcome,
        state: &mut PipelineState,
        fatal_errors: &mut u32,
    ) -> Result<(), PipelineError> {
        match outcome {
            JobOutcome::Completed {
                unit,
                result,
                tokens,
                attempts,
            } => {
                let cost = self.estimator.estimate_cost(
                    tokens.input_tokens,
                    tokens.output_tokens,
                    &self.config.model,
                );
                state
                    .phase_mut(phase)
                    .unit_mut(phase, &unit)?
                    .complete(&unit, result, tokens.total())?;
                state.add_token_stats(tokens.input_tokens, tokens.output_tokens, cost);
                debug!(%phase, unit = %unit, attempts, tokens = tokens.total(), "unit completed");
                self.bus.publish(ProgressEvent::UnitCompleted {
                    phase,
                    unit,
                    tokens_used: tokens.total(),
                });
                self.publish_stats(phase, state);
            }
            JobOutcome::Failed {
                unit,
                error,
                tokens,
                attempts,
            } => {
                if !error.is_retryable() {
                    *fatal_errors += 1;
                }
                let cost = self.estimator.estimate_cost(
                    tokens.input_tokens,
                    tokens.output_tokens,
                    &self.config.model,
                );
                state
                    .phase_mut(phase)
                    .unit_mut(phase, &unit)?
                    .fail(&unit, error.to_string(), tokens.total())?;
                state.add_token_stats(tokens.input_tokens, tokens.output_tokens, cost);
                warn!(%phase, unit = %unit, attempts, %error, "unit failed");
                self.bus.publish(ProgressEvent::UnitFailed {
                    phase,
                    unit,
                    error: error.to_string(),
                });
                self.publish_stats(phase, state);
            }
            JobOutcome::Cancelled { unit } => {
                debug!(%phase, unit = %unit, "unit cancelled, rolled back to pending");
                state.phase_mut(phase).unit_mut(phase, &unit)?.cancel();
            }
        }
        Ok(())
    }

    fn sub_phase_done(&self, phase: Phase, state: &PipelineState, sub_phase: SubPhase) -> bool {
        state
            .phase(phase)
            .map_or(false, |p| p.sub_phase_completed(sub_phase))
    }

    fn publish_stats(&self, phase: Phase, state: &PipelineState) {
        let Some(phase_state) = state.phase(phase) else {
            return;
        };
        self.bus.publish(ProgressEvent::Stats(StatsSnapshot {
            tokens: state.token_stats,
            units_completed: phase_state.completed_units(),
            units_failed: phase_state.failed_units(),
        }));
    }

    fn build_toc(&self, book: &ParsedBook) -> Vec<TocEntry> {
        book.chapters
            .iter()
            .map(|chapter| TocEntry {
                number: chapter.number,
                title: chapter.title.clone(),
                pages: chapter.pages,
                token_count: chapter.effective_tokens(&self.estimator),
            })
            .collect()
    }

    fn summarize(&self, phase: Phase, state: &PipelineState) -> PhaseSummary {
        match state.phase(phase) {
            Some(phase_state) => PhaseSummary {
                phase,
                status: phase_state.status,
                units_completed: phase_state.completed_units(),
                units_failed: phase_state.failed_units(),
                tokens_used: phase_state.units.values().map(|u| u.tokens_used).sum(),
            },
            None => PhaseSummary {
                phase,
                status: Status::Pending,
                units_completed: 0,
                units_failed: 0,
                tokens_used: 0,
            },
        }
    }
}
