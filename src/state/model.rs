//! Persisted representation of pipeline progress.
//!
//! [`PipelineState`] is the root aggregate, one per book-processing run.
//! All mutation goes through a closed set of typed operations that validate
//! status transitions before applying them; nothing patches the document
//! free-form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::book::PageRange;

/// Schema version written by this build. [`crate::state::StateStore`]
/// migrates older documents forward on load.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// The four ordered pipeline phases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Parse,
    Analyze,
    Extract,
    Illustrate,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 4] = [Phase::Parse, Phase::Analyze, Phase::Extract, Phase::Illustrate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Parse => "parse",
            Phase::Analyze => "analyze",
            Phase::Extract => "extract",
            Phase::Illustrate => "illustrate",
        }
    }

    /// The phase that must complete before this one starts.
    pub fn predecessor(&self) -> Option<Phase> {
        match self {
            Phase::Parse => None,
            Phase::Analyze => Some(Phase::Parse),
            Phase::Extract => Some(Phase::Analyze),
            Phase::Illustrate => Some(Phase::Extract),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five ordered sub-phases every phase runs through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubPhase {
    Plan,
    Estimate,
    Prepare,
    Execute,
    Save,
}

impl SubPhase {
    /// All sub-phases in execution order.
    pub const ALL: [SubPhase; 5] = [
        SubPhase::Plan,
        SubPhase::Estimate,
        SubPhase::Prepare,
        SubPhase::Execute,
        SubPhase::Save,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubPhase::Plan => "plan",
            SubPhase::Estimate => "estimate",
            SubPhase::Prepare => "prepare",
            SubPhase::Execute => "execute",
            SubPhase::Save => "save",
        }
    }
}

impl std::fmt::Display for SubPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status shared by phases, sub-phases, and units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Status {
    /// Whether the work reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

/// Errors raised by state mutation operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid status transition for unit {unit}: {from:?} -> {to:?}")]
    InvalidTransition {
        unit: String,
        from: Status,
        to: Status,
    },
    #[error("phase {phase} cannot complete: {open} units still pending or in progress")]
    PhaseNotDone { phase: Phase, open: usize },
    #[error("table of contents is write-once and already recorded")]
    TocAlreadySet,
    #[error("unknown unit {unit} in phase {phase}")]
    UnknownUnit { phase: Phase, unit: String },
}

/// One chapter descriptor in the write-once table of contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub number: u32,
    pub title: String,
    pub pages: PageRange,
    pub token_count: u64,
}

/// Running token/cost totals for the whole run. Monotonically increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl TokenStats {
    pub fn add(&mut self, input: u64, output: u64, cost: f64) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.cost += cost;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Category of an extracted story element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Character,
    Place,
    Item,
    Creature,
}

/// One extracted story element, reused by the illustrate phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryElement {
    pub name: String,
    pub kind: ElementKind,
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Catalog of every extracted element, owned by the extract phase but
/// exposed at the root for downstream reuse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementCatalog {
    pub elements: Vec<StoryElement>,
}

impl ElementCatalog {
    pub fn get(&self, name: &str) -> Option<&StoryElement> {
        self.elements.iter().find(|e| e.name == name)
    }
}

/// Smallest resumable grain of work: one chapter or one element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitState {
    pub status: Status,
    /// Tokens consumed by this unit's calls; accumulates across retries.
    #[serde(default)]
    pub tokens_used: u64,
    /// Opaque payload produced on success. Once set, it is authoritative
    /// and reused instead of repeating the external call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Last failure reason; cleared on successful retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UnitState {
    /// Transition to `InProgress`. Valid from `Pending` and `Failed`;
    /// a `Completed` unit is never re-dispatched without a force reset.
    pub fn begin(&mut self, unit: &str) -> Result<(), StateError> {
        match self.status {
            Status::Pending | Status::Failed => {
                self.status = Status::InProgress;
                Ok(())
            }
            from => Err(StateError::InvalidTransition {
                unit: unit.to_string(),
                from,
                to: Status::InProgress,
            }),
        }
    }

    /// Record a successful result. Valid only from `InProgress`.
    pub fn complete(&mut self, unit: &str, result: Value, tokens_used: u64) -> Result<(), StateError> {
        if self.status != Status::InProgress {
            return Err(StateError::InvalidTransition {
                unit: unit.to_string(),
                from: self.status,
                to: Status::Completed,
            });
        }
        self.status = Status::Completed;
        self.result = Some(result);
        self.tokens_used += tokens_used;
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a terminal failure with a human-readable reason.
    pub fn fail(&mut self, unit: &str, reason: impl Into<String>, tokens_used: u64) -> Result<(), StateError> {
        if self.status == Status::Completed {
            return Err(StateError::InvalidTransition {
                unit: unit.to_string(),
                from: self.status,
                to: Status::Failed,
            });
        }
        self.status = Status::Failed;
        self.error = Some(reason.into());
        self.tokens_used += tokens_used;
        Ok(())
    }

    /// Roll an `InProgress` unit back to `Pending` after a cancelled
    /// dispatch. A cancelled job must never surface as completed.
    pub fn cancel(&mut self) {
        if self.status == Status::InProgress {
            self.status = Status::Pending;
        }
    }

    /// Reset a failed unit to `Pending`, clearing its error (the
    /// `clear_errors` retry control).
    pub fn clear_error(&mut self) {
        if self.status == Status::Failed {
            self.status = Status::Pending;
            self.error = None;
        }
    }

    /// Forced regeneration: drop the result and start over regardless of
    /// current status. Accumulated token usage is kept.
    pub fn force_reset(&mut self) {
        self.status = Status::Pending;
        self.result = None;
        self.error = None;
        self.completed_at = None;
    }
}

/// Per-phase progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: Status,
    /// Sub-phase to resume from after an interruption.
    pub current_sub_phase: SubPhase,
    /// Per-sub-phase completion record, so a crash between `estimate` and
    /// `execute` does not force re-planning.
    #[serde(default)]
    pub sub_phases: BTreeMap<SubPhase, Status>,
    /// Work units keyed by chapter number or element name.
    #[serde(default)]
    pub units: BTreeMap<String, UnitState>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            status: Status::Pending,
            current_sub_phase: SubPhase::Plan,
            sub_phases: SubPhase::ALL
                .iter()
                .map(|sp| (*sp, Status::Pending))
                .collect(),
            units: BTreeMap::new(),
        }
    }
}

impl PhaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(&self, phase: Phase, key: &str) -> Result<&UnitState, StateError> {
        self.units.get(key).ok_or_else(|| StateError::UnknownUnit {
            phase,
            unit: key.to_string(),
        })
    }

    pub fn unit_mut(&mut self, phase: Phase, key: &str) -> Result<&mut UnitState, StateError> {
        self.units
            .get_mut(key)
            .ok_or_else(|| StateError::UnknownUnit {
                phase,
                unit: key.to_string(),
            })
    }

    /// Insert the unit if planning has not recorded it yet.
    pub fn ensure_unit(&mut self, key: &str) -> &mut UnitState {
        self.units.entry(key.to_string()).or_default()
    }

    /// Units not yet in a terminal state.
    pub fn open_units(&self) -> usize {
        self.units
            .values()
            .filter(|u| !u.status.is_terminal())
            .count()
    }

    pub fn completed_units(&self) -> usize {
        self.units
            .values()
            .filter(|u| u.status == Status::Completed)
            .count()
    }

    pub fn failed_units(&self) -> usize {
        self.units
            .values()
            .filter(|u| u.status == Status::Failed)
            .count()
    }

    /// Whether a sub-phase already ran to completion (resume check).
    pub fn sub_phase_completed(&self, sub_phase: SubPhase) -> bool {
        self.sub_phases.get(&sub_phase) == Some(&Status::Completed)
    }

    /// Mark a sub-phase in progress and record it as the resume point.
    pub fn begin_sub_phase(&mut self, sub_phase: SubPhase) {
        self.current_sub_phase = sub_phase;
        self.sub_phases.insert(sub_phase, Status::InProgress);
    }

    pub fn complete_sub_phase(&mut self, sub_phase: SubPhase) {
        self.sub_phases.insert(sub_phase, Status::Completed);
    }

    /// Finalize the phase status once every unit is terminal.
    ///
    /// Fails loudly while any unit is still open. With failed units left
    /// over, the phase completes only when partial failure is tolerated.
    pub fn try_complete(
        &mut self,
        phase: Phase,
        tolerate_partial_failure: bool,
    ) -> Result<Status, StateError> {
        let open = self.open_units();
        if open > 0 {
            return Err(StateError::PhaseNotDone { phase, open });
        }
        self.status = if self.failed_units() == 0 || tolerate_partial_failure {
            Status::Completed
        } else {
            Status::Failed
        };
        Ok(self.status)
    }
}

/// Root aggregate: everything the engine knows about one book-processing
/// run, persisted as a single versioned document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: u32,
    pub source_file: String,
    pub book_title: String,
    pub total_pages: u32,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseState>,
    /// Write-once after the parse phase completes.
    #[serde(default)]
    pub table_of_contents: Vec<TocEntry>,
    #[serde(default)]
    pub token_stats: TokenStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<ElementCatalog>,
    pub last_updated: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh state for a run that has no prior state file.
    pub fn new(
        source_file: impl Into<String>,
        book_title: impl Into<String>,
        total_pages: u32,
    ) -> Self {
        let mut state = Self {
            schema_version: STATE_SCHEMA_VERSION,
            source_file: source_file.into(),
            book_title: book_title.into(),
            total_pages,
            phases: BTreeMap::new(),
            table_of_contents: Vec::new(),
            token_stats: TokenStats::default(),
            elements: None,
            last_updated: Utc::now(),
        };
        state.normalize();
        state
    }

    /// Ensure every phase has a record; called on creation and after load
    /// so lookups never dangle.
    pub fn normalize(&mut self) {
        for phase in Phase::ALL {
            self.phases.entry(phase).or_default();
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseState> {
        self.phases.get(&phase)
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseState {
        self.phases.entry(phase).or_default()
    }

    /// Whether a phase's predecessor chain is fully completed.
    pub fn predecessors_completed(&self, phase: Phase) -> bool {
        let mut current = phase.predecessor();
        while let Some(p) = current {
            if self.phase(p).map(|s| s.status) != Some(Status::Completed) {
                return false;
            }
            current = p.predecessor();
        }
        true
    }

    /// Record the table of contents. Write-once.
    pub fn set_table_of_contents(&mut self, toc: Vec<TocEntry>) -> Result<(), StateError> {
        if !self.table_of_contents.is_empty() {
            return Err(StateError::TocAlreadySet);
        }
        self.table_of_contents = toc;
        Ok(())
    }

    /// Accumulate run-level token/cost totals.
    pub fn add_token_stats(&mut self, input: u64, output: u64, cost: f64) {
        self.token_stats.add(input, output, cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_order_and_predecessors() {
        assert_eq!(Phase::Parse.predecessor(), None);
        assert_eq!(Phase::Illustrate.predecessor(), Some(Phase::Extract));
        assert!(Phase::Parse < Phase::Analyze);
        assert!(Phase::Extract < Phase::Illustrate);
    }

    #[test]
    fn test_unit_happy_path() {
        let mut unit = UnitState::default();
        unit.begin("chapter-1").expect("begin");
        assert_eq!(unit.status, Status::InProgress);
        unit.complete("chapter-1", json!({"scene": "dawn"}), 120)
            .expect("complete");
        assert_eq!(unit.status, Status::Completed);
        assert_eq!(unit.tokens_used, 120);
        assert!(unit.error.is_none());
        assert!(unit.completed_at.is_some());
    }

    #[test]
    fn test_completed_unit_rejects_redispatch() {
        let mut unit = UnitState::default();
        unit.begin("chapter-1").expect("begin");
        unit.complete("chapter-1", json!({}), 10).expect("complete");
        let err = unit.begin("chapter-1").unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        // Result survives the rejected attempt.
        assert!(unit.result.is_some());
    }

    #[test]
    fn test_failed_unit_retry_clears_error() {
        let mut unit = UnitState::default();
        unit.begin("chapter-2").expect("begin");
        unit.fail("chapter-2", "rate limited", 30).expect("fail");
        assert_eq!(unit.status, Status::Failed);
        unit.begin("chapter-2").expect("retry");
        unit.complete("chapter-2", json!({"ok": true}), 40)
            .expect("complete");
        assert!(unit.error.is_none());
        assert_eq!(unit.tokens_used, 70);
    }

    #[test]
    fn test_cancel_rolls_back_to_pending() {
        let mut unit = UnitState::default();
        unit.begin("chapter-3").expect("begin");
        unit.cancel();
        assert_eq!(unit.status, Status::Pending);
        // Cancel on a terminal unit is a no-op.
        unit.begin("chapter-3").expect("begin");
        unit.complete("chapter-3", json!({}), 5).expect("complete");
        unit.cancel();
        assert_eq!(unit.status, Status::Completed);
    }

    #[test]
    fn test_clear_error_only_touches_failed() {
        let mut failed = UnitState::default();
        failed.begin("a").expect("begin");
        failed.fail("a", "boom", 0).expect("fail");
        failed.clear_error();
        assert_eq!(failed.status, Status::Pending);
        assert!(failed.error.is_none());

        let mut done = UnitState::default();
        done.begin("b").expect("begin");
        done.complete("b", json!(1), 0).expect("complete");
        done.clear_error();
        assert_eq!(done.status, Status::Completed);
    }

    #[test]
    fn test_force_reset_drops_result() {
        let mut unit = UnitState::default();
        unit.begin("c").expect("begin");
        unit.complete("c", json!("payload"), 50).expect("complete");
        unit.force_reset();
        assert_eq!(unit.status, Status::Pending);
        assert!(unit.result.is_none());
        assert_eq!(unit.tokens_used, 50);
    }

    #[test]
    fn test_phase_cannot_complete_with_open_units() {
        let mut phase = PhaseState::new();
        phase.ensure_unit("chapter-1");
        let err = phase.try_complete(Phase::Analyze, false).unwrap_err();
        assert!(matches!(err, StateError::PhaseNotDone { open: 1, .. }));
    }

    #[test]
    fn test_phase_completion_respects_partial_failure_flag() {
        let mut phase = PhaseState::new();
        phase.ensure_unit("chapter-1").begin("chapter-1").expect("begin");
        phase
            .unit_mut(Phase::Analyze, "chapter-1")
            .expect("unit")
            .complete("chapter-1", json!({}), 0)
            .expect("complete");
        phase.ensure_unit("chapter-2").begin("chapter-2").expect("begin");
        phase
            .unit_mut(Phase::Analyze, "chapter-2")
            .expect("unit")
            .fail("chapter-2", "fatal", 0)
            .expect("fail");

        let mut strict = phase.clone();
        assert_eq!(
            strict.try_complete(Phase::Analyze, false).expect("finalize"),
            Status::Failed
        );
        assert_eq!(
            phase.try_complete(Phase::Analyze, true).expect("finalize"),
            Status::Completed
        );
    }

    #[test]
    fn test_toc_is_write_once() {
        let mut state = PipelineState::new("book.epub", "The Book", 320);
        state
            .set_table_of_contents(vec![TocEntry {
                number: 1,
                title: "One".into(),
                pages: crate::book::PageRange::new(1, 20),
                token_count: 900,
            }])
            .expect("first write");
        let err = state.set_table_of_contents(Vec::new()).unwrap_err();
        assert!(matches!(err, StateError::TocAlreadySet));
        assert_eq!(state.table_of_contents.len(), 1);
    }

    #[test]
    fn test_predecessors_completed_chain() {
        let mut state = PipelineState::new("book.epub", "The Book", 100);
        assert!(state.predecessors_completed(Phase::Parse));
        assert!(!state.predecessors_completed(Phase::Extract));
        state.phase_mut(Phase::Parse).status = Status::Completed;
        assert!(state.predecessors_completed(Phase::Analyze));
        assert!(!state.predecessors_completed(Phase::Extract));
        state.phase_mut(Phase::Analyze).status = Status::Completed;
        assert!(state.predecessors_completed(Phase::Extract));
    }

    #[test]
    fn test_token_stats_accumulate() {
        let mut state = PipelineState::new("b", "t", 1);
        state.add_token_stats(100, 50, 0.25);
        state.add_token_stats(10, 5, 0.05);
        assert_eq!(state.token_stats.input_tokens, 110);
        assert_eq!(state.token_stats.output_tokens, 55);
        assert_eq!(state.token_stats.total(), 165);
        assert!((state.token_stats.cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = PipelineState::new("book.epub", "The Book", 200);
        let unit = state.phase_mut(Phase::Analyze).ensure_unit("chapter-1");
        unit.begin("chapter-1").expect("begin");
        unit.complete("chapter-1", json!({"scenes": ["a", "b"]}), 321)
            .expect("complete");

        let text = serde_json::to_string(&state).expect("serialize");
        let back: PipelineState = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, state);
    }
}
