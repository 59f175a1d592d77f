//! Flow records, stage attempts, and the status state machine.
//!
//! A [`FlowRecord`] is the authoritative mutable state of one submitted
//! flow. All mutation goes through the registry in `loregen-engine`; the
//! methods here keep the record's invariants (status/attempt coherence,
//! monotone overall progress) in one place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::FlowConfiguration;
use crate::error::CoreError;
use crate::retry::FailureRecord;
use crate::stage::{progress_through, Stage};
use crate::types::{FlowId, Timestamp};

// ---------------------------------------------------------------------------
// FlowStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    /// Return the wire-format string for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further stage execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Valid flow status transitions.
///
/// `Failed` is terminal for stage execution but re-enters the queue via
/// recovery or manual-intervention resolution, so it has one outgoing
/// edge. `Completed` and `Cancelled` are absorbing.
pub mod state_machine {
    use super::FlowStatus;

    /// Returns the set of valid target statuses reachable from `from`.
    pub fn valid_transitions(from: FlowStatus) -> &'static [FlowStatus] {
        use FlowStatus::*;
        match from {
            Pending => &[Queued, Cancelled],
            Queued => &[Running, Cancelled],
            Running => &[Completed, Failed, Paused, Cancelled],
            Paused => &[Queued, Cancelled],
            Failed => &[Queued],
            Completed | Cancelled => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: FlowStatus, to: FlowStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error for invalid ones.
    pub fn validate_transition(from: FlowStatus, to: FlowStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {from} -> {to}"))
        }
    }
}

// ---------------------------------------------------------------------------
// StageAttempt
// ---------------------------------------------------------------------------

/// Execution status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One stage's execution record within a flow.
///
/// A retried stage keeps a single attempt record whose `retry_count`
/// climbs; the per-failure detail lives in the retry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAttempt {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub duration_ms: Option<u64>,
    /// Stage-local progress percentage (0-100).
    pub progress: u32,
    pub message: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl StageAttempt {
    fn running(stage: Stage, now: Timestamp) -> Self {
        Self {
            stage,
            status: StageStatus::Running,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            progress: 0,
            message: None,
            error: None,
            retry_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Progress, errors, resources
// ---------------------------------------------------------------------------

/// Progress snapshot exposed to status queries and progress events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Overall pipeline progress, 0-100. Monotone while running.
    pub overall: u32,
    /// Progress of the current stage, 0-100.
    pub current_stage: u32,
    pub items_processed: u32,
    pub items_succeeded: u32,
    pub items_failed: u32,
    pub items_total: u32,
}

/// Severity of an error entry on the flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// One entry in the flow's error history. Nothing is ever dropped from
/// this list; a failed flow keeps its full history for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowErrorEntry {
    pub stage: Stage,
    pub game_id: Option<String>,
    pub message: String,
    pub timestamp: Timestamp,
    pub severity: ErrorSeverity,
}

/// Opaque resource counters incremented by the generator collaborator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tokens_consumed: u64,
    pub api_calls: u64,
}

/// Start/end times and per-stage durations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowTiming {
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    /// Duration of each completed stage, keyed by stage name.
    pub stage_durations_ms: HashMap<String, u64>,
}

/// Bookkeeping that is not part of the execution state proper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMetadata {
    /// The originating configuration, immutable after submission.
    pub configuration: FlowConfiguration,
    /// Stage of the latest checkpoint, if one was written.
    pub checkpoint_stage: Option<Stage>,
    pub last_saved_at: Option<Timestamp>,
    /// How many times `recover` restarted this flow from scratch.
    pub recovery_attempts: u32,
    /// Set when the retry controller escalated to manual intervention.
    /// The flow is `failed` but resolvable by an operator action.
    pub awaiting_manual_intervention: bool,
}

// ---------------------------------------------------------------------------
// FlowRecord
// ---------------------------------------------------------------------------

/// The authoritative state of one submitted flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: FlowId,
    pub status: FlowStatus,
    pub current_stage: Option<Stage>,
    pub attempts: Vec<StageAttempt>,
    pub progress: ProgressSnapshot,
    pub timing: FlowTiming,
    pub resources: ResourceUsage,
    pub errors: Vec<FlowErrorEntry>,
    /// One entry per retry-controller decision, in order.
    pub retry_history: Vec<FailureRecord>,
    pub metadata: FlowMetadata,
}

impl FlowRecord {
    /// Create a fresh record in `pending` status.
    pub fn new(id: FlowId, configuration: FlowConfiguration) -> Self {
        let items_total = configuration.game_ids.len() as u32;
        Self {
            id,
            status: FlowStatus::Pending,
            current_stage: None,
            attempts: Vec::new(),
            progress: ProgressSnapshot {
                items_total,
                ..ProgressSnapshot::default()
            },
            timing: FlowTiming::default(),
            resources: ResourceUsage::default(),
            errors: Vec::new(),
            retry_history: Vec::new(),
            metadata: FlowMetadata {
                configuration,
                checkpoint_stage: None,
                last_saved_at: None,
                recovery_attempts: 0,
                awaiting_manual_intervention: false,
            },
        }
    }

    /// Transition to a new status, enforcing the state machine.
    ///
    /// Terminal transitions stamp `timing.ended_at`.
    pub fn set_status(&mut self, to: FlowStatus, now: Timestamp) -> Result<(), CoreError> {
        state_machine::validate_transition(self.status, to).map_err(CoreError::Conflict)?;
        self.status = to;
        match to {
            FlowStatus::Running => {
                if self.timing.started_at.is_none() {
                    self.timing.started_at = Some(now);
                }
                // A resumed or recovered flow is live again.
                self.timing.ended_at = None;
            }
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled => {
                self.timing.ended_at = Some(now);
            }
            _ => {}
        }
        Ok(())
    }

    /// Start (or retry) a stage.
    ///
    /// A first attempt appends a new running [`StageAttempt`]; a retry of
    /// a just-failed attempt for the same stage resets it to running and
    /// bumps its `retry_count`.
    pub fn begin_stage(&mut self, stage: Stage, now: Timestamp) {
        self.current_stage = Some(stage);
        self.progress.current_stage = 0;

        if let Some(last) = self.attempts.last_mut() {
            if last.stage == stage && last.status == StageStatus::Failed {
                last.status = StageStatus::Running;
                last.started_at = now;
                last.ended_at = None;
                last.duration_ms = None;
                last.progress = 0;
                last.retry_count += 1;
                return;
            }
        }
        self.attempts.push(StageAttempt::running(stage, now));
    }

    /// Mark the current stage attempt completed and fold its weight into
    /// overall progress. Overall progress never decreases while running.
    pub fn complete_stage(&mut self, stage: Stage, now: Timestamp) {
        let duration = self.stage_duration(now);
        if let Some(last) = self.attempts.last_mut() {
            last.status = StageStatus::Completed;
            last.ended_at = Some(now);
            last.duration_ms = duration;
            last.progress = 100;
        }
        if let Some(ms) = duration {
            self.timing
                .stage_durations_ms
                .insert(stage.as_str().to_string(), ms);
        }
        self.progress.current_stage = 100;
        self.progress.overall = self.progress.overall.max(progress_through(stage));
    }

    /// Mark the current stage attempt failed with an error message.
    pub fn fail_stage(&mut self, now: Timestamp, error: impl Into<String>) {
        let duration = self.stage_duration(now);
        if let Some(last) = self.attempts.last_mut() {
            last.status = StageStatus::Failed;
            last.ended_at = Some(now);
            last.duration_ms = duration;
            last.error = Some(error.into());
        }
    }

    /// Record a disabled stage as skipped. Its weight still counts so the
    /// overall percentage reaches 100 at pipeline end.
    pub fn skip_stage(&mut self, stage: Stage, now: Timestamp) {
        self.current_stage = Some(stage);
        self.attempts.push(StageAttempt {
            status: StageStatus::Skipped,
            ended_at: Some(now),
            duration_ms: Some(0),
            progress: 100,
            ..StageAttempt::running(stage, now)
        });
        self.progress.overall = self.progress.overall.max(progress_through(stage));
    }

    /// Append an entry to the error history.
    pub fn record_error(
        &mut self,
        stage: Stage,
        game_id: Option<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
        now: Timestamp,
    ) {
        self.errors.push(FlowErrorEntry {
            stage,
            game_id,
            message: message.into(),
            timestamp: now,
            severity,
        });
    }

    /// Reset execution state for a restart from the first stage.
    ///
    /// This is the only operation allowed to move `progress.overall`
    /// backwards. The error history is cleared; the recovery counter is
    /// bumped so runaway restart loops are visible.
    pub fn reset_for_restart(&mut self) {
        self.current_stage = None;
        self.attempts.clear();
        self.errors.clear();
        self.retry_history.clear();
        self.progress = ProgressSnapshot {
            items_total: self.metadata.configuration.game_ids.len() as u32,
            ..ProgressSnapshot::default()
        };
        self.timing = FlowTiming::default();
        self.metadata.checkpoint_stage = None;
        self.metadata.recovery_attempts += 1;
        self.metadata.awaiting_manual_intervention = false;
    }

    /// The last completed stage, if any.
    pub fn last_completed_stage(&self) -> Option<Stage> {
        self.attempts
            .iter()
            .rev()
            .find(|a| matches!(a.status, StageStatus::Completed | StageStatus::Skipped))
            .map(|a| a.stage)
    }

    fn stage_duration(&self, now: Timestamp) -> Option<u64> {
        self.attempts
            .last()
            .map(|a| (now - a.started_at).num_milliseconds().max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::*;
    use chrono::Utc;

    fn record() -> FlowRecord {
        let config = FlowConfiguration::new("w1", vec!["g1".to_string(), "g2".to_string()]);
        FlowRecord::new("flow-1".to_string(), config)
    }

    // -- State machine --------------------------------------------------------

    #[test]
    fn pending_to_queued() {
        assert!(can_transition(FlowStatus::Pending, FlowStatus::Queued));
    }

    #[test]
    fn queued_to_running() {
        assert!(can_transition(FlowStatus::Queued, FlowStatus::Running));
    }

    #[test]
    fn running_to_paused_and_back_via_queue() {
        assert!(can_transition(FlowStatus::Running, FlowStatus::Paused));
        assert!(can_transition(FlowStatus::Paused, FlowStatus::Queued));
    }

    #[test]
    fn failed_reenters_queue_only() {
        assert_eq!(valid_transitions(FlowStatus::Failed), &[FlowStatus::Queued]);
    }

    #[test]
    fn cancel_reachable_from_every_non_terminal_state() {
        for from in [
            FlowStatus::Pending,
            FlowStatus::Queued,
            FlowStatus::Running,
            FlowStatus::Paused,
        ] {
            assert!(can_transition(from, FlowStatus::Cancelled), "{from}");
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        assert!(valid_transitions(FlowStatus::Completed).is_empty());
        assert!(valid_transitions(FlowStatus::Cancelled).is_empty());
    }

    #[test]
    fn validate_transition_err_is_descriptive() {
        let err = validate_transition(FlowStatus::Completed, FlowStatus::Running).unwrap_err();
        assert!(err.contains("completed"));
        assert!(err.contains("running"));
    }

    // -- FlowRecord lifecycle -------------------------------------------------

    #[test]
    fn new_record_is_pending() {
        let r = record();
        assert_eq!(r.status, FlowStatus::Pending);
        assert_eq!(r.progress.items_total, 2);
        assert!(r.attempts.is_empty());
    }

    #[test]
    fn set_status_rejects_invalid_transition() {
        let mut r = record();
        let err = r.set_status(FlowStatus::Completed, Utc::now());
        assert!(err.is_err());
        assert_eq!(r.status, FlowStatus::Pending);
    }

    #[test]
    fn terminal_status_stamps_end_time() {
        let mut r = record();
        let now = Utc::now();
        r.set_status(FlowStatus::Queued, now).unwrap();
        r.set_status(FlowStatus::Running, now).unwrap();
        r.set_status(FlowStatus::Completed, now).unwrap();
        assert!(r.timing.ended_at.is_some());
    }

    // -- Stage attempts -------------------------------------------------------

    #[test]
    fn begin_stage_appends_running_attempt() {
        let mut r = record();
        r.begin_stage(Stage::Preparing, Utc::now());
        assert_eq!(r.attempts.len(), 1);
        assert_eq!(r.attempts[0].status, StageStatus::Running);
        assert_eq!(r.current_stage, Some(Stage::Preparing));
    }

    #[test]
    fn retry_reuses_attempt_and_bumps_retry_count() {
        let mut r = record();
        let now = Utc::now();
        r.begin_stage(Stage::Preparing, now);
        r.fail_stage(now, "boom");
        r.begin_stage(Stage::Preparing, now);
        r.fail_stage(now, "boom again");
        r.begin_stage(Stage::Preparing, now);

        assert_eq!(r.attempts.len(), 1);
        assert_eq!(r.attempts[0].retry_count, 2);
        assert_eq!(r.attempts[0].status, StageStatus::Running);
    }

    #[test]
    fn complete_stage_folds_weight_into_overall() {
        let mut r = record();
        let now = Utc::now();
        r.begin_stage(Stage::Preparing, now);
        r.complete_stage(Stage::Preparing, now);

        assert_eq!(r.progress.overall, progress_through(Stage::Preparing));
        assert_eq!(r.progress.current_stage, 100);
        assert_eq!(r.attempts[0].status, StageStatus::Completed);
        assert!(r.timing.stage_durations_ms.contains_key("preparing"));
    }

    #[test]
    fn overall_progress_never_decreases() {
        let mut r = record();
        let now = Utc::now();
        r.begin_stage(Stage::ContentGeneration, now);
        r.complete_stage(Stage::ContentGeneration, now);
        let high = r.progress.overall;

        // Completing an earlier stage again must not move overall back.
        r.begin_stage(Stage::Preparing, now);
        r.complete_stage(Stage::Preparing, now);
        assert_eq!(r.progress.overall, high);
    }

    #[test]
    fn skip_stage_counts_toward_overall() {
        let mut r = record();
        let now = Utc::now();
        r.skip_stage(Stage::StructuredDataGeneration, now);
        assert_eq!(r.attempts[0].status, StageStatus::Skipped);
        assert_eq!(
            r.progress.overall,
            progress_through(Stage::StructuredDataGeneration)
        );
    }

    #[test]
    fn last_completed_stage_ignores_failures() {
        let mut r = record();
        let now = Utc::now();
        r.begin_stage(Stage::Preparing, now);
        r.complete_stage(Stage::Preparing, now);
        r.begin_stage(Stage::DataLoading, now);
        r.fail_stage(now, "load error");

        assert_eq!(r.last_completed_stage(), Some(Stage::Preparing));
    }

    #[test]
    fn reset_for_restart_clears_state_and_bumps_counter() {
        let mut r = record();
        let now = Utc::now();
        r.begin_stage(Stage::Preparing, now);
        r.complete_stage(Stage::Preparing, now);
        r.record_error(Stage::Preparing, None, "x", ErrorSeverity::Warning, now);

        r.reset_for_restart();

        assert!(r.attempts.is_empty());
        assert!(r.errors.is_empty());
        assert_eq!(r.progress.overall, 0);
        assert_eq!(r.metadata.recovery_attempts, 1);
    }

    #[test]
    fn record_error_appends() {
        let mut r = record();
        let now = Utc::now();
        r.record_error(
            Stage::ContentGeneration,
            Some("g1".to_string()),
            "per-game timeout",
            ErrorSeverity::Warning,
            now,
        );
        r.record_error(
            Stage::ContentGeneration,
            None,
            "stage aborted",
            ErrorSeverity::Critical,
            now,
        );
        assert_eq!(r.errors.len(), 2);
        assert_eq!(r.errors[0].game_id.as_deref(), Some("g1"));
        assert_eq!(r.errors[1].severity, ErrorSeverity::Critical);
    }
}
