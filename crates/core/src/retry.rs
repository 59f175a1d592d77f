//! Retry policy: backoff computation and the retry/abort/escalate decision.
//!
//! The retry controller is a pure function over the flow's retry state
//! and the configured policy, so every branch is unit-testable without
//! an executor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FlowConfiguration;
use crate::stage::Stage;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// How successive retry delays grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay: `base`.
    Fixed,
    /// `base * (attempt + 1)`.
    Linear,
    /// `base * 2^attempt`.
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }
}

/// Compute the delay before retry number `attempt` (zero-based), clamped
/// at `max_ms`.
pub fn compute_delay(
    strategy: BackoffStrategy,
    base_ms: u64,
    attempt: u32,
    max_ms: u64,
) -> Duration {
    let raw = match strategy {
        BackoffStrategy::Fixed => base_ms,
        BackoffStrategy::Linear => base_ms.saturating_mul(attempt as u64 + 1),
        BackoffStrategy::Exponential => {
            // 2^attempt saturates rather than wrapping for absurd attempts.
            let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
            base_ms.saturating_mul(factor)
        }
    };
    Duration::from_millis(raw.min(max_ms))
}

// ---------------------------------------------------------------------------
// Retry state
// ---------------------------------------------------------------------------

/// How many recent attempts the failure-ratio window looks at.
pub const FAILURE_WINDOW: usize = 3;

/// The operator-facing outcome recorded with each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Abort,
    ManualIntervention,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Abort => "abort",
            Self::ManualIntervention => "manual_intervention",
        }
    }
}

/// One failed attempt, recorded regardless of the decision taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub timestamp: Timestamp,
    pub error_type: String,
    pub error_message: String,
    pub attempt: u32,
    pub recovery_action: RecoveryAction,
}

/// Retry bookkeeping for one flow's current stage-attempt cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    pub stage: Stage,
    /// Attempts of the current stage (0 on the first failure).
    pub attempt: u32,
    /// Attempts across the whole flow, all stages.
    pub total_attempts: u32,
    pub failures: Vec<FailureRecord>,
    pub manual_intervention_required: bool,
}

impl RetryState {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            attempt: 0,
            total_attempts: 0,
            failures: Vec::new(),
            manual_intervention_required: false,
        }
    }

    /// Reset the per-stage attempt counter when the pipeline advances.
    /// The failure history and flow-wide counter are kept.
    pub fn advance_to(&mut self, stage: Stage) {
        self.stage = stage;
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// The retry policy distilled from a flow configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub failure_threshold: f64,
    pub enable_manual_intervention: bool,
}

impl From<&FlowConfiguration> for RetryPolicy {
    fn from(config: &FlowConfiguration) -> Self {
        Self {
            max_retries: config.max_retries,
            strategy: config.backoff.strategy,
            base_delay_ms: config.backoff.base_delay_ms,
            max_delay_ms: config.backoff.max_delay_ms,
            failure_threshold: config.backoff.failure_threshold,
            enable_manual_intervention: config.backoff.enable_manual_intervention,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the same stage after the given delay.
    Retry { delay: Duration },
    /// Stop the flow; the failure is final.
    Abort,
    /// Stop the flow but flag it for operator resolution.
    ManualIntervention,
}

/// Decide what to do about a failed stage attempt.
///
/// Appends a [`FailureRecord`] to `state` regardless of the outcome, and
/// advances the attempt counters. Escalation to manual intervention
/// takes precedence over remaining retries: when enabled, the failure
/// ratio over the last [`FAILURE_WINDOW`] attempts is compared against
/// the policy's threshold.
pub fn decide(
    policy: &RetryPolicy,
    state: &mut RetryState,
    stage: Stage,
    error_type: impl Into<String>,
    error_message: impl Into<String>,
    now: Timestamp,
) -> RetryDecision {
    if state.stage != stage {
        state.advance_to(stage);
    }

    let attempt = state.attempt;
    let decision = if policy.enable_manual_intervention
        && recent_failure_ratio(state) >= policy.failure_threshold
    {
        RetryDecision::ManualIntervention
    } else if attempt < policy.max_retries {
        RetryDecision::Retry {
            delay: compute_delay(
                policy.strategy,
                policy.base_delay_ms,
                attempt,
                policy.max_delay_ms,
            ),
        }
    } else {
        RetryDecision::Abort
    };

    let recovery_action = match decision {
        RetryDecision::Retry { .. } => RecoveryAction::Retry,
        RetryDecision::Abort => RecoveryAction::Abort,
        RetryDecision::ManualIntervention => RecoveryAction::ManualIntervention,
    };

    state.failures.push(FailureRecord {
        stage,
        timestamp: now,
        error_type: error_type.into(),
        error_message: error_message.into(),
        attempt,
        recovery_action,
    });
    state.attempt += 1;
    state.total_attempts += 1;

    if decision == RetryDecision::ManualIntervention {
        state.manual_intervention_required = true;
    }

    decision
}

// ---------------------------------------------------------------------------
// Manual intervention
// ---------------------------------------------------------------------------

/// Operator-selected resolution for a flow awaiting manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualAction {
    /// Treat the failed validation as passed and continue.
    SkipValidation,
    /// Re-run the automatic format repair over the stage output and
    /// continue.
    ForceRepair,
    /// Substitute operator-provided stage output and continue.
    AcceptManualEdit,
    /// Finalize the flow as failed with reason "user aborted".
    Abort,
}

impl ManualAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkipValidation => "skip_validation",
            Self::ForceRepair => "force_repair",
            Self::AcceptManualEdit => "accept_manual_edit",
            Self::Abort => "abort",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "skip_validation" => Some(Self::SkipValidation),
            "force_repair" => Some(Self::ForceRepair),
            "accept_manual_edit" => Some(Self::AcceptManualEdit),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Failure ratio over the most recent [`FAILURE_WINDOW`] attempts.
///
/// Counting the incoming failure, the window holds `failures + 1` bad
/// attempts (every recorded entry is a failure), so the ratio is the
/// window occupancy over the window size.
fn recent_failure_ratio(state: &RetryState) -> f64 {
    let recent = state.failures.len().min(FAILURE_WINDOW.saturating_sub(1)) + 1;
    recent as f64 / FAILURE_WINDOW as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            failure_threshold: 0.8,
            enable_manual_intervention: false,
        }
    }

    // -- compute_delay --------------------------------------------------------

    #[test]
    fn fixed_delay_is_constant() {
        for attempt in 0..5 {
            let d = compute_delay(BackoffStrategy::Fixed, 500, attempt, 30_000);
            assert_eq!(d, Duration::from_millis(500));
        }
    }

    #[test]
    fn linear_delay_grows_by_base() {
        let delays: Vec<u64> = (0..4)
            .map(|a| compute_delay(BackoffStrategy::Linear, 1_000, a, 30_000).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 3_000, 4_000]);
    }

    #[test]
    fn exponential_delay_doubles_and_clamps() {
        let delays: Vec<u64> = (0..7)
            .map(|a| {
                compute_delay(BackoffStrategy::Exponential, 1_000, a, 30_000).as_millis() as u64
            })
            .collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn exponential_delay_survives_huge_attempt_counts() {
        let d = compute_delay(BackoffStrategy::Exponential, 1_000, 200, 30_000);
        assert_eq!(d, Duration::from_millis(30_000));
    }

    // -- decide: retry until exhaustion ---------------------------------------

    #[test]
    fn retries_while_attempts_remain() {
        let p = policy();
        let mut state = RetryState::new(Stage::ContentGeneration);
        let now = Utc::now();

        for expected_delay in [1_000u64, 2_000, 4_000] {
            let decision = decide(
                &p,
                &mut state,
                Stage::ContentGeneration,
                "stage_error",
                "generation failed",
                now,
            );
            assert_eq!(
                decision,
                RetryDecision::Retry {
                    delay: Duration::from_millis(expected_delay)
                }
            );
        }
    }

    #[test]
    fn exhausted_retries_abort() {
        let p = policy();
        let mut state = RetryState::new(Stage::ContentGeneration);
        let now = Utc::now();

        for _ in 0..3 {
            decide(&p, &mut state, Stage::ContentGeneration, "e", "m", now);
        }
        let decision = decide(&p, &mut state, Stage::ContentGeneration, "e", "m", now);
        assert_eq!(decision, RetryDecision::Abort);
        // Initial failure + 3 retries = 4 records.
        assert_eq!(state.failures.len(), 4);
        assert_eq!(
            state.failures.last().unwrap().recovery_action,
            RecoveryAction::Abort
        );
    }

    #[test]
    fn every_decision_appends_a_failure_record() {
        let p = policy();
        let mut state = RetryState::new(Stage::DataLoading);
        let now = Utc::now();

        decide(&p, &mut state, Stage::DataLoading, "io", "disk", now);
        decide(&p, &mut state, Stage::DataLoading, "io", "disk", now);

        assert_eq!(state.failures.len(), 2);
        assert_eq!(state.failures[0].attempt, 0);
        assert_eq!(state.failures[1].attempt, 1);
        assert_eq!(state.total_attempts, 2);
    }

    // -- decide: manual intervention ------------------------------------------

    #[test]
    fn manual_intervention_triggers_at_threshold_with_retries_left() {
        let mut p = policy();
        p.enable_manual_intervention = true;
        p.max_retries = 10;
        let mut state = RetryState::new(Stage::QualityValidation);
        let now = Utc::now();

        // First two failures: 1/3 and 2/3 of the window, below 0.8.
        for _ in 0..2 {
            let d = decide(&p, &mut state, Stage::QualityValidation, "e", "m", now);
            assert!(matches!(d, RetryDecision::Retry { .. }));
        }

        // Third failure fills the window: 3/3 >= 0.8.
        let d = decide(&p, &mut state, Stage::QualityValidation, "e", "m", now);
        assert_eq!(d, RetryDecision::ManualIntervention);
        assert!(state.manual_intervention_required);
    }

    #[test]
    fn manual_intervention_disabled_never_escalates() {
        let p = policy();
        let mut state = RetryState::new(Stage::QualityValidation);
        let now = Utc::now();

        for _ in 0..4 {
            let d = decide(&p, &mut state, Stage::QualityValidation, "e", "m", now);
            assert_ne!(d, RetryDecision::ManualIntervention);
        }
        assert!(!state.manual_intervention_required);
    }

    #[test]
    fn low_threshold_escalates_on_first_failure() {
        let mut p = policy();
        p.enable_manual_intervention = true;
        p.failure_threshold = 0.3;
        let mut state = RetryState::new(Stage::Preparing);

        let d = decide(&p, &mut state, Stage::Preparing, "e", "m", Utc::now());
        assert_eq!(d, RetryDecision::ManualIntervention);
    }

    // -- advance_to -----------------------------------------------------------

    #[test]
    fn advancing_stage_resets_attempt_counter() {
        let p = policy();
        let mut state = RetryState::new(Stage::Preparing);
        let now = Utc::now();

        decide(&p, &mut state, Stage::Preparing, "e", "m", now);
        assert_eq!(state.attempt, 1);

        // A failure on a later stage starts its own attempt cycle.
        let d = decide(&p, &mut state, Stage::DataLoading, "e", "m", now);
        assert_eq!(
            d,
            RetryDecision::Retry {
                delay: Duration::from_millis(1_000)
            }
        );
        assert_eq!(state.stage, Stage::DataLoading);
        assert_eq!(state.attempt, 1);
        assert_eq!(state.total_attempts, 2);
    }
}
