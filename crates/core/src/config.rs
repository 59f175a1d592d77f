//! Flow configuration: the immutable submission payload and its validation.
//!
//! A [`FlowConfiguration`] is supplied once at submission time and never
//! mutated afterwards. Validation collects *every* violated constraint so
//! the caller can fix the whole submission in one round trip.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::retry::BackoffStrategy;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default quality threshold applied when the submission omits one.
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.8;

/// Default maximum number of retries per stage.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between stage retries in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Default upper bound on the retry delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Default failure ratio (over the recent-attempt window) that escalates
/// to manual intervention when it is enabled.
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.8;

/// Default number of games processed concurrently inside one flow.
pub const DEFAULT_MAX_CONCURRENT_GAMES: usize = 3;

/// Default number of internal sub-steps a stage may run in parallel.
pub const DEFAULT_MAX_CONCURRENT_STAGES: usize = 1;

/// Default per-game timeout inside `content_generation` (2 minutes).
pub const DEFAULT_PER_GAME_TIMEOUT_MS: u64 = 120_000;

/// Default whole-flow timeout (30 minutes).
pub const DEFAULT_TOTAL_TIMEOUT_MS: u64 = 1_800_000;

/// Default interval between throttled progress events.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;

/// Default cap on automatic recovery attempts.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 2;

// ---------------------------------------------------------------------------
// OutputFormat
// ---------------------------------------------------------------------------

/// Requested rendering format for generated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Html,
    Json,
}

impl OutputFormat {
    /// Return the wire-format string for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Json => "json",
        }
    }

    /// Parse from a wire-format string.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "markdown" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            "json" => Ok(Self::Json),
            _ => Err(CoreError::Configuration(vec![format!(
                "Invalid output_format: '{s}'. Must be one of: markdown, html, json"
            )])),
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-configurations
// ---------------------------------------------------------------------------

/// Retry/backoff tuning for failed stage attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Failure ratio over the recent-attempt window that triggers manual
    /// intervention (when enabled), even if retries remain.
    pub failure_threshold: f64,
    pub enable_manual_intervention: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            enable_manual_intervention: false,
        }
    }
}

/// Concurrency sub-limits inside a single flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// Maximum games processed in parallel inside `content_generation`.
    pub max_concurrent_games: usize,
    /// Maximum internal sub-steps a stage may fan out to.
    pub max_concurrent_stages: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_concurrent_games: DEFAULT_MAX_CONCURRENT_GAMES,
            max_concurrent_stages: DEFAULT_MAX_CONCURRENT_STAGES,
        }
    }
}

/// Per-game and whole-flow timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub per_game_ms: u64,
    pub total_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_game_ms: DEFAULT_PER_GAME_TIMEOUT_MS,
            total_ms: DEFAULT_TOTAL_TIMEOUT_MS,
        }
    }
}

/// Recovery behaviour after a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Whether `recover` may be invoked on this flow at all.
    pub auto_recover: bool,
    /// Whether a checkpoint is written after each successful stage.
    pub save_checkpoints: bool,
    pub max_recovery_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            auto_recover: true,
            save_checkpoints: true,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
        }
    }
}

/// Progress notification behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPolicy {
    pub enable_progress_events: bool,
    /// Minimum interval between throttled item-level progress events.
    pub progress_update_interval_ms: u64,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            enable_progress_events: true,
            progress_update_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// FlowConfiguration
// ---------------------------------------------------------------------------

/// The immutable configuration of one submitted flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfiguration {
    /// Identifier of the generation workflow to run.
    pub workflow_id: String,
    /// The game records this flow processes.
    pub game_ids: Vec<String>,
    pub output_format: OutputFormat,
    /// Whether the `structured_data_generation` stage runs at all.
    pub enable_structured_data: bool,
    /// Structured-data types requested when the stage is enabled.
    pub structured_data_types: Vec<String>,
    /// Minimum average quality score in `[0, 1]` the gate must report.
    pub quality_threshold: f64,
    /// Maximum retries per stage before the retry controller aborts.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub concurrency: ConcurrencyLimits,
    pub timeouts: TimeoutConfig,
    pub recovery: RecoveryPolicy,
    pub notifications: NotificationPolicy,
}

impl FlowConfiguration {
    /// Build a configuration with defaults for everything except the
    /// workflow and game list.
    pub fn new(workflow_id: impl Into<String>, game_ids: Vec<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            game_ids,
            output_format: OutputFormat::default(),
            enable_structured_data: false,
            structured_data_types: Vec::new(),
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffConfig::default(),
            concurrency: ConcurrencyLimits::default(),
            timeouts: TimeoutConfig::default(),
            recovery: RecoveryPolicy::default(),
            notifications: NotificationPolicy::default(),
        }
    }

    /// Validate the configuration, collecting every violation.
    ///
    /// Returns `CoreError::Configuration` with one message per violated
    /// constraint so callers see the full list at once.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut violations = Vec::new();

        if self.workflow_id.trim().is_empty() {
            violations.push("workflow_id must not be empty".to_string());
        }
        if self.game_ids.is_empty() {
            violations.push("game_ids must not be empty".to_string());
        }
        if self.game_ids.iter().any(|id| id.trim().is_empty()) {
            violations.push("game_ids must not contain empty ids".to_string());
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            violations.push(format!(
                "quality_threshold must be between 0.0 and 1.0, got {}",
                self.quality_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.failure_threshold) {
            violations.push(format!(
                "backoff.failure_threshold must be between 0.0 and 1.0, got {}",
                self.backoff.failure_threshold
            ));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            violations.push(format!(
                "backoff.max_delay_ms ({}) must be >= backoff.base_delay_ms ({})",
                self.backoff.max_delay_ms, self.backoff.base_delay_ms
            ));
        }
        if self.concurrency.max_concurrent_games == 0 {
            violations.push("concurrency.max_concurrent_games must be at least 1".to_string());
        }
        if self.concurrency.max_concurrent_stages == 0 {
            violations.push("concurrency.max_concurrent_stages must be at least 1".to_string());
        }
        if self.timeouts.per_game_ms == 0 {
            violations.push("timeouts.per_game_ms must be greater than 0".to_string());
        }
        if self.timeouts.total_ms == 0 {
            violations.push("timeouts.total_ms must be greater than 0".to_string());
        }
        if self.enable_structured_data && self.structured_data_types.is_empty() {
            violations.push(
                "structured_data_types must not be empty when structured data is enabled"
                    .to_string(),
            );
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Configuration(violations))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
