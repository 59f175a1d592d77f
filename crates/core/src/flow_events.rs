//! Event type constants for flow lifecycle notifications.
//!
//! Used by the engine when publishing to the event bus and by any
//! subscriber translating events for clients.

/// Flow accepted and placed in the scheduler queue.
pub const EVENT_FLOW_QUEUED: &str = "flow_queued";

/// Flow admitted to execution.
pub const EVENT_FLOW_STARTED: &str = "flow_started";

/// A stage began executing.
pub const EVENT_STAGE_STARTED: &str = "stage_started";

/// A stage completed successfully.
pub const EVENT_STAGE_COMPLETED: &str = "stage_completed";

/// A stage attempt failed (a retry may follow).
pub const EVENT_STAGE_FAILED: &str = "stage_failed";

/// A disabled stage was skipped.
pub const EVENT_STAGE_SKIPPED: &str = "stage_skipped";

/// Throttled item-level progress during a long-running stage.
pub const EVENT_FLOW_PROGRESS: &str = "flow_progress";

/// Flow reached `completed`.
pub const EVENT_FLOW_COMPLETED: &str = "flow_completed";

/// Flow reached `failed`.
pub const EVENT_FLOW_FAILED: &str = "flow_failed";

/// Flow was cancelled.
pub const EVENT_FLOW_CANCELLED: &str = "flow_cancelled";

/// Flow was paused at a stage boundary.
pub const EVENT_FLOW_PAUSED: &str = "flow_paused";

/// A paused flow was re-admitted to the queue.
pub const EVENT_FLOW_RESUMED: &str = "flow_resumed";

/// A failed flow is awaiting operator resolution.
pub const EVENT_MANUAL_INTERVENTION: &str = "manual_intervention_required";
