//! Domain error taxonomy.
//!
//! [`CoreError`] covers everything surfaced synchronously to callers of
//! the orchestrator facade. Stage executor failures are deliberately a
//! separate type ([`crate::retry`]'s `FailureRecord` carries them) and
//! never propagate past the stage runner.

use crate::types::FlowId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Submission rejected before any execution. Carries every violated
    /// constraint, not just the first.
    #[error("Configuration invalid: {}", .0.join("; "))]
    Configuration(Vec<String>),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: FlowId },

    /// `recover` invoked on a flow whose policy disallows it, or with a
    /// missing checkpoint when one was expected.
    #[error("Flow is not recoverable: {0}")]
    NotRecoverable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_joins_all_violations() {
        let err = CoreError::Configuration(vec![
            "workflow_id must not be empty".to_string(),
            "game_ids must not be empty".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("workflow_id must not be empty"));
        assert!(msg.contains("game_ids must not be empty"));
    }

    #[test]
    fn not_found_names_entity_and_id() {
        let err = CoreError::NotFound {
            entity: "Flow",
            id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "Entity not found: Flow with id abc-123");
    }
}
