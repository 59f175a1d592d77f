//! Checkpoint data types.
//!
//! A checkpoint records the last successfully completed stage and its
//! output payload. At most one checkpoint is retained per flow; each
//! successful stage overwrites the previous one.

use serde::{Deserialize, Serialize};

use crate::stage::Stage;
use crate::types::{FlowId, Timestamp};

/// The last successful stage output for one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flow_id: FlowId,
    /// The stage whose output this checkpoint holds.
    pub stage: Stage,
    /// Opaque stage output. The engine serializes its pipeline context
    /// here; nothing else interprets it.
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

impl Checkpoint {
    pub fn new(
        flow_id: FlowId,
        stage: Stage,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Self {
        Self {
            flow_id,
            stage,
            payload,
            created_at: now,
        }
    }

    /// The stage a recovered flow resumes at: the one *after* the
    /// checkpointed stage. `None` means the checkpoint covers the final
    /// stage and there is nothing left to run.
    pub fn resume_stage(&self) -> Option<Stage> {
        self.stage.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn resume_stage_is_the_following_stage() {
        let cp = Checkpoint::new(
            "f1".to_string(),
            Stage::ContentGeneration,
            serde_json::json!({"contents": []}),
            Utc::now(),
        );
        assert_eq!(cp.resume_stage(), Some(Stage::FormatCorrection));
    }

    #[test]
    fn final_stage_checkpoint_has_no_resume_stage() {
        let cp = Checkpoint::new(
            "f1".to_string(),
            Stage::ResultStorage,
            serde_json::Value::Null,
            Utc::now(),
        );
        assert_eq!(cp.resume_stage(), None);
    }

    #[test]
    fn checkpoint_roundtrips_through_json() {
        let cp = Checkpoint::new(
            "f1".to_string(),
            Stage::DataLoading,
            serde_json::json!({"games": ["g1", "g2"]}),
            Utc::now(),
        );
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.flow_id, "f1");
        assert_eq!(back.stage, Stage::DataLoading);
        assert_eq!(back.payload["games"][0], "g1");
    }
}
