//! In-flight execution state for one flow.
//!
//! The context accumulates each stage's output and is the exact payload
//! serialized into a checkpoint, so a recovered flow picks up with the
//! same intermediate data a live one would have.

use serde::{Deserialize, Serialize};

use loregen_core::checkpoint::Checkpoint;
use loregen_core::error::{CoreError, CoreResult};
use loregen_core::stage::Stage;
use loregen_core::types::{FlowId, Timestamp};

use crate::collab::{
    GameData, GeneratedContent, QualityReport, StructuredData, Workflow,
};

/// Formatting conventions detected from loaded game data, produced by
/// `format_analysis` and consumed by `format_correction`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatProfile {
    /// Dominant paragraph separator in source material.
    pub paragraph_separator: String,
    /// Whether source records consistently use markdown headings.
    pub uses_headings: bool,
    /// Average body length across loaded records, for trim heuristics.
    pub average_length: usize,
}

/// Mutable working state threaded through the stage executors.
///
/// Fields fill in pipeline order; a stage only ever reads fields that
/// earlier stages wrote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowContext {
    pub workflow: Option<Workflow>,
    pub games: Vec<GameData>,
    pub format: Option<FormatProfile>,
    pub contents: Vec<GeneratedContent>,
    pub structured: Vec<StructuredData>,
    pub report: Option<QualityReport>,
}

impl FlowContext {
    /// The workflow loaded in `preparing`, or an internal error if a
    /// later stage runs without it.
    pub fn workflow(&self) -> CoreResult<&Workflow> {
        self.workflow
            .as_ref()
            .ok_or_else(|| CoreError::Internal("context missing workflow".to_string()))
    }

    /// Serialize into a checkpoint taken after `stage` completed.
    pub fn to_checkpoint(
        &self,
        flow_id: FlowId,
        stage: Stage,
        now: Timestamp,
    ) -> CoreResult<Checkpoint> {
        let payload = serde_json::to_value(self)
            .map_err(|e| CoreError::Internal(format!("checkpoint serialization: {e}")))?;
        Ok(Checkpoint::new(flow_id, stage, payload, now))
    }

    /// Rebuild the context a checkpoint captured.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> CoreResult<Self> {
        serde_json::from_value(checkpoint.payload.clone())
            .map_err(|e| CoreError::Internal(format!("checkpoint deserialization: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
