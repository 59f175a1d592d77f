//! Collaborator interfaces consumed by the stage runner.
//!
//! Content generation, data access, structured-data building, quality
//! scoring, and result persistence are external concerns. The runner
//! only sees these traits; real implementations are injected at service
//! construction and [`crate::stub`] provides deterministic in-process
//! ones for local runs and tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use loregen_core::config::{ConcurrencyLimits, OutputFormat};
use loregen_core::types::FlowId;

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

/// Error raised by a stage executor or collaborator.
///
/// Never propagates past the stage runner: it is converted into flow
/// error entries plus a retry decision.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StageError {
    /// Coarse classification, e.g. `"generation_error"`, `"timeout"`.
    pub error_type: String,
    pub message: String,
    /// Set when the failure concerns a single game rather than the stage.
    pub game_id: Option<String>,
}

impl StageError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            game_id: None,
        }
    }

    pub fn for_game(mut self, game_id: impl Into<String>) -> Self {
        self.game_id = Some(game_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A generation workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    /// Prompt template the generator expands per game.
    pub prompt_template: String,
}

/// One raw game record loaded for generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameData {
    pub id: String,
    pub title: String,
    pub data: serde_json::Value,
}

/// Generated content for one game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub game_id: String,
    pub body: String,
    pub tokens_used: u64,
    pub api_calls: u64,
}

/// A per-game failure inside an otherwise successful generation batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    pub game_id: String,
    pub error_type: String,
    pub message: String,
}

/// Output of one `content_generation` run. Partial failure is normal:
/// the quality gate decides whether the batch as a whole passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationBatch {
    pub contents: Vec<GeneratedContent>,
    pub failures: Vec<ItemFailure>,
}

/// Structured data derived from generated content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredData {
    pub game_id: String,
    pub kind: String,
    pub value: serde_json::Value,
}

/// Per-game quality score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityDetail {
    pub game_id: String,
    pub score: f64,
    pub passed: bool,
}

/// Quality gate verdict over a generated batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    pub average_score: f64,
    pub details: Vec<QualityDetail>,
}

/// The final artifact handed to the result sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub flow_id: FlowId,
    pub workflow_id: String,
    pub output_format: OutputFormat,
    pub contents: Vec<GeneratedContent>,
    pub structured: Vec<StructuredData>,
    pub report: Option<QualityReport>,
}

// ---------------------------------------------------------------------------
// Generation request
// ---------------------------------------------------------------------------

/// Progress notification sent by a generator as items finish.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub game_id: String,
    pub succeeded: bool,
}

/// Everything a generator needs for one `content_generation` run.
pub struct GenerationRequest<'a> {
    pub workflow: &'a Workflow,
    pub games: &'a [GameData],
    pub concurrency: &'a ConcurrencyLimits,
    /// Per-game processing bound; exceeding it fails that item only.
    pub per_game_timeout: Duration,
    /// Cooperative cancellation: generators should stop early when
    /// triggered, returning whatever they have or an error.
    pub cancel: CancellationToken,
    /// Item-completion notifications for throttled progress events.
    pub progress: mpsc::UnboundedSender<ItemOutcome>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of workflow definitions; consulted in `preparing`.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get(&self, workflow_id: &str) -> Result<Option<Workflow>, StageError>;
}

/// Source of game records; consulted in `data_loading`.
#[async_trait]
pub trait GameDataRepository: Send + Sync {
    async fn load(&self, ids: &[String]) -> Result<Vec<GameData>, StageError>;
}

/// Content generator; drives `content_generation`. May retry or time
/// out internally per item, bounded by the request's concurrency limits.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<GenerationBatch, StageError>;
}

/// Builds structured data from generated content; drives
/// `structured_data_generation`. Items without derivable structured
/// data are simply omitted from the result.
#[async_trait]
pub trait StructuredDataBuilder: Send + Sync {
    async fn build(
        &self,
        contents: &[GeneratedContent],
        requested_types: &[String],
    ) -> Result<Vec<StructuredData>, StageError>;
}

/// Pass/fail decision over a generated batch; drives `quality_validation`.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn evaluate(
        &self,
        contents: &[GeneratedContent],
        threshold: f64,
    ) -> Result<QualityReport, StageError>;
}

/// Persists the final artifact; drives `result_storage`.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, result: &FlowResult) -> Result<(), StageError>;
}

/// The full set of injected collaborators, cheaply cloneable.
#[derive(Clone)]
pub struct Collaborators {
    pub workflows: std::sync::Arc<dyn WorkflowRepository>,
    pub games: std::sync::Arc<dyn GameDataRepository>,
    pub generator: std::sync::Arc<dyn Generator>,
    pub structured_data: std::sync::Arc<dyn StructuredDataBuilder>,
    pub quality_gate: std::sync::Arc<dyn QualityGate>,
    pub result_sink: std::sync::Arc<dyn ResultSink>,
}
