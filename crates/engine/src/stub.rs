//! Deterministic in-process collaborators.
//!
//! These back local runs and the integration tests. They synthesize
//! plausible data instead of calling external services, and expose
//! enough knobs (scripted failures, per-item delay, fixed quality
//! scores) to drive every orchestration path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::collab::{
    Collaborators, FlowResult, GameData, GeneratedContent, GenerationBatch, GenerationRequest,
    Generator, GameDataRepository, ItemFailure, ItemOutcome, QualityDetail, QualityGate,
    QualityReport, ResultSink, StageError, StructuredData, StructuredDataBuilder, Workflow,
    WorkflowRepository,
};

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// Workflow source with a fixed set of definitions. When constructed
/// with [`StaticWorkflowRepository::new`] it synthesizes a definition
/// for any requested id; [`StaticWorkflowRepository::empty`] returns
/// `None` for unknown ids, which fails the `preparing` stage.
pub struct StaticWorkflowRepository {
    workflows: HashMap<String, Workflow>,
    synthesize_missing: bool,
}

impl StaticWorkflowRepository {
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
            synthesize_missing: true,
        }
    }

    pub fn empty() -> Self {
        Self {
            workflows: HashMap::new(),
            synthesize_missing: false,
        }
    }

    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflows.insert(workflow.id.clone(), workflow);
        self
    }
}

impl Default for StaticWorkflowRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowRepository for StaticWorkflowRepository {
    async fn get(&self, workflow_id: &str) -> Result<Option<Workflow>, StageError> {
        if let Some(workflow) = self.workflows.get(workflow_id) {
            return Ok(Some(workflow.clone()));
        }
        if self.synthesize_missing {
            return Ok(Some(Workflow {
                id: workflow_id.to_string(),
                name: format!("workflow {workflow_id}"),
                prompt_template: "Write lore for {title}.".to_string(),
            }));
        }
        Ok(None)
    }
}

/// Game source that synthesizes one record per requested id.
#[derive(Default)]
pub struct StaticGameDataRepository;

impl StaticGameDataRepository {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GameDataRepository for StaticGameDataRepository {
    async fn load(&self, ids: &[String]) -> Result<Vec<GameData>, StageError> {
        Ok(ids
            .iter()
            .map(|id| GameData {
                id: id.clone(),
                title: format!("Game {id}"),
                data: serde_json::json!({ "id": id }),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Generator that produces one content item per game.
///
/// `fail_first(n)` scripts the next `n` calls to fail with a
/// `generation_error`, which is how the tests exercise retry, backoff,
/// and manual-intervention paths.
pub struct StubGenerator {
    remaining_failures: AtomicU32,
    per_item_delay: Duration,
    slow_items: HashMap<String, Duration>,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self {
            remaining_failures: AtomicU32::new(0),
            per_item_delay: Duration::ZERO,
            slow_items: HashMap::new(),
        }
    }

    pub fn fail_first(self, n: u32) -> Self {
        self.remaining_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Simulated per-game work, mostly for exercising cancellation and
    /// progress throttling.
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.per_item_delay = delay;
        self
    }

    /// Override the simulated work time for one game, e.g. to drive a
    /// single item past its per-game timeout.
    pub fn with_slow_item(mut self, game_id: impl Into<String>, delay: Duration) -> Self {
        self.slow_items.insert(game_id.into(), delay);
        self
    }
}

impl Default for StubGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<GenerationBatch, StageError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StageError::new(
                "generation_error",
                "scripted generation failure",
            ));
        }

        let template = request.workflow.prompt_template.clone();
        let per_game_timeout = request.per_game_timeout;
        let concurrency = request.concurrency.max_concurrent_games.max(1);
        let games: Vec<GameData> = request.games.to_vec();

        // Bounded fan-out: a timed-out item fails alone, the batch goes on.
        let items = stream::iter(games)
            .map(|game| {
                let delay = self
                    .slow_items
                    .get(&game.id)
                    .copied()
                    .unwrap_or(self.per_item_delay);
                let template = template.clone();
                let progress = request.progress.clone();
                async move {
                    let work = async {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        GeneratedContent {
                            game_id: game.id.clone(),
                            body: template.replace("{title}", &game.title),
                            tokens_used: 128,
                            api_calls: 1,
                        }
                    };
                    let outcome = match tokio::time::timeout(per_game_timeout, work).await {
                        Ok(content) => Ok(content),
                        Err(_) => Err(ItemFailure {
                            game_id: game.id.clone(),
                            error_type: "timeout".to_string(),
                            message: format!("game {} exceeded its generation timeout", game.id),
                        }),
                    };
                    let _ = progress.send(ItemOutcome {
                        game_id: game.id,
                        succeeded: outcome.is_ok(),
                    });
                    outcome
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            outcomes = items => outcomes,
            _ = request.cancel.cancelled() => {
                return Err(StageError::new("cancelled", "generation cancelled"));
            }
        };

        let mut batch = GenerationBatch::default();
        for outcome in outcomes {
            match outcome {
                Ok(content) => batch.contents.push(content),
                Err(failure) => batch.failures.push(failure),
            }
        }
        Ok(batch)
    }
}

// ---------------------------------------------------------------------------
// Structured data, quality, result sink
// ---------------------------------------------------------------------------

/// Emits one structured record per content item and requested type.
#[derive(Default)]
pub struct PassThroughStructuredDataBuilder;

impl PassThroughStructuredDataBuilder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StructuredDataBuilder for PassThroughStructuredDataBuilder {
    async fn build(
        &self,
        contents: &[GeneratedContent],
        requested_types: &[String],
    ) -> Result<Vec<StructuredData>, StageError> {
        let mut out = Vec::new();
        for content in contents {
            for kind in requested_types {
                out.push(StructuredData {
                    game_id: content.game_id.clone(),
                    kind: kind.clone(),
                    value: serde_json::json!({ "source_length": content.body.len() }),
                });
            }
        }
        Ok(out)
    }
}

/// Quality gate that scores every item with the same fixed value.
pub struct FixedQualityGate {
    score: f64,
}

impl FixedQualityGate {
    pub fn new(score: f64) -> Self {
        Self { score }
    }

    /// A gate that passes any sensible threshold.
    pub fn passing() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl QualityGate for FixedQualityGate {
    async fn evaluate(
        &self,
        contents: &[GeneratedContent],
        threshold: f64,
    ) -> Result<QualityReport, StageError> {
        let details: Vec<QualityDetail> = contents
            .iter()
            .map(|c| QualityDetail {
                game_id: c.game_id.clone(),
                score: self.score,
                passed: self.score >= threshold,
            })
            .collect();
        let passed = !details.is_empty() && details.iter().all(|d| d.passed);
        Ok(QualityReport {
            passed,
            average_score: self.score,
            details,
        })
    }
}

/// Result sink that keeps saved artifacts in memory for inspection.
#[derive(Default)]
pub struct MemoryResultSink {
    saved: Mutex<Vec<FlowResult>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn saved(&self) -> Vec<FlowResult> {
        self.saved.lock().await.clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn save(&self, result: &FlowResult) -> Result<(), StageError> {
        self.saved.lock().await.push(result.clone());
        Ok(())
    }
}

/// A full collaborator set wired to the stubs, for local runs and tests.
pub fn stub_collaborators() -> Collaborators {
    Collaborators {
        workflows: Arc::new(StaticWorkflowRepository::new()),
        games: Arc::new(StaticGameDataRepository::new()),
        generator: Arc::new(StubGenerator::new()),
        structured_data: Arc::new(PassThroughStructuredDataBuilder::new()),
        quality_gate: Arc::new(FixedQualityGate::passing()),
        result_sink: Arc::new(MemoryResultSink::new()),
    }
}
