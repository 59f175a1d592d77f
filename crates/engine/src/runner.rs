//! Executes one flow through the stage pipeline.
//!
//! The runner owns everything that happens between `queued` and a
//! settled status: stage dispatch, retry/backoff, checkpointing, pause
//! parking, cancellation, and event publishing. It never holds flow
//! state privately; every observable mutation goes through the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loregen_core::config::FlowConfiguration;
use loregen_core::error::CoreResult;
use loregen_core::flow::{ErrorSeverity, FlowStatus};
use loregen_core::flow_events::{
    EVENT_FLOW_CANCELLED, EVENT_FLOW_COMPLETED, EVENT_FLOW_FAILED, EVENT_FLOW_PROGRESS,
    EVENT_FLOW_STARTED, EVENT_MANUAL_INTERVENTION, EVENT_STAGE_COMPLETED, EVENT_STAGE_FAILED,
    EVENT_STAGE_SKIPPED, EVENT_STAGE_STARTED,
};
use loregen_core::retry::{decide, RetryDecision, RetryPolicy, RetryState};
use loregen_core::stage::{progress_through, Stage, PIPELINE};
use loregen_core::types::FlowId;
use loregen_events::{FlowEvent, FlowEventBus};

use crate::collab::{Collaborators, FlowResult, GenerationRequest, StageError};
use crate::context::{FlowContext, FormatProfile};
use crate::registry::FlowRegistry;
use crate::store::CheckpointStore;

/// How one runner invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Paused,
    Cancelled,
    /// The flow was not in a runnable state when the runner picked it up
    /// (e.g. cancelled while still queued).
    Skipped,
}

/// Drives a single flow through [`PIPELINE`].
pub struct StageRunner {
    registry: Arc<FlowRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    collaborators: Collaborators,
    events: Arc<FlowEventBus>,
    /// In-flight contexts of paused or escalated flows, so resumption
    /// within this process keeps intermediate outputs without a
    /// checkpoint round trip.
    parked: Mutex<HashMap<FlowId, FlowContext>>,
}

impl StageRunner {
    pub fn new(
        registry: Arc<FlowRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        collaborators: Collaborators,
        events: Arc<FlowEventBus>,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            collaborators,
            events,
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Park an in-flight context for later resumption.
    pub async fn park(&self, flow_id: FlowId, context: FlowContext) {
        self.parked.lock().await.insert(flow_id, context);
    }

    /// Remove and return a parked context, if any.
    pub async fn take_parked(&self, flow_id: &str) -> Option<FlowContext> {
        self.parked.lock().await.remove(flow_id)
    }

    /// Drop any parked context without returning it.
    pub async fn discard_parked(&self, flow_id: &str) {
        self.parked.lock().await.remove(flow_id);
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run a queued flow to a settled outcome.
    ///
    /// Pause and cancellation are honored at stage boundaries; the
    /// cancellation token additionally interrupts backoff sleeps and
    /// cooperative collaborators mid-stage.
    pub async fn run_flow(&self, flow_id: &str, cancel: CancellationToken) -> CoreResult<RunOutcome> {
        let record = self.registry.require(flow_id).await?;
        if record.status != FlowStatus::Queued {
            info!(flow_id, status = %record.status, "flow not runnable, skipping dispatch");
            return Ok(RunOutcome::Skipped);
        }
        let config = record.metadata.configuration.clone();

        // Resolve where to start and with what intermediate state.
        let (mut context, start_stage) = match self.resolve_start(flow_id, &record).await? {
            Some(resolved) => resolved,
            None => {
                // The final stage already ran (checkpoint or parked
                // context covers it); nothing left to execute.
                self.registry
                    .mutate(flow_id, |r| {
                        r.set_status(FlowStatus::Running, Utc::now())?;
                        r.set_status(FlowStatus::Completed, Utc::now())
                    })
                    .await?;
                self.checkpoints.delete(flow_id).await?;
                self.publish(FlowEvent::new(EVENT_FLOW_COMPLETED, flow_id));
                return Ok(RunOutcome::Completed);
            }
        };

        self.registry
            .mutate(flow_id, |r| r.set_status(FlowStatus::Running, Utc::now()))
            .await?;
        self.publish(FlowEvent::new(EVENT_FLOW_STARTED, flow_id));
        info!(flow_id, start_stage = %start_stage, "flow started");

        let deadline = Instant::now() + Duration::from_millis(config.timeouts.total_ms);
        let policy = RetryPolicy::from(&config);
        let mut retry_state = RetryState::new(start_stage);

        for stage in PIPELINE.iter().copied().skip(start_stage.index()) {
            // Stage boundary: cancellation and pause take effect here.
            if cancel.is_cancelled() {
                return self.finish_cancelled(flow_id).await;
            }
            if self.registry.require(flow_id).await?.status == FlowStatus::Paused {
                info!(flow_id, stage = %stage, "flow paused at stage boundary");
                self.park(flow_id.to_string(), context).await;
                return Ok(RunOutcome::Paused);
            }

            if !stage.is_enabled(&config) {
                self.registry
                    .mutate(flow_id, |r| {
                        r.skip_stage(stage, Utc::now());
                        Ok(())
                    })
                    .await?;
                self.publish(FlowEvent::new(EVENT_STAGE_SKIPPED, flow_id).with_stage(stage.as_str()));
                continue;
            }

            // Attempt loop: retries re-enter here for the same stage.
            loop {
                self.registry
                    .mutate(flow_id, |r| {
                        r.begin_stage(stage, Utc::now());
                        Ok(())
                    })
                    .await?;
                self.publish(FlowEvent::new(EVENT_STAGE_STARTED, flow_id).with_stage(stage.as_str()));

                let attempt = match tokio::time::timeout_at(
                    deadline,
                    self.execute_stage(flow_id, stage, &config, &mut context, &cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        // The whole-flow budget is spent; retries cannot help.
                        let message = format!(
                            "flow exceeded its total timeout of {} ms",
                            config.timeouts.total_ms
                        );
                        self.registry
                            .mutate(flow_id, |r| {
                                r.fail_stage(Utc::now(), message.clone());
                                r.record_error(
                                    stage,
                                    None,
                                    message.clone(),
                                    ErrorSeverity::Critical,
                                    Utc::now(),
                                );
                                r.set_status(FlowStatus::Failed, Utc::now())
                            })
                            .await?;
                        self.publish(
                            FlowEvent::new(EVENT_FLOW_FAILED, flow_id)
                                .with_stage(stage.as_str())
                                .with_payload(serde_json::json!({
                                    "error_type": "timeout",
                                    "message": message,
                                })),
                        );
                        warn!(flow_id, stage = %stage, "flow exceeded its total timeout");
                        return Ok(RunOutcome::Failed);
                    }
                };

                match attempt {
                    Ok(()) => {
                        let overall = self
                            .registry
                            .mutate(flow_id, |r| {
                                r.complete_stage(stage, Utc::now());
                                Ok(r.progress.overall)
                            })
                            .await?;
                        self.publish(
                            FlowEvent::new(EVENT_STAGE_COMPLETED, flow_id)
                                .with_stage(stage.as_str())
                                .with_payload(serde_json::json!({ "overall": overall })),
                        );
                        info!(flow_id, stage = %stage, overall, "stage completed");

                        if config.recovery.save_checkpoints {
                            self.write_checkpoint(flow_id, stage, &context).await?;
                        }
                        break;
                    }
                    Err(err) if err.error_type == "cancelled" || cancel.is_cancelled() => {
                        return self.finish_cancelled(flow_id).await;
                    }
                    Err(err) => {
                        let decision = decide(
                            &policy,
                            &mut retry_state,
                            stage,
                            err.error_type.clone(),
                            err.message.clone(),
                            Utc::now(),
                        );
                        let failure = retry_state
                            .failures
                            .last()
                            .cloned()
                            .map(|f| vec![f])
                            .unwrap_or_default();
                        let severity = match decision {
                            RetryDecision::Abort => ErrorSeverity::Critical,
                            _ => ErrorSeverity::Warning,
                        };
                        self.registry
                            .mutate(flow_id, |r| {
                                r.fail_stage(Utc::now(), err.message.clone());
                                r.retry_history.extend(failure);
                                r.record_error(
                                    stage,
                                    err.game_id.clone(),
                                    err.message.clone(),
                                    severity,
                                    Utc::now(),
                                );
                                Ok(())
                            })
                            .await?;
                        self.publish(
                            FlowEvent::new(EVENT_STAGE_FAILED, flow_id)
                                .with_stage(stage.as_str())
                                .with_payload(serde_json::json!({
                                    "error_type": err.error_type,
                                    "message": err.message,
                                })),
                        );
                        warn!(
                            flow_id, stage = %stage,
                            error_type = %err.error_type,
                            message = %err.message,
                            "stage attempt failed"
                        );

                        match decision {
                            RetryDecision::Retry { delay } => {
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => {}
                                    _ = cancel.cancelled() => {
                                        return self.finish_cancelled(flow_id).await;
                                    }
                                }
                            }
                            RetryDecision::Abort => {
                                self.registry
                                    .mutate(flow_id, |r| r.set_status(FlowStatus::Failed, Utc::now()))
                                    .await?;
                                self.publish(
                                    FlowEvent::new(EVENT_FLOW_FAILED, flow_id)
                                        .with_stage(stage.as_str())
                                        .with_payload(serde_json::json!({
                                            "message": err.message,
                                        })),
                                );
                                return Ok(RunOutcome::Failed);
                            }
                            RetryDecision::ManualIntervention => {
                                self.registry
                                    .mutate(flow_id, |r| {
                                        r.set_status(FlowStatus::Failed, Utc::now())?;
                                        r.metadata.awaiting_manual_intervention = true;
                                        Ok(())
                                    })
                                    .await?;
                                // Keep the context so operator resolution can
                                // continue from the failure point.
                                self.park(flow_id.to_string(), context).await;
                                self.publish(
                                    FlowEvent::new(EVENT_MANUAL_INTERVENTION, flow_id)
                                        .with_stage(stage.as_str())
                                        .with_payload(serde_json::json!({
                                            "error_type": err.error_type,
                                            "message": err.message,
                                        })),
                                );
                                return Ok(RunOutcome::Failed);
                            }
                        }
                    }
                }
            }
        }

        // A pause requested while the final stage ran lands here; honor
        // it before the terminal transition.
        if self.registry.require(flow_id).await?.status == FlowStatus::Paused {
            info!(flow_id, "flow paused after the final stage");
            self.park(flow_id.to_string(), context).await;
            return Ok(RunOutcome::Paused);
        }

        self.registry
            .mutate(flow_id, |r| r.set_status(FlowStatus::Completed, Utc::now()))
            .await?;
        self.checkpoints.delete(flow_id).await?;
        self.discard_parked(flow_id).await;
        self.publish(FlowEvent::new(EVENT_FLOW_COMPLETED, flow_id));
        info!(flow_id, "flow completed");
        Ok(RunOutcome::Completed)
    }

    /// Pick the starting stage and context: a parked context wins, then a
    /// checkpoint, then a fresh start. Returns `None` when a checkpoint
    /// already covers the final stage.
    async fn resolve_start(
        &self,
        flow_id: &str,
        record: &loregen_core::flow::FlowRecord,
    ) -> CoreResult<Option<(FlowContext, Stage)>> {
        if let Some(context) = self.take_parked(flow_id).await {
            let stage = match record.last_completed_stage() {
                // Paused after the final stage: the pipeline already ran.
                Some(stage) => match stage.next() {
                    Some(next) => next,
                    None => return Ok(None),
                },
                None => record.current_stage.unwrap_or(PIPELINE[0]),
            };
            return Ok(Some((context, stage)));
        }

        if record.metadata.checkpoint_stage.is_some() {
            if let Some(checkpoint) = self.checkpoints.get(flow_id).await? {
                let context = FlowContext::from_checkpoint(&checkpoint)?;
                return Ok(match checkpoint.resume_stage() {
                    Some(stage) => Some((context, stage)),
                    None => None,
                });
            }
        }

        Ok(Some((FlowContext::default(), PIPELINE[0])))
    }

    async fn finish_cancelled(&self, flow_id: &str) -> CoreResult<RunOutcome> {
        self.registry
            .mutate(flow_id, |r| {
                if r.status == FlowStatus::Cancelled {
                    return Ok(());
                }
                r.set_status(FlowStatus::Cancelled, Utc::now())
            })
            .await?;
        self.discard_parked(flow_id).await;
        self.publish(FlowEvent::new(EVENT_FLOW_CANCELLED, flow_id));
        info!(flow_id, "flow cancelled");
        Ok(RunOutcome::Cancelled)
    }

    async fn write_checkpoint(
        &self,
        flow_id: &str,
        stage: Stage,
        context: &FlowContext,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let checkpoint = context.to_checkpoint(flow_id.to_string(), stage, now)?;
        self.checkpoints.put(checkpoint).await?;
        self.registry
            .mutate(flow_id, |r| {
                r.metadata.checkpoint_stage = Some(stage);
                r.metadata.last_saved_at = Some(now);
                Ok(())
            })
            .await
    }

    fn publish(&self, event: FlowEvent) {
        self.events.publish(event);
    }

    // -----------------------------------------------------------------------
    // Stage executors
    // -----------------------------------------------------------------------

    async fn execute_stage(
        &self,
        flow_id: &str,
        stage: Stage,
        config: &FlowConfiguration,
        context: &mut FlowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        match stage {
            Stage::Preparing => self.prepare(config, context).await,
            Stage::DataLoading => self.load_data(config, context).await,
            Stage::FormatAnalysis => analyze_format(context),
            Stage::ContentGeneration => self.generate(flow_id, config, context, cancel).await,
            Stage::FormatCorrection => correct_format(context),
            Stage::StructuredDataGeneration => self.build_structured(config, context).await,
            Stage::QualityValidation => self.validate_quality(config, context).await,
            Stage::ResultStorage => self.store_result(flow_id, config, context).await,
        }
    }

    async fn prepare(
        &self,
        config: &FlowConfiguration,
        context: &mut FlowContext,
    ) -> Result<(), StageError> {
        let workflow = self
            .collaborators
            .workflows
            .get(&config.workflow_id)
            .await?
            .ok_or_else(|| {
                StageError::new(
                    "workflow_not_found",
                    format!("workflow '{}' does not exist", config.workflow_id),
                )
            })?;
        context.workflow = Some(workflow);
        Ok(())
    }

    async fn load_data(
        &self,
        config: &FlowConfiguration,
        context: &mut FlowContext,
    ) -> Result<(), StageError> {
        let games = self.collaborators.games.load(&config.game_ids).await?;
        if games.is_empty() {
            return Err(StageError::new(
                "no_game_data",
                "no game records could be loaded",
            ));
        }
        context.games = games;
        Ok(())
    }

    async fn generate(
        &self,
        flow_id: &str,
        config: &FlowConfiguration,
        context: &mut FlowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let workflow = context
            .workflow()
            .map_err(|e| StageError::new("internal", e.to_string()))?
            .clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(self.progress_drain(
            flow_id.to_string(),
            config.game_ids.len() as u32,
            config.notifications.enable_progress_events,
            config.notifications.progress_update_interval_ms,
            rx,
        ));

        let outcome = self
            .collaborators
            .generator
            .generate(GenerationRequest {
                workflow: &workflow,
                games: &context.games,
                concurrency: &config.concurrency,
                per_game_timeout: Duration::from_millis(config.timeouts.per_game_ms),
                cancel: cancel.clone(),
                progress: tx,
            })
            .await;
        // Sender dropped with the request; the drain task finishes on its own.
        let _ = drain.await;

        let batch = outcome?;
        let tokens: u64 = batch.contents.iter().map(|c| c.tokens_used).sum();
        let api_calls: u64 = batch.contents.iter().map(|c| c.api_calls).sum();
        let failures = batch.failures.clone();
        let succeeded = batch.contents.len() as u32;
        let failed = batch.failures.len() as u32;

        self.registry
            .mutate(flow_id, |r| {
                r.resources.tokens_consumed += tokens;
                r.resources.api_calls += api_calls;
                r.progress.items_succeeded = succeeded;
                r.progress.items_failed = failed;
                r.progress.items_processed = succeeded + failed;
                for failure in &failures {
                    r.record_error(
                        Stage::ContentGeneration,
                        Some(failure.game_id.clone()),
                        failure.message.clone(),
                        ErrorSeverity::Warning,
                        Utc::now(),
                    );
                }
                Ok(())
            })
            .await
            .map_err(|e| StageError::new("internal", e.to_string()))?;

        if batch.contents.is_empty() {
            return Err(StageError::new(
                "generation_error",
                "all items failed during generation",
            ));
        }
        context.contents = batch.contents;
        Ok(())
    }

    /// Drains item-completion notifications, folding them into the
    /// record's progress counters and emitting throttled progress events.
    fn progress_drain(
        &self,
        flow_id: String,
        items_total: u32,
        emit_events: bool,
        interval_ms: u64,
        mut rx: mpsc::UnboundedReceiver<crate::collab::ItemOutcome>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        async move {
            let interval = Duration::from_millis(interval_ms.max(1));
            let mut last_emit: Option<Instant> = None;
            let mut processed = 0u32;
            let mut succeeded = 0u32;

            while let Some(outcome) = rx.recv().await {
                processed += 1;
                if outcome.succeeded {
                    succeeded += 1;
                }

                let stage_pct = if items_total == 0 {
                    100
                } else {
                    (processed * 100 / items_total).min(100)
                };
                let base = progress_through(Stage::FormatAnalysis);
                let overall =
                    base + Stage::ContentGeneration.weight() * stage_pct / 100;

                let updated = registry
                    .mutate(&flow_id, |r| {
                        r.progress.items_processed = processed;
                        r.progress.items_succeeded = succeeded;
                        r.progress.items_failed = processed - succeeded;
                        r.progress.current_stage = stage_pct;
                        r.progress.overall = r.progress.overall.max(overall);
                        Ok(r.progress.clone())
                    })
                    .await;

                let snapshot = match updated {
                    Ok(s) => s,
                    Err(_) => continue,
                };

                let due = last_emit.map_or(true, |t| t.elapsed() >= interval);
                if emit_events && (due || processed == items_total) {
                    last_emit = Some(Instant::now());
                    events.publish(
                        FlowEvent::new(EVENT_FLOW_PROGRESS, flow_id.clone())
                            .with_stage(Stage::ContentGeneration.as_str())
                            .with_payload(serde_json::json!({
                                "overall": snapshot.overall,
                                "current_stage": snapshot.current_stage,
                                "items_processed": snapshot.items_processed,
                                "items_succeeded": snapshot.items_succeeded,
                                "items_failed": snapshot.items_failed,
                                "items_total": snapshot.items_total,
                            })),
                    );
                }
            }
        }
    }

    async fn build_structured(
        &self,
        config: &FlowConfiguration,
        context: &mut FlowContext,
    ) -> Result<(), StageError> {
        context.structured = self
            .collaborators
            .structured_data
            .build(&context.contents, &config.structured_data_types)
            .await?;
        Ok(())
    }

    async fn validate_quality(
        &self,
        config: &FlowConfiguration,
        context: &mut FlowContext,
    ) -> Result<(), StageError> {
        let report = self
            .collaborators
            .quality_gate
            .evaluate(&context.contents, config.quality_threshold)
            .await?;
        let passed = report.passed;
        let average = report.average_score;
        context.report = Some(report);
        if !passed {
            return Err(StageError::new(
                "quality_below_threshold",
                format!(
                    "average quality {average:.2} below threshold {:.2}",
                    config.quality_threshold
                ),
            ));
        }
        Ok(())
    }

    async fn store_result(
        &self,
        flow_id: &str,
        config: &FlowConfiguration,
        context: &mut FlowContext,
    ) -> Result<(), StageError> {
        let result = FlowResult {
            flow_id: flow_id.to_string(),
            workflow_id: config.workflow_id.clone(),
            output_format: config.output_format,
            contents: context.contents.clone(),
            structured: context.structured.clone(),
            report: context.report.clone(),
        };
        self.collaborators.result_sink.save(&result).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pure format stages
// ---------------------------------------------------------------------------

/// Derive formatting conventions from the loaded game records.
fn analyze_format(context: &mut FlowContext) -> Result<(), StageError> {
    let bodies: Vec<String> = context
        .games
        .iter()
        .map(|g| g.data.to_string())
        .collect();
    let total_len: usize = bodies.iter().map(|b| b.len()).sum();
    let average = if bodies.is_empty() {
        0
    } else {
        total_len / bodies.len()
    };
    context.format = Some(FormatProfile {
        paragraph_separator: "\n\n".to_string(),
        uses_headings: bodies.iter().any(|b| b.contains('#')),
        average_length: average,
    });
    Ok(())
}

/// Normalize generated content against the analyzed format profile.
/// Also applied by the service when an operator requests a forced repair.
pub(crate) fn correct_format(context: &mut FlowContext) -> Result<(), StageError> {
    let separator = context
        .format
        .as_ref()
        .map(|f| f.paragraph_separator.clone())
        .unwrap_or_else(|| "\n\n".to_string());
    for content in &mut context.contents {
        let normalized = content
            .body
            .replace("\r\n", "\n")
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(&separator);
        content.body = normalized;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::GeneratedContent;

    #[test]
    fn format_analysis_detects_headings_and_average() {
        let mut context = FlowContext::default();
        context.games.push(crate::collab::GameData {
            id: "g1".to_string(),
            title: "A".to_string(),
            data: serde_json::json!({"lore": "# Heading"}),
        });
        analyze_format(&mut context).unwrap();

        let profile = context.format.unwrap();
        assert!(profile.uses_headings);
        assert!(profile.average_length > 0);
    }

    #[test]
    fn format_correction_normalizes_whitespace() {
        let mut context = FlowContext::default();
        context.format = Some(FormatProfile {
            paragraph_separator: "\n\n".to_string(),
            uses_headings: false,
            average_length: 10,
        });
        context.contents.push(GeneratedContent {
            game_id: "g1".to_string(),
            body: "  first paragraph \r\n\r\nsecond  \n\n\n\n".to_string(),
            tokens_used: 1,
            api_calls: 1,
        });

        correct_format(&mut context).unwrap();
        assert_eq!(context.contents[0].body, "first paragraph\n\nsecond");
    }
}
