//! The orchestrator facade.
//!
//! `FlowService` is the single entry point for every control operation:
//! submission, status queries, pause/resume/cancel, recovery, manual
//! intervention, and deletion. It owns the scheduler loop lifecycle via
//! explicit `start()`/`stop()`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loregen_core::config::FlowConfiguration;
use loregen_core::error::{CoreError, CoreResult};
use loregen_core::flow::{ErrorSeverity, FlowRecord, FlowStatus};
use loregen_core::flow_events::{
    EVENT_FLOW_CANCELLED, EVENT_FLOW_FAILED, EVENT_FLOW_PAUSED, EVENT_FLOW_QUEUED,
    EVENT_FLOW_RESUMED,
};
use loregen_core::queue::{compute_priority, QueueEntry};
use loregen_core::retry::ManualAction;
use loregen_core::types::FlowId;
use loregen_events::{FlowEvent, FlowEventBus};

use crate::collab::Collaborators;
use crate::context::FlowContext;
use crate::registry::FlowRegistry;
use crate::runner::{correct_format, StageRunner};
use crate::scheduler::{Scheduler, DEFAULT_TICK};
use crate::store::{CheckpointStore, FlowStore, MemoryCheckpointStore, MemoryFlowStore};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime tuning for the orchestrator.
#[derive(Debug, Clone)]
pub struct FlowServiceConfig {
    /// Flows admitted to execution at once.
    pub max_concurrent_flows: usize,
    /// Scheduler safety-net wakeup interval.
    pub scheduler_tick: Duration,
}

impl Default for FlowServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_flows: 3,
            scheduler_tick: DEFAULT_TICK,
        }
    }
}

/// Aggregate view returned by [`FlowService::queue_status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusSummary {
    pub total: usize,
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub queue: Vec<QueueEntry>,
}

// ---------------------------------------------------------------------------
// FlowService
// ---------------------------------------------------------------------------

pub struct FlowService {
    registry: Arc<FlowRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    runner: Arc<StageRunner>,
    scheduler: Scheduler,
    events: Arc<FlowEventBus>,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlowService {
    /// Construct with in-memory stores.
    pub fn new(
        collaborators: Collaborators,
        events: Arc<FlowEventBus>,
        config: FlowServiceConfig,
    ) -> Self {
        Self::with_stores(
            Arc::new(MemoryFlowStore::new()),
            Arc::new(MemoryCheckpointStore::new()),
            collaborators,
            events,
            config,
        )
    }

    /// Construct over injected stores.
    pub fn with_stores(
        flow_store: Arc<dyn FlowStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        collaborators: Collaborators,
        events: Arc<FlowEventBus>,
        config: FlowServiceConfig,
    ) -> Self {
        let registry = Arc::new(FlowRegistry::new(flow_store));
        let runner = Arc::new(StageRunner::new(
            Arc::clone(&registry),
            Arc::clone(&checkpoint_store),
            collaborators,
            Arc::clone(&events),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&runner),
            config.max_concurrent_flows,
            config.scheduler_tick,
        );
        Self {
            registry,
            checkpoints: checkpoint_store,
            runner,
            scheduler,
            events,
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// The event bus this service publishes on.
    pub fn events(&self) -> Arc<FlowEventBus> {
        Arc::clone(&self.events)
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Spawn the scheduler loop. Idempotent.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown.clone();
        *handle = Some(tokio::spawn(scheduler.run(shutdown)));
        info!("flow service started");
    }

    /// Stop the scheduler loop and wait for it to exit. Running flows
    /// are not cancelled; they settle on their own.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("flow service stopped");
    }

    // -- Submission and queries ----------------------------------------------

    /// Validate and accept a flow. Returns its id synchronously; stage
    /// execution happens in the background.
    pub async fn submit(&self, configuration: FlowConfiguration) -> CoreResult<FlowId> {
        self.submit_with_dependencies(configuration, Vec::new()).await
    }

    /// Submit a flow that must wait for the given flows to complete.
    pub async fn submit_with_dependencies(
        &self,
        configuration: FlowConfiguration,
        dependencies: Vec<FlowId>,
    ) -> CoreResult<FlowId> {
        configuration.validate()?;
        let priority = compute_priority(&configuration);
        let record = self.registry.create(configuration).await?;
        let id = record.id.clone();

        self.registry
            .mutate(&id, |r| r.set_status(FlowStatus::Queued, Utc::now()))
            .await?;

        let mut entry = QueueEntry::new(id.clone(), priority, Utc::now());
        entry.dependencies = dependencies;
        self.scheduler.enqueue(entry).await;

        self.events
            .publish(FlowEvent::new(EVENT_FLOW_QUEUED, id.clone()).with_payload(
                serde_json::json!({ "priority": priority }),
            ));
        info!(flow_id = %id, priority, "flow submitted");
        Ok(id)
    }

    /// Full record for one flow, `NotFound` if absent.
    pub async fn status(&self, id: &str) -> CoreResult<FlowRecord> {
        self.registry.require(id).await
    }

    pub async fn list_all(&self) -> CoreResult<Vec<FlowRecord>> {
        self.registry.list_all().await
    }

    /// Aggregate counts by status plus the pending queue in dispatch order.
    pub async fn queue_status(&self) -> CoreResult<QueueStatusSummary> {
        let records = self.registry.list_all().await?;
        let count = |s: FlowStatus| records.iter().filter(|r| r.status == s).count();
        Ok(QueueStatusSummary {
            total: records.len(),
            running: count(FlowStatus::Running),
            queued: count(FlowStatus::Queued),
            completed: count(FlowStatus::Completed),
            failed: count(FlowStatus::Failed),
            queue: self.scheduler.queue_snapshot().await,
        })
    }

    // -- Pause / resume / cancel ---------------------------------------------

    /// Request a pause. Only a running flow can pause; it takes effect at
    /// the next stage boundary. Returns `false` when not running.
    pub async fn pause(&self, id: &str) -> CoreResult<bool> {
        let paused = self
            .registry
            .mutate(id, |r| {
                if r.status != FlowStatus::Running {
                    return Ok(false);
                }
                r.set_status(FlowStatus::Paused, Utc::now())?;
                Ok(true)
            })
            .await?;
        if paused {
            self.events
                .publish(FlowEvent::new(EVENT_FLOW_PAUSED, id.to_string()));
            info!(flow_id = %id, "pause requested");
        }
        Ok(paused)
    }

    /// Re-admit a paused flow to the queue. It continues from its last
    /// completed stage. Returns `false` when not paused.
    pub async fn resume(&self, id: &str) -> CoreResult<bool> {
        let resumed = self
            .registry
            .mutate(id, |r| {
                if r.status != FlowStatus::Paused {
                    return Ok(None);
                }
                r.set_status(FlowStatus::Queued, Utc::now())?;
                Ok(Some(compute_priority(&r.metadata.configuration)))
            })
            .await?;
        let Some(priority) = resumed else {
            return Ok(false);
        };

        let mut entry = QueueEntry::new(id.to_string(), priority, Utc::now());
        entry.retry_count = 1;
        self.scheduler.enqueue(entry).await;
        self.events
            .publish(FlowEvent::new(EVENT_FLOW_RESUMED, id.to_string()));
        info!(flow_id = %id, "flow resumed");
        Ok(true)
    }

    /// Cancel a flow. Queued and paused flows settle immediately; a
    /// running flow receives a cooperative signal and settles at the next
    /// cancellation point. Returns `false` for flows already settled.
    pub async fn cancel(&self, id: &str) -> CoreResult<bool> {
        let record = self.registry.require(id).await?;
        match record.status {
            FlowStatus::Pending | FlowStatus::Queued | FlowStatus::Paused => {
                self.scheduler.remove(id).await;
                self.registry
                    .mutate(id, |r| {
                        if r.status.is_terminal() {
                            return Ok(());
                        }
                        r.set_status(FlowStatus::Cancelled, Utc::now())
                    })
                    .await?;
                self.runner.discard_parked(id).await;
                self.events
                    .publish(FlowEvent::new(EVENT_FLOW_CANCELLED, id.to_string()));
                info!(flow_id = %id, "flow cancelled");
                Ok(true)
            }
            FlowStatus::Running => {
                match self.scheduler.active_token(id).await {
                    Some(token) => token.cancel(),
                    // Not in the active set despite a running status; the
                    // runner settles it at the next boundary check.
                    None => warn!(flow_id = %id, "running flow has no active token"),
                }
                info!(flow_id = %id, "cancellation signalled");
                Ok(true)
            }
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled => Ok(false),
        }
    }

    // -- Recovery -------------------------------------------------------------

    /// Re-admit a failed flow. With a checkpoint it resumes after the
    /// checkpointed stage; without one it restarts from the first stage
    /// with fresh progress. Errors with `NotRecoverable` when the policy
    /// forbids recovery or the attempt budget is spent.
    pub async fn recover(&self, id: &str) -> CoreResult<bool> {
        let record = self.registry.require(id).await?;
        if record.status != FlowStatus::Failed {
            return Ok(false);
        }
        let policy = &record.metadata.configuration.recovery;
        if !policy.auto_recover {
            return Err(CoreError::NotRecoverable(format!(
                "flow {id} has recovery disabled"
            )));
        }
        if record.metadata.recovery_attempts >= policy.max_recovery_attempts {
            return Err(CoreError::NotRecoverable(format!(
                "flow {id} exhausted its {} recovery attempts",
                policy.max_recovery_attempts
            )));
        }

        let has_checkpoint = self.checkpoints.get(id).await?.is_some();
        let retry_count = self
            .registry
            .mutate(id, |r| {
                if has_checkpoint {
                    // Keep attempts and progress; the runner resumes from
                    // the checkpoint payload.
                    r.metadata.recovery_attempts += 1;
                    r.metadata.awaiting_manual_intervention = false;
                } else {
                    r.reset_for_restart();
                }
                r.set_status(FlowStatus::Queued, Utc::now())?;
                Ok(r.metadata.recovery_attempts)
            })
            .await?;

        let priority = compute_priority(&record.metadata.configuration);
        let mut entry = QueueEntry::new(id.to_string(), priority, Utc::now());
        entry.retry_count = retry_count;
        self.scheduler.enqueue(entry).await;
        self.events
            .publish(FlowEvent::new(EVENT_FLOW_QUEUED, id.to_string()).with_payload(
                serde_json::json!({ "recovered": true, "from_checkpoint": has_checkpoint }),
            ));
        info!(flow_id = %id, from_checkpoint = has_checkpoint, "flow recovery queued");
        Ok(true)
    }

    // -- Manual intervention ---------------------------------------------------

    /// Resolve a flow flagged for manual intervention.
    ///
    /// `edits` carries operator-provided replacement bodies for
    /// [`ManualAction::AcceptManualEdit`], as a `{game_id: body}` object.
    /// Returns `false` when the flow is not awaiting intervention.
    pub async fn resolve_manual_intervention(
        &self,
        id: &str,
        action: ManualAction,
        edits: Option<serde_json::Value>,
    ) -> CoreResult<bool> {
        let record = self.registry.require(id).await?;
        if !record.metadata.awaiting_manual_intervention {
            return Ok(false);
        }
        let failed_stage = record
            .current_stage
            .ok_or_else(|| CoreError::Internal(format!("flow {id} has no current stage")))?;

        if action == ManualAction::Abort {
            self.registry
                .mutate(id, |r| {
                    r.metadata.awaiting_manual_intervention = false;
                    r.record_error(
                        failed_stage,
                        None,
                        "user aborted",
                        ErrorSeverity::Critical,
                        Utc::now(),
                    );
                    Ok(())
                })
                .await?;
            self.runner.discard_parked(id).await;
            self.events.publish(
                FlowEvent::new(EVENT_FLOW_FAILED, id.to_string())
                    .with_stage(failed_stage.as_str())
                    .with_payload(serde_json::json!({ "message": "user aborted" })),
            );
            info!(flow_id = %id, "manual intervention: aborted by operator");
            return Ok(true);
        }

        // Rebuild the working context: parked wins, then checkpoint.
        let mut context = match self.runner.take_parked(id).await {
            Some(context) => context,
            None => match self.checkpoints.get(id).await? {
                Some(checkpoint) => FlowContext::from_checkpoint(&checkpoint)?,
                None => FlowContext::default(),
            },
        };

        match action {
            ManualAction::SkipValidation => {
                if let Some(report) = context.report.as_mut() {
                    report.passed = true;
                } else {
                    context.report = Some(crate::collab::QualityReport {
                        passed: true,
                        average_score: 0.0,
                        details: Vec::new(),
                    });
                }
            }
            ManualAction::ForceRepair => {
                correct_format(&mut context)
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
            }
            ManualAction::AcceptManualEdit => {
                if let Some(serde_json::Value::Object(map)) = edits {
                    for content in &mut context.contents {
                        if let Some(serde_json::Value::String(body)) = map.get(&content.game_id) {
                            content.body = body.clone();
                        }
                    }
                }
            }
            ManualAction::Abort => unreachable!("handled above"),
        }
        self.runner.park(id.to_string(), context).await;

        let message = format!("resolved manually: {}", action.as_str());
        self.registry
            .mutate(id, |r| {
                r.metadata.awaiting_manual_intervention = false;
                if let Some(last) = r.attempts.last_mut() {
                    last.message = Some(message.clone());
                    // Skip and accept treat the failed stage as settled;
                    // force_repair re-runs it.
                    if action != ManualAction::ForceRepair {
                        last.error = None;
                    }
                }
                if action != ManualAction::ForceRepair {
                    r.complete_stage(failed_stage, Utc::now());
                }
                r.set_status(FlowStatus::Queued, Utc::now())
            })
            .await?;

        let priority = compute_priority(&record.metadata.configuration);
        self.scheduler
            .enqueue(QueueEntry::new(id.to_string(), priority, Utc::now()))
            .await;
        self.events.publish(
            FlowEvent::new(EVENT_FLOW_RESUMED, id.to_string())
                .with_stage(failed_stage.as_str())
                .with_payload(serde_json::json!({ "manual_action": action.as_str() })),
        );
        info!(flow_id = %id, action = action.as_str(), "manual intervention resolved");
        Ok(true)
    }

    // -- Deletion --------------------------------------------------------------

    /// Remove every trace of a flow: queue entry, record, checkpoint, and
    /// any parked context. A running flow is signalled to cancel first.
    /// Idempotent; returns `true` if a record existed.
    pub async fn delete(&self, id: &str) -> CoreResult<bool> {
        if let Some(token) = self.scheduler.active_token(id).await {
            token.cancel();
        }
        self.scheduler.remove(id).await;
        self.runner.discard_parked(id).await;
        self.checkpoints.delete(id).await?;
        let existed = self.registry.delete(id).await?;
        if existed {
            info!(flow_id = %id, "flow deleted");
        }
        Ok(existed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
