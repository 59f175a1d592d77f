//! Event-driven flow scheduler.
//!
//! Holds the priority queue and the set of actively running flows, and
//! admits the highest-priority eligible entry whenever a slot is free.
//! Wakeups are edge-triggered via `Notify` (submission, slot release)
//! with a periodic safety tick so a lost wakeup can only delay, never
//! strand, a queued flow.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use loregen_core::flow::FlowStatus;
use loregen_core::queue::{sort_queue, QueueEntry};
use loregen_core::types::FlowId;

use crate::registry::FlowRegistry;
use crate::runner::StageRunner;

/// Fallback wakeup interval when no notification arrives.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

struct Inner {
    registry: Arc<FlowRegistry>,
    runner: Arc<StageRunner>,
    queue: Mutex<Vec<QueueEntry>>,
    /// Cancellation token per actively running flow. Presence of a key
    /// doubles as the double-dispatch guard.
    active: Mutex<HashMap<FlowId, CancellationToken>>,
    max_concurrent: usize,
    notify: Notify,
    tick: Duration,
}

/// Cheaply cloneable scheduler handle.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<FlowRegistry>,
        runner: Arc<StageRunner>,
        max_concurrent: usize,
        tick: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                runner,
                queue: Mutex::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
                max_concurrent: max_concurrent.max(1),
                notify: Notify::new(),
                tick,
            }),
        }
    }

    /// Add an entry and wake the dispatch loop.
    pub async fn enqueue(&self, entry: QueueEntry) {
        let mut queue = self.inner.queue.lock().await;
        queue.push(entry);
        sort_queue(&mut queue);
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Remove a queued entry before it is dispatched. Returns `true` if
    /// the entry was present.
    pub async fn remove(&self, flow_id: &str) -> bool {
        let mut queue = self.inner.queue.lock().await;
        let before = queue.len();
        queue.retain(|e| e.flow_id != flow_id);
        queue.len() != before
    }

    /// Snapshot of the queue in dispatch order.
    pub async fn queue_snapshot(&self) -> Vec<QueueEntry> {
        self.inner.queue.lock().await.clone()
    }

    /// The cancellation token of a running flow, if it is running.
    pub async fn active_token(&self, flow_id: &str) -> Option<CancellationToken> {
        self.inner.active.lock().await.get(flow_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// The dispatch loop. Runs until `shutdown` is triggered; in-flight
    /// flows keep their own tokens and are not cancelled by shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(max_concurrent = self.inner.max_concurrent, "scheduler started");
        loop {
            self.dispatch_ready().await;
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(self.inner.tick) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("scheduler stopped");
    }

    /// Admit eligible entries until the queue is drained or all slots
    /// are taken.
    async fn dispatch_ready(&self) {
        loop {
            let ready = self.ready_dependencies().await;
            let dispatched = {
                let mut active = self.inner.active.lock().await;
                if active.len() >= self.inner.max_concurrent {
                    return;
                }
                let mut queue = self.inner.queue.lock().await;
                let position = queue.iter().position(|e| {
                    !active.contains_key(&e.flow_id)
                        && e.dependencies.iter().all(|d| ready.contains(d))
                });
                let Some(position) = position else { return };
                let entry = queue.remove(position);
                let token = CancellationToken::new();
                active.insert(entry.flow_id.clone(), token.clone());
                (entry, token)
            };

            let (entry, token) = dispatched;
            info!(flow_id = %entry.flow_id, priority = entry.priority, "dispatching flow");
            let scheduler = self.clone();
            tokio::spawn(async move {
                let flow_id = entry.flow_id;
                if let Err(e) = scheduler.inner.runner.run_flow(&flow_id, token).await {
                    error!(flow_id = %flow_id, error = %e, "flow run aborted by engine error");
                }
                scheduler.inner.active.lock().await.remove(&flow_id);
                scheduler.inner.notify.notify_one();
            });
        }
    }

    /// Flow ids whose records are `completed`, resolved from the union of
    /// all queued entries' dependencies. Entries with unsatisfied
    /// dependencies stay queued until their dependencies complete (or the
    /// entry is cancelled).
    async fn ready_dependencies(&self) -> HashSet<FlowId> {
        let dependency_ids: HashSet<FlowId> = {
            let queue = self.inner.queue.lock().await;
            queue
                .iter()
                .flat_map(|e| e.dependencies.iter().cloned())
                .collect()
        };

        let mut ready = HashSet::new();
        for id in dependency_ids {
            if let Ok(Some(record)) = self.inner.registry.get(&id).await {
                if record.status == FlowStatus::Completed {
                    ready.insert(id);
                }
            }
        }
        ready
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
