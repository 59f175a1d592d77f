//! Injectable key-value stores for flow records and checkpoints.
//!
//! The engine only ever touches these traits, so a durable backend can
//! be substituted without changing the orchestrator facade. The bundled
//! in-memory implementations are sufficient for a single-process
//! deployment.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use loregen_core::checkpoint::Checkpoint;
use loregen_core::error::CoreResult;
use loregen_core::flow::FlowRecord;
use loregen_core::types::FlowId;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Durable storage contract for [`FlowRecord`]s, keyed by flow id.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get(&self, id: &str) -> CoreResult<Option<FlowRecord>>;
    async fn put(&self, record: FlowRecord) -> CoreResult<()>;
    /// Returns `true` if a record was removed.
    async fn delete(&self, id: &str) -> CoreResult<bool>;
    async fn scan(&self) -> CoreResult<Vec<FlowRecord>>;
}

/// Durable storage contract for [`Checkpoint`]s. At most one checkpoint
/// exists per flow; `put` overwrites.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, flow_id: &str) -> CoreResult<Option<Checkpoint>>;
    async fn put(&self, checkpoint: Checkpoint) -> CoreResult<()>;
    async fn delete(&self, flow_id: &str) -> CoreResult<bool>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// In-memory [`FlowStore`] backed by a `RwLock<HashMap>`.
#[derive(Default)]
pub struct MemoryFlowStore {
    inner: RwLock<HashMap<FlowId, FlowRecord>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn get(&self, id: &str) -> CoreResult<Option<FlowRecord>> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn put(&self, record: FlowRecord) -> CoreResult<()> {
        self.inner.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> CoreResult<bool> {
        Ok(self.inner.write().await.remove(id).is_some())
    }

    async fn scan(&self) -> CoreResult<Vec<FlowRecord>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }
}

/// In-memory [`CheckpointStore`] backed by a `RwLock<HashMap>`.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: RwLock<HashMap<FlowId, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, flow_id: &str) -> CoreResult<Option<Checkpoint>> {
        Ok(self.inner.read().await.get(flow_id).cloned())
    }

    async fn put(&self, checkpoint: Checkpoint) -> CoreResult<()> {
        self.inner
            .write()
            .await
            .insert(checkpoint.flow_id.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, flow_id: &str) -> CoreResult<bool> {
        Ok(self.inner.write().await.remove(flow_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
