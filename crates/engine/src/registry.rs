//! The flow registry: single source of truth for flow records.
//!
//! Every component reads and writes flow state exclusively through this
//! registry; nothing holds a private copy of authoritative state.
//! Mutation is atomic per flow: a per-flow lock serializes
//! read-modify-write cycles so two mutations of the same flow never
//! interleave.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use loregen_core::config::FlowConfiguration;
use loregen_core::error::{CoreError, CoreResult};
use loregen_core::flow::FlowRecord;
use loregen_core::types::{new_flow_id, FlowId};

use crate::store::FlowStore;

/// Registry over an injectable [`FlowStore`].
pub struct FlowRegistry {
    store: Arc<dyn FlowStore>,
    /// Per-flow mutation locks. Entries are created lazily and removed
    /// on delete.
    locks: Mutex<HashMap<FlowId, Arc<Mutex<()>>>>,
}

impl FlowRegistry {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a fresh `pending` record from a configuration and persist it.
    pub async fn create(&self, configuration: FlowConfiguration) -> CoreResult<FlowRecord> {
        let record = FlowRecord::new(new_flow_id(), configuration);
        self.store.put(record.clone()).await?;
        Ok(record)
    }

    /// Fetch a record, `None` if absent.
    pub async fn get(&self, id: &str) -> CoreResult<Option<FlowRecord>> {
        self.store.get(id).await
    }

    /// Fetch a record or fail with `NotFound`.
    pub async fn require(&self, id: &str) -> CoreResult<FlowRecord> {
        self.get(id).await?.ok_or_else(|| CoreError::NotFound {
            entity: "Flow",
            id: id.to_string(),
        })
    }

    /// All known records, in no particular order.
    pub async fn list_all(&self) -> CoreResult<Vec<FlowRecord>> {
        self.store.scan().await
    }

    /// Atomic read-modify-write of one record.
    ///
    /// The closure runs under the flow's mutation lock; the modified
    /// record is persisted before the lock is released. Returns whatever
    /// the closure returns.
    pub async fn mutate<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FlowRecord) -> CoreResult<T> + Send,
    ) -> CoreResult<T> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.require(id).await?;
        let out = f(&mut record)?;
        self.store.put(record).await?;
        Ok(out)
    }

    /// Remove a record. Returns `true` if it existed.
    pub async fn delete(&self, id: &str) -> CoreResult<bool> {
        let removed = self.store.delete(id).await?;
        self.locks.lock().await.remove(id);
        Ok(removed)
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFlowStore;
    use loregen_core::flow::FlowStatus;

    fn registry() -> FlowRegistry {
        FlowRegistry::new(Arc::new(MemoryFlowStore::new()))
    }

    fn config() -> FlowConfiguration {
        FlowConfiguration::new("w1", vec!["g1".to_string()])
    }

    #[tokio::test]
    async fn create_assigns_unique_ids() {
        let registry = registry();
        let a = registry.create(config()).await.unwrap();
        let b = registry.create(config()).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.status, FlowStatus::Pending);
    }

    #[tokio::test]
    async fn require_missing_flow_is_not_found() {
        let registry = registry();
        let err = registry.require("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn mutate_persists_changes() {
        let registry = registry();
        let record = registry.create(config()).await.unwrap();
        let now = chrono::Utc::now();

        registry
            .mutate(&record.id, |r| r.set_status(FlowStatus::Queued, now))
            .await
            .unwrap();

        let got = registry.require(&record.id).await.unwrap();
        assert_eq!(got.status, FlowStatus::Queued);
    }

    #[tokio::test]
    async fn mutate_error_leaves_record_untouched() {
        let registry = registry();
        let record = registry.create(config()).await.unwrap();
        let now = chrono::Utc::now();

        // Pending -> Completed is invalid; the closure error aborts the write.
        let result = registry
            .mutate(&record.id, |r| r.set_status(FlowStatus::Completed, now))
            .await;
        assert!(result.is_err());

        let got = registry.require(&record.id).await.unwrap();
        assert_eq!(got.status, FlowStatus::Pending);
    }

    #[tokio::test]
    async fn concurrent_mutations_of_same_flow_serialize() {
        let registry = Arc::new(registry());
        let record = registry.create(config()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let registry = Arc::clone(&registry);
            let id = record.id.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .mutate(&id, |r| {
                        r.resources.api_calls += 1;
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let got = registry.require(&record.id).await.unwrap();
        assert_eq!(got.resources.api_calls, 20);
    }

    #[tokio::test]
    async fn delete_returns_true_then_false() {
        let registry = registry();
        let record = registry.create(config()).await.unwrap();

        assert!(registry.delete(&record.id).await.unwrap());
        assert!(!registry.delete(&record.id).await.unwrap());
        assert!(registry.get(&record.id).await.unwrap().is_none());
    }
}
