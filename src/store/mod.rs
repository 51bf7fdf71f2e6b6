//! Local Cache Store
//!
//! The single persistence boundary shared by read caching and write
//! queueing. [`LocalStore`] owns the SQLite connection; [`CacheStore`] is the
//! cloneable async handle every other component holds.
//!
//! Failures of the cache half are reported as `SyncError::CacheUnavailable`
//! and callers are expected to fall through to the live path. Failures of the
//! pending queue must be surfaced: losing a queued write silently breaks
//! offline durability.

pub mod local;

pub use local::{
    cache_key, CacheEntry, CacheStats, LocalStore, NewOperation, OperationType,
    PendingOperation, QueueConfig, QueueStats,
};

use crate::error::{SyncError, SyncResult};
use crate::model::{Document, QueryParams};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Why a replayed operation did not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayFailure {
    /// Keep the operation queued and count the attempt.
    Retry(String),
    /// Drop the operation; it will never apply.
    Discard(String),
}

/// Outcome counts of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    pub discarded: usize,
}

impl DrainReport {
    pub fn merge(&mut self, other: DrainReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.discarded += other.discarded;
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded + self.failed + self.discarded == 0
    }
}

#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Mutex<LocalStore>>,
}

impl CacheStore {
    pub fn new(store: LocalStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Cache a query result. Every record must carry a non-empty `id`.
    pub async fn put(
        &self,
        collection_path: &str,
        query_params: Option<&QueryParams>,
        data: &[Document],
        ttl: Duration,
    ) -> SyncResult<()> {
        if let Some(bad) = data.iter().find(|doc| doc.id.is_empty()) {
            return Err(SyncError::Validation(format!(
                "cannot cache record without id in {} ({} fields)",
                collection_path,
                bad.fields.len()
            )));
        }

        let mut store = self.inner.lock().await;
        store.put_entry(collection_path, query_params, data, ttl)
    }

    /// Cached data for the query, or `None` when absent or expired.
    pub async fn get(
        &self,
        collection_path: &str,
        query_params: Option<&QueryParams>,
    ) -> SyncResult<Option<Vec<Document>>> {
        let mut store = self.inner.lock().await;
        store.get_entry(collection_path, query_params)
    }

    pub async fn entry(&self, cache_key: &str) -> SyncResult<Option<CacheEntry>> {
        self.inner.lock().await.entry(cache_key)
    }

    pub async fn sweep_expired(&self) -> SyncResult<usize> {
        let deleted = self.inner.lock().await.sweep_expired()?;
        if deleted > 0 {
            debug!("Cache sweep removed {} expired entries", deleted);
        }
        Ok(deleted)
    }

    pub async fn invalidate_collection(&self, collection_path: &str) -> SyncResult<usize> {
        self.inner.lock().await.invalidate_collection(collection_path)
    }

    pub async fn cache_stats(&self) -> SyncResult<CacheStats> {
        self.inner.lock().await.cache_stats()
    }

    /// Append an operation to the pending queue. Returns its id.
    pub async fn enqueue(&self, operation: NewOperation) -> SyncResult<i64> {
        let id = self.inner.lock().await.add_pending(&operation)?;
        debug!(
            "Queued {} on {} (pending id {})",
            operation.operation_type, operation.collection_path, id
        );
        Ok(id)
    }

    pub async fn pending_operations(&self) -> SyncResult<Vec<PendingOperation>> {
        self.inner.lock().await.pending_operations()
    }

    pub async fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.inner.lock().await.queue_stats()?.count)
    }

    pub async fn queue_stats(&self) -> SyncResult<QueueStats> {
        self.inner.lock().await.queue_stats()
    }

    pub async fn clear_pending(&self) -> SyncResult<usize> {
        self.inner.lock().await.clear_pending()
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> SyncResult<()> {
        self.inner.lock().await.set_metadata(key, value)
    }

    pub async fn get_metadata(&self, key: &str) -> SyncResult<Option<String>> {
        self.inner.lock().await.get_metadata(key)
    }

    /// Replay every pending operation, oldest first.
    ///
    /// The store lock is released while `apply` runs. A failure on one
    /// operation never stops the ones after it. Must not run concurrently
    /// with itself; the write coordinator serializes drains.
    pub async fn drain_pending<F, Fut>(&self, mut apply: F) -> SyncResult<DrainReport>
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: Future<Output = Result<(), ReplayFailure>>,
    {
        let operations = self.pending_operations().await?;
        let mut report = DrainReport::default();

        for operation in operations {
            let id = operation.id;
            let outcome = apply(operation).await;

            let mut store = self.inner.lock().await;
            match outcome {
                Ok(()) => {
                    store.remove_pending(id)?;
                    report.succeeded += 1;
                }
                Err(ReplayFailure::Retry(reason)) => {
                    store.increment_attempts(id)?;
                    report.failed += 1;
                    debug!("Pending operation {} stays queued: {}", id, reason);
                }
                Err(ReplayFailure::Discard(reason)) => {
                    store.remove_pending(id)?;
                    report.discarded += 1;
                    warn!("Pending operation {} discarded: {}", id, reason);
                }
            }
        }

        if !report.is_empty() {
            let mut store = self.inner.lock().await;
            let now = store.now_millis();
            store.set_metadata("last_drain_at", &now.to_string())?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn create_store() -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let local = LocalStore::open_in_memory(clock.clone()).unwrap();
        (CacheStore::new(local), clock)
    }

    fn update(doc_id: &str) -> NewOperation {
        NewOperation {
            operation_type: OperationType::Update,
            collection_path: "trips".to_string(),
            doc_id: Some(doc_id.to_string()),
            data: json!({"status": "active"}).as_object().cloned(),
        }
    }

    #[tokio::test]
    async fn test_drain_orders_by_timestamp() {
        let (store, clock) = create_store();
        for doc in ["a", "b", "c"] {
            store.enqueue(update(doc)).await.unwrap();
            clock.advance(Duration::from_millis(10));
        }

        let seen = StdMutex::new(Vec::new());
        let report = store
            .drain_pending(|op| {
                seen.lock().unwrap().push(op.doc_id.clone().unwrap());
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(report.succeeded, 3);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert!(store.get_metadata("last_drain_at").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_drain_discard_removes_operation() {
        let (store, _clock) = create_store();
        store.enqueue(update("a")).await.unwrap();

        let report = store
            .drain_pending(|_| async { Err(ReplayFailure::Discard("not-found".to_string())) })
            .await
            .unwrap();

        assert_eq!(
            report,
            DrainReport {
                succeeded: 0,
                failed: 0,
                discarded: 1
            }
        );
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_rejects_records_without_id() {
        let (store, _clock) = create_store();
        let bad = Document::new("", serde_json::Map::new());

        let err = store
            .put("trips", None, &[bad], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_empty_drain_leaves_no_metadata() {
        let (store, _clock) = create_store();
        let report = store.drain_pending(|_| async { Ok(()) }).await.unwrap();
        assert!(report.is_empty());
        assert!(store.get_metadata("last_drain_at").await.unwrap().is_none());
    }
}
