//! Write coordinator and drain-on-reconnect task

use super::{
    stamp, validate_collection, validate_id, validate_payload, CoordinatorConfig, SubmitOutcome,
    SyncEvent,
};
use crate::clock::Clock;
use crate::connection::{ConnectionMonitor, ConnectionStatus, ErrorClassifier, ListenerGuard};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{CacheStore, DrainReport, NewOperation, OperationType, PendingOperation, ReplayFailure};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Background {
    task: JoinHandle<()>,
    /// Keeps the status listener registered; dropping it ends the task.
    _listener: ListenerGuard,
}

pub struct WriteCoordinator {
    store: CacheStore,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectionMonitor>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    /// Held for the duration of a drain
    drain_lock: Mutex<()>,
    /// Set when a drain was requested while another was running
    rerun: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    background: parking_lot::Mutex<Option<Background>>,
}

impl WriteCoordinator {
    pub fn new(
        store: CacheStore,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectionMonitor>,
        classifier: Arc<dyn ErrorClassifier>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            remote,
            monitor,
            classifier,
            clock,
            config,
            drain_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            events,
            background: parking_lot::Mutex::new(None),
        })
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn pending_count(&self) -> SyncResult<usize> {
        self.store.pending_count().await
    }

    /// Create (no `id`) or update (`id` given) a document.
    pub async fn submit(
        &self,
        collection: &str,
        data: Value,
        id: Option<&str>,
    ) -> SyncResult<SubmitOutcome> {
        validate_collection(collection)?;
        if let Some(id) = id {
            validate_id(id)?;
        }
        let fields = validate_payload(data)?;

        let operation_type = if id.is_some() {
            OperationType::Update
        } else {
            OperationType::Create
        };
        let fields = stamp(fields, operation_type, self.clock.now());

        if self.monitor.is_connected() {
            let result = match id {
                Some(id) => self
                    .remote
                    .update(collection, id, fields.clone())
                    .await
                    .map(|_| id.to_string()),
                None => self.remote.create(collection, fields.clone()).await,
            };

            match result {
                Ok(id) => {
                    self.monitor.record_success();
                    debug!("Applied {} {}/{}", operation_type, collection, id);
                    return Ok(SubmitOutcome::Applied { id });
                }
                Err(e) => self.fallback(&e, collection)?,
            }
        }

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.enqueue(operation_type, collection, id, Some(fields)).await
    }

    /// Delete a document, with the same online/offline rule as `submit`.
    pub async fn remove(&self, collection: &str, id: &str) -> SyncResult<SubmitOutcome> {
        validate_collection(collection)?;
        validate_id(id)?;

        if self.monitor.is_connected() {
            match self.remote.delete(collection, id).await {
                Ok(()) => {
                    self.monitor.record_success();
                    debug!("Applied delete {}/{}", collection, id);
                    return Ok(SubmitOutcome::Applied { id: id.to_string() });
                }
                Err(e) => self.fallback(&e, collection)?,
            }
        }

        self.enqueue(OperationType::Delete, collection, id.to_string(), None)
            .await
    }

    /// Transient failures of a live write fall back to the queue; anything
    /// else is returned to the caller.
    fn fallback(&self, error: &RemoteError, collection: &str) -> SyncResult<()> {
        self.monitor.report_error(error);
        match self.classifier.classify(error) {
            ErrorKind::Transient => {
                info!("Write to {} failed in transit, queueing: {}", collection, error);
                Ok(())
            }
            kind => Err(SyncError::from_kind(kind, error.to_string())),
        }
    }

    async fn enqueue(
        &self,
        operation_type: OperationType,
        collection: &str,
        id: String,
        data: Option<Map<String, Value>>,
    ) -> SyncResult<SubmitOutcome> {
        let pending_id = self
            .store
            .enqueue(NewOperation {
                operation_type,
                collection_path: collection.to_string(),
                doc_id: Some(id.clone()),
                data,
            })
            .await?;
        Ok(SubmitOutcome::Queued { id, pending_id })
    }

    /// Replay the pending queue. Returns `None` when another drain is
    /// already running; that drain makes one more pass before it finishes.
    /// Nothing is replayed while the monitor is not connected.
    pub async fn drain(&self) -> SyncResult<Option<DrainReport>> {
        let mut total = DrainReport::default();
        let mut ran = false;
        loop {
            let Ok(guard) = self.drain_lock.try_lock() else {
                self.rerun.store(true, Ordering::SeqCst);
                if !ran {
                    debug!("Drain already running, scheduling another pass");
                    return Ok(None);
                }
                // The new holder clears the flag and replays.
                break;
            };
            ran = true;
            self.drain_passes(&mut total).await?;
            drop(guard);

            // A request that failed `try_lock` after the last pass.
            if !self.rerun.load(Ordering::SeqCst) || !self.monitor.is_connected() {
                break;
            }
        }

        if !total.is_empty() {
            info!(
                "Drain finished: {} applied, {} retained, {} discarded",
                total.succeeded, total.failed, total.discarded
            );
        }
        let _ = self.events.send(SyncEvent::Drained(total));
        Ok(Some(total))
    }

    /// Runs under `drain_lock` until no further pass is requested.
    async fn drain_passes(&self, total: &mut DrainReport) -> SyncResult<()> {
        loop {
            if !self.monitor.is_connected() {
                debug!("Not connected, drain skipped");
                return Ok(());
            }
            self.rerun.store(false, Ordering::SeqCst);

            let reported = &AtomicBool::new(false);
            let report = self
                .store
                .drain_pending(move |operation| self.replay(operation, reported))
                .await?;
            total.merge(report);

            if !self.rerun.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn replay(
        &self,
        operation: PendingOperation,
        reported: &AtomicBool,
    ) -> Result<(), ReplayFailure> {
        if operation.attempts >= self.config.max_replay_attempts {
            let reason = format!("gave up after {} attempts", operation.attempts);
            self.discarded(&operation, &reason);
            return Err(ReplayFailure::Discard(reason));
        }

        let collection = operation.collection_path.as_str();
        let now = self.clock.now();
        let result = match (operation.operation_type, operation.doc_id.as_deref()) {
            (OperationType::Create, Some(id)) => {
                let fields = stamp(operation.data.clone().unwrap_or_default(), OperationType::Create, now);
                self.remote.set(collection, id, fields).await
            }
            (OperationType::Create, None) => {
                let fields = stamp(operation.data.clone().unwrap_or_default(), OperationType::Create, now);
                self.remote.create(collection, fields).await.map(|_| ())
            }
            (OperationType::Update, Some(id)) => {
                let fields = stamp(operation.data.clone().unwrap_or_default(), OperationType::Update, now);
                self.remote.update(collection, id, fields).await
            }
            (OperationType::Delete, Some(id)) => match self.remote.delete(collection, id).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
            (_, None) => {
                let reason = format!("{} without document id", operation.operation_type);
                self.discarded(&operation, &reason);
                return Err(ReplayFailure::Discard(reason));
            }
        };

        match result {
            Ok(()) => {
                self.monitor.record_success();
                Ok(())
            }
            Err(e) => match self.classifier.classify(&e) {
                ErrorKind::Transient => {
                    if !reported.swap(true, Ordering::SeqCst) {
                        self.monitor.report_error(&e);
                    }
                    Err(ReplayFailure::Retry(e.to_string()))
                }
                _ => {
                    let reason = e.to_string();
                    self.discarded(&operation, &reason);
                    Err(ReplayFailure::Discard(reason))
                }
            },
        }
    }

    fn discarded(&self, operation: &PendingOperation, reason: &str) {
        warn!(
            "Dropping queued {} on {}: {}",
            operation.operation_type, operation.collection_path, reason
        );
        let _ = self.events.send(SyncEvent::ReplayDiscarded {
            pending_id: operation.id,
            operation_type: operation.operation_type,
            collection: operation.collection_path.clone(),
            doc_id: operation.doc_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Drain on every transition into `Connected`.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let drain_on_start = self.config.drain_on_start;
        let previous = parking_lot::Mutex::new(None::<ConnectionStatus>);

        let listener = self.monitor.on_status_changed(move |state| {
            let mut previous = previous.lock();
            let first = previous.is_none();
            let entered = state.status == ConnectionStatus::Connected
                && *previous != Some(ConnectionStatus::Connected);
            *previous = Some(state.status);

            if entered && (drain_on_start || !first) {
                let _ = tx.send(());
            }
        });

        let coordinator = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if let Err(e) = coordinator.drain().await {
                    error!("Drain failed: {}", e);
                }
            }
        });

        let previous = self.background.lock().replace(Background {
            task,
            _listener: listener,
        });
        if let Some(old) = previous {
            old.task.abort();
        }
        debug!("Write coordinator started");
    }

    pub fn stop(&self) {
        if let Some(background) = self.background.lock().take() {
            background.task.abort();
            debug!("Write coordinator stopped");
        }
    }
}
