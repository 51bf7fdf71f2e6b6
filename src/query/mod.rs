//! Query Cache Layer
//!
//! Stale-while-revalidate over the local store: serve the cached result
//! first, then attach a live listener when connectivity allows and write
//! every push back into the cache.

use crate::connection::ConnectionMonitor;
use crate::error::SyncError;
use crate::model::{decode_all, Document, Query, Record};
use crate::remote::{ListenCallback, ListenEvent, ListenerHandle, RemoteStore};
use crate::store::CacheStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub ttl: Duration,
    /// Contact the remote store after the cache read.
    pub revalidate: bool,
    /// Attach the live listener even when the monitor is not connected.
    pub listen_offline: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            revalidate: true,
            listen_offline: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<Vec<T>>,
    pub loading: bool,
    pub error: Option<SyncError>,
    pub from_cache: bool,
    pub revalidating: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: true,
            error: None,
            from_cache: false,
            revalidating: false,
        }
    }
}

#[derive(Clone)]
pub struct QueryCache {
    store: CacheStore,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectionMonitor>,
    default_ttl: Duration,
}

impl QueryCache {
    pub fn new(
        store: CacheStore,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectionMonitor>,
    ) -> Self {
        Self {
            store,
            remote,
            monitor,
            default_ttl: Duration::from_secs(300),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Options carrying the configured TTL.
    pub fn options(&self) -> QueryOptions {
        QueryOptions {
            ttl: self.default_ttl,
            ..QueryOptions::default()
        }
    }

    fn live_allowed(&self, options: &QueryOptions) -> bool {
        options.revalidate && (options.listen_offline || self.monitor.is_connected())
    }

    /// Cache read that never fails: storage errors and undecodable payloads
    /// count as a miss.
    async fn read_cache<T: Record>(&self, query: &Query) -> Option<Vec<T>> {
        let params = query.params();
        match self.store.get(&query.collection, Some(&params)).await {
            Ok(Some(documents)) => match decode_all::<T>(&documents) {
                Ok(records) => Some(records),
                Err(e) => {
                    debug!("Cached {} no longer decodes, ignoring: {}", query.collection, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read for {} failed, falling through: {}", query.collection, e);
                None
            }
        }
    }

    /// Streaming variant: a [`LiveQuery`] whose state follows the cache and
    /// then every server push.
    pub async fn watch<T: Record>(&self, query: Query, options: QueryOptions) -> LiveQuery<T> {
        let mut initial = QueryState::default();
        if let Some(records) = self.read_cache::<T>(&query).await {
            initial.data = Some(records);
            initial.loading = false;
            initial.from_cache = true;
        }

        if !self.live_allowed(&options) {
            initial.loading = false;
            let (_, rx) = watch::channel(initial);
            debug!("Query on {} served without live listener", query.collection);
            return LiveQuery::detached(rx);
        }

        initial.revalidating = true;
        let (tx, rx) = watch::channel(initial);
        let tx = Arc::new(tx);

        let writer = self.spawn_cache_writer(&query, options.ttl);
        let callback = self.live_callback::<T>(tx.clone(), writer);

        match self.remote.listen(&query, callback) {
            Ok(handle) => {
                debug!("Live query attached on {}", query.collection);
                LiveQuery::attached(rx, handle)
            }
            Err(e) => {
                self.monitor.report_error(&e);
                let error = self.monitor.classify(&e);
                warn!("Live query on {} failed to attach: {}", query.collection, error);
                tx.send_modify(|state| {
                    state.error = Some(error);
                    state.loading = false;
                    state.revalidating = false;
                });
                LiveQuery::detached(rx)
            }
        }
    }

    /// One-shot variant: cache read, then a single remote query when
    /// connectivity allows.
    pub async fn fetch<T: Record>(&self, query: &Query, options: QueryOptions) -> QueryState<T> {
        let mut state = QueryState {
            loading: false,
            ..QueryState::default()
        };
        if let Some(records) = self.read_cache::<T>(query).await {
            state.data = Some(records);
            state.from_cache = true;
        }

        if !self.live_allowed(&options) {
            return state;
        }

        match self.remote.query(query).await {
            Ok(documents) => {
                self.monitor.record_success();
                match decode_all::<T>(&documents) {
                    Ok(records) => {
                        let params = query.params();
                        if let Err(e) = self
                            .store
                            .put(&query.collection, Some(&params), &documents, options.ttl)
                            .await
                        {
                            warn!("Cache write for {} failed: {}", query.collection, e);
                        }
                        state.data = Some(records);
                        state.from_cache = false;
                    }
                    Err(e) => state.error = Some(e),
                }
            }
            Err(e) => {
                self.monitor.report_error(&e);
                state.error = Some(self.monitor.classify(&e));
            }
        }
        state
    }

    /// Cache writes for one live query, applied in push order.
    fn spawn_cache_writer(&self, query: &Query, ttl: Duration) -> mpsc::UnboundedSender<Vec<Document>> {
        let (writer, mut pushes) = mpsc::unbounded_channel::<Vec<Document>>();
        let store = self.store.clone();
        let collection = query.collection.clone();
        let params = query.params();

        tokio::spawn(async move {
            while let Some(documents) = pushes.recv().await {
                if let Err(e) = store.put(&collection, Some(&params), &documents, ttl).await {
                    warn!("Cache write for {} failed: {}", collection, e);
                }
            }
        });
        writer
    }

    fn live_callback<T: Record>(
        &self,
        tx: Arc<watch::Sender<QueryState<T>>>,
        writer: mpsc::UnboundedSender<Vec<Document>>,
    ) -> ListenCallback {
        let monitor = self.monitor.clone();

        Arc::new(move |event| match event {
            ListenEvent::Changes(batch) => {
                monitor.record_success();
                match decode_all::<T>(&batch.documents) {
                    Ok(records) => {
                        let _ = writer.send(batch.documents);
                        tx.send_modify(|state| {
                            state.data = Some(records);
                            state.loading = false;
                            state.error = None;
                            state.from_cache = false;
                            state.revalidating = false;
                        });
                    }
                    Err(e) => tx.send_modify(|state| {
                        state.error = Some(e);
                        state.loading = false;
                        state.revalidating = false;
                    }),
                }
            }
            ListenEvent::Error(e) => {
                monitor.report_error(&e);
                let error = monitor.classify(&e);
                tx.send_modify(|state| {
                    state.error = Some(error);
                    state.loading = false;
                    state.revalidating = false;
                });
            }
        })
    }
}

/// Consumer side of a streaming query.
pub struct LiveQuery<T> {
    rx: watch::Receiver<QueryState<T>>,
    handle: Option<ListenerHandle>,
}

impl<T: Record> LiveQuery<T> {
    fn attached(rx: watch::Receiver<QueryState<T>>, handle: ListenerHandle) -> Self {
        Self {
            rx,
            handle: Some(handle),
        }
    }

    fn detached(rx: watch::Receiver<QueryState<T>>) -> Self {
        Self {
            rx,
            handle: None,
        }
    }

    pub fn state(&self) -> QueryState<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change. `false` once no more updates can come.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&QueryState<T>) -> bool,
    ) -> Option<QueryState<T>> {
        self.rx.wait_for(predicate).await.ok().map(|state| state.clone())
    }

    pub fn is_listening(&self) -> bool {
        self.handle.is_some()
    }

    /// Release the live listener. Later calls do nothing.
    pub fn dispose(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.unsubscribe();
            debug!("Live query released");
        }
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.unsubscribe();
        }
    }
}
