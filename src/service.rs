//! Service wiring
//!
//! [`SyncService`] owns one instance of every component and their shared
//! lifecycle. Applications construct it once, call `init`, and hand out the
//! component accessors.

use crate::clock::{Clock, SystemClock};
use crate::config::{SyncConfig, APP_NAME};
use crate::connection::{ConnectionMonitor, ErrorClassifier, PatternClassifier};
use crate::error::SyncResult;
use crate::query::QueryCache;
use crate::remote::{NetworkControl, RemoteStore};
use crate::store::{CacheStore, LocalStore};
use crate::subscriptions::{AuthState, SubscriptionManager};
use crate::sync::WriteCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct SyncService {
    config: SyncConfig,
    store: CacheStore,
    monitor: Arc<ConnectionMonitor>,
    coordinator: Arc<WriteCoordinator>,
    queries: QueryCache,
    subscriptions: SubscriptionManager,
    disposed: AtomicBool,
}

impl SyncService {
    /// Open the local store named by the configuration and wire every
    /// component against `remote`.
    pub fn open<R>(config: SyncConfig, remote: Arc<R>, auth: Arc<dyn AuthState>) -> SyncResult<Self>
    where
        R: RemoteStore + 'static,
    {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let local = match &config.store.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                LocalStore::open(path, clock.clone())?
            }
            None => LocalStore::open_default(APP_NAME, clock.clone())?,
        };
        Ok(Self::with_store(config, local, remote, auth, clock))
    }

    /// Wire components around an already opened store.
    pub fn with_store<R>(
        config: SyncConfig,
        local: LocalStore,
        remote: Arc<R>,
        auth: Arc<dyn AuthState>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        R: RemoteStore + 'static,
    {
        let network: Arc<dyn NetworkControl> = remote.clone();
        let remote: Arc<dyn RemoteStore> = remote;
        let classifier: Arc<dyn ErrorClassifier> = Arc::new(PatternClassifier::default());

        let store = CacheStore::new(local.with_queue_config(config.store.queue_config()));
        let monitor = ConnectionMonitor::new(
            network,
            classifier.clone(),
            config.connection.monitor_config(),
        );
        let coordinator = WriteCoordinator::new(
            store.clone(),
            remote.clone(),
            monitor.clone(),
            classifier.clone(),
            clock,
            config.sync.clone(),
        );
        let queries = QueryCache::new(store.clone(), remote.clone(), monitor.clone())
            .with_default_ttl(config.store.default_ttl());
        let subscriptions = SubscriptionManager::new(remote, auth).with_classifier(classifier);

        Self {
            config,
            store,
            monitor,
            coordinator,
            queries,
            subscriptions,
            disposed: AtomicBool::new(false),
        }
    }

    /// Start the connection monitor, then the drain-on-reconnect task.
    pub async fn init(&self) {
        self.monitor.init().await;
        self.coordinator.start();
        info!("Sync service started");
    }

    /// Release every subscription and stop background work. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscriptions.unsubscribe_all();
        self.coordinator.stop();
        self.monitor.dispose();
        info!("Sync service disposed");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &Arc<WriteCoordinator> {
        &self.coordinator
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;
    use crate::remote::MemoryRemote;
    use crate::subscriptions::{StaticAuth, SubscriptionKey};

    #[tokio::test]
    async fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::default();
        config.store.path = Some(dir.path().join("nested").join("cache.db"));

        let service = SyncService::open(
            config,
            Arc::new(MemoryRemote::new()),
            Arc::new(StaticAuth::new(true)),
        )
        .unwrap();
        assert!(dir.path().join("nested").join("cache.db").exists());
        assert_eq!(service.monitor().status(), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let remote = Arc::new(MemoryRemote::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let local = LocalStore::open_in_memory(clock.clone()).unwrap();
        let service = SyncService::with_store(
            SyncConfig::default(),
            local,
            remote.clone(),
            Arc::new(StaticAuth::new(true)),
            clock,
        );
        service.init().await;
        assert_eq!(service.monitor().status(), ConnectionStatus::Connected);

        service
            .subscriptions()
            .subscribe(SubscriptionKey::collection("trips"))
            .unwrap();
        assert_eq!(remote.listener_count(), 1);

        service.dispose();
        service.dispose();
        assert_eq!(remote.listener_count(), 0);
        assert_eq!(service.monitor().listener_count(), 0);
    }
}
