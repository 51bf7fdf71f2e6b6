//! Collection Subscription Manager
//!
//! One live listener per key, either a whole collection or a single
//! document. Every non-empty change batch is turned into a complete
//! [`CollectionSnapshot`] rebuilt from the listener's full payload and handed
//! to the one callback registered for that key.
//!
//! Each listener delivers through a gate. Teardown closes the gate while
//! holding its lock, so a listener that has been replaced or unsubscribed
//! can never deliver again once the call returns, even if the remote store
//! is slow to detach it.

use crate::connection::{ErrorClassifier, PatternClassifier};
use crate::error::{SyncError, SyncResult};
use crate::model::{decode_all, ChangeBatch, ChangeKind, Document, Query, Record};
use crate::remote::{ListenCallback, ListenEvent, ListenerHandle, RemoteStore};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
    /// Every document of a collection.
    Collection(String),
    /// One document, e.g. the trip being edited.
    Document { collection: String, id: String },
}

impl SubscriptionKey {
    pub fn collection(name: impl Into<String>) -> Self {
        SubscriptionKey::Collection(name.into())
    }

    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        SubscriptionKey::Document {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn collection_name(&self) -> &str {
        match self {
            SubscriptionKey::Collection(name) => name,
            SubscriptionKey::Document { collection, .. } => collection,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKey::Collection(name) => f.write_str(name),
            SubscriptionKey::Document { collection, id } => write!(f, "{}/{}", collection, id),
        }
    }
}

/// Whether the current user may attach listeners.
pub trait AuthState: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

/// Auth flag set by the embedding application.
#[derive(Debug, Default)]
pub struct StaticAuth {
    authenticated: AtomicBool,
}

impl StaticAuth {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn set(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

impl AuthState for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

/// Full state of one subscription after a change batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
    pub key: SubscriptionKey,
    pub documents: Vec<Document>,
    /// Number of rebuilds since the key was first subscribed.
    pub version: u64,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

pub type SnapshotCallback = Arc<dyn Fn(&CollectionSnapshot) + Send + Sync>;

type Gate = Arc<ReentrantMutex<Cell<bool>>>;

struct ActiveSubscription {
    handle: ListenerHandle,
    gate: Gate,
}

impl ActiveSubscription {
    /// Waits for an in-flight delivery to finish.
    fn close(mut self) {
        {
            let open = self.gate.lock();
            open.set(false);
        }
        self.handle.unsubscribe();
    }
}

enum Target {
    Query(Query),
    Document { collection: String, id: String },
}

pub struct SubscriptionManager {
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthState>,
    classifier: Arc<dyn ErrorClassifier>,
    active: Mutex<HashMap<SubscriptionKey, ActiveSubscription>>,
    callbacks: Arc<Mutex<HashMap<SubscriptionKey, SnapshotCallback>>>,
    snapshots: Arc<Mutex<HashMap<SubscriptionKey, CollectionSnapshot>>>,
}

impl SubscriptionManager {
    pub fn new(remote: Arc<dyn RemoteStore>, auth: Arc<dyn AuthState>) -> Self {
        Self {
            remote,
            auth,
            classifier: Arc::new(PatternClassifier::default()),
            active: Mutex::new(HashMap::new()),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            snapshots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Register the snapshot callback for `key`, replacing any previous one.
    pub fn set_callback<F>(&self, key: SubscriptionKey, callback: F)
    where
        F: Fn(&CollectionSnapshot) + Send + Sync + 'static,
    {
        self.callbacks.lock().insert(key, Arc::new(callback));
    }

    /// Typed callback for a whole record collection. Snapshots that fail to
    /// decode are logged and skipped.
    pub fn on_collection<T, F>(&self, callback: F) -> SubscriptionKey
    where
        T: Record,
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::collection(T::COLLECTION);
        self.set_callback(key.clone(), move |snapshot| {
            match decode_all::<T>(&snapshot.documents) {
                Ok(records) => callback(records),
                Err(e) => warn!("Snapshot for {} skipped: {}", snapshot.key, e),
            }
        });
        key
    }

    /// Attach the listener for `key`, replacing any existing one.
    pub fn subscribe(&self, key: SubscriptionKey) -> SyncResult<()> {
        let target = match &key {
            SubscriptionKey::Collection(name) => Target::Query(Query::collection(name.clone())),
            SubscriptionKey::Document { collection, id } => Target::Document {
                collection: collection.clone(),
                id: id.clone(),
            },
        };
        self.attach(key, target)
    }

    /// Attach a collection key to a filtered query.
    pub fn subscribe_with(&self, key: SubscriptionKey, query: Query) -> SyncResult<()> {
        self.attach(key, Target::Query(query))
    }

    fn attach(&self, key: SubscriptionKey, target: Target) -> SyncResult<()> {
        if !self.auth.is_authenticated() {
            warn!("Refusing to subscribe to {}: not authenticated", key);
            return Err(SyncError::Precondition(format!(
                "subscription to {} requires an authenticated user",
                key
            )));
        }

        let previous = self.active.lock().remove(&key);
        if let Some(previous) = previous {
            previous.close();
            debug!("Replaced subscription {}", key);
        }

        let gate: Gate = Arc::new(ReentrantMutex::new(Cell::new(true)));
        let callback = self.delivery(key.clone(), gate.clone());

        let handle = match &target {
            Target::Query(query) => self.remote.listen(query, callback),
            Target::Document { collection, id } => {
                self.remote.listen_document(collection, id, callback)
            }
        }
        .map_err(|e| {
            let error = SyncError::from_kind(self.classifier.classify(&e), e.to_string());
            warn!("Subscription {} failed to attach: {}", key, error);
            error
        })?;

        let replaced = self
            .active
            .lock()
            .insert(key.clone(), ActiveSubscription { handle, gate });
        if let Some(replaced) = replaced {
            replaced.close();
        }
        info!("Subscribed to {}", key);
        Ok(())
    }

    fn delivery(&self, key: SubscriptionKey, gate: Gate) -> ListenCallback {
        let callbacks = self.callbacks.clone();
        let snapshots = self.snapshots.clone();

        Arc::new(move |event| {
            let open = gate.lock();
            if !open.get() {
                return;
            }

            match event {
                ListenEvent::Changes(batch) => {
                    if batch.is_empty() {
                        return;
                    }
                    let snapshot = {
                        let mut snapshots = snapshots.lock();
                        let version = snapshots.get(&key).map_or(0, |s| s.version) + 1;
                        let snapshot = rebuild(key.clone(), batch, version);
                        snapshots.insert(key.clone(), snapshot.clone());
                        snapshot
                    };

                    let callback = callbacks.lock().get(&key).cloned();
                    match callback {
                        Some(callback) => callback(&snapshot),
                        None => debug!("No callback registered for {}", key),
                    }
                }
                ListenEvent::Error(e) => warn!("Subscription {} reported an error: {}", key, e),
            }
        })
    }

    /// Detach the listener for `key`. Returns whether one was active.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let previous = self.active.lock().remove(key);
        self.snapshots.lock().remove(key);
        match previous {
            Some(previous) => {
                previous.close();
                info!("Unsubscribed from {}", key);
                true
            }
            None => false,
        }
    }

    /// Detach every listener, global and per-document.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<(SubscriptionKey, ActiveSubscription)> =
            self.active.lock().drain().collect();
        self.snapshots.lock().clear();

        let count = drained.len();
        for (_, subscription) in drained {
            subscription.close();
        }
        if count > 0 {
            info!("Released {} subscriptions", count);
        }
        count
    }

    pub fn snapshot(&self, key: &SubscriptionKey) -> Option<CollectionSnapshot> {
        self.snapshots.lock().get(key).cloned()
    }

    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.active.lock().contains_key(key)
    }

    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.active.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

/// Full rebuild from the listener payload; the change list only feeds the
/// counters.
fn rebuild(key: SubscriptionKey, batch: ChangeBatch, version: u64) -> CollectionSnapshot {
    CollectionSnapshot {
        key,
        added: batch.count(ChangeKind::Added),
        modified: batch.count(ChangeKind::Modified),
        removed: batch.count(ChangeKind::Removed),
        documents: batch.documents,
        version,
    }
}
