//! In-process remote store.
//!
//! Behaves like the backend from the sync layer's point of view: evaluates
//! queries, pushes change batches to live listeners, and goes quiet while its
//! network is disabled. Calls are logged and failures can be scripted, which
//! makes it the test double for every component above it.

use super::{
    ListenCallback, ListenEvent, ListenerHandle, NetworkControl, RemoteError, RemoteStore,
};
use crate::model::{ChangeBatch, Document, Query};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Query,
    Get,
    Create,
    Set,
    Update,
    Delete,
    Listen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub collection: String,
    pub id: Option<String>,
    pub fields: Option<Map<String, Value>>,
}

impl RemoteCall {
    fn new(op: RemoteOp, collection: &str) -> Self {
        Self {
            op,
            collection: collection.to_string(),
            id: None,
            fields: None,
        }
    }

    fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    fn with_fields(mut self, fields: &Map<String, Value>) -> Self {
        self.fields = Some(fields.clone());
        self
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.op,
            RemoteOp::Create | RemoteOp::Set | RemoteOp::Update | RemoteOp::Delete
        )
    }
}

type FailureRule = Box<dyn Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync>;

enum Target {
    Query(Query),
    Document { collection: String, id: String },
}

struct Listener {
    target: Target,
    callback: ListenCallback,
    last: Vec<Document>,
    delivered: bool,
}

type Collections = HashMap<String, BTreeMap<String, Map<String, Value>>>;

struct State {
    collections: Collections,
    listeners: HashMap<u64, Listener>,
    calls: Vec<RemoteCall>,
    failures: VecDeque<(RemoteOp, RemoteError)>,
    rule: Option<FailureRule>,
    network_enabled: bool,
    network_log: Vec<bool>,
}

pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
    next_listener_id: AtomicU64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                collections: HashMap::new(),
                listeners: HashMap::new(),
                calls: Vec::new(),
                failures: VecDeque::new(),
                rule: None,
                network_enabled: true,
                network_log: Vec::new(),
            })),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Insert or replace a document as if another client wrote it.
    pub fn put_document(&self, collection: &str, document: Document) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(document.id, document.fields);
        self.notify();
    }

    /// Remove a document as if another client deleted it.
    pub fn remove_document(&self, collection: &str, id: &str) {
        if let Some(docs) = self.state.lock().collections.get_mut(collection) {
            docs.remove(id);
        }
        self.notify();
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        let state = self.state.lock();
        let fields = state.collections.get(collection)?.get(id)?;
        Some(Document::new(id, fields.clone()))
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        let state = self.state.lock();
        state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn write_calls(&self) -> Vec<RemoteCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.state.lock().failures.push_back((op, error));
    }

    /// Fail every call the rule returns an error for, until cleared.
    pub fn set_failure_rule<F>(&self, rule: F)
    where
        F: Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync + 'static,
    {
        self.state.lock().rule = Some(Box::new(rule));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.rule = None;
    }

    /// Push a stream error to every live listener.
    pub fn emit_error(&self, error: RemoteError) {
        let callbacks: Vec<ListenCallback> = self
            .state
            .lock()
            .listeners
            .values()
            .map(|l| l.callback.clone())
            .collect();
        for callback in callbacks {
            callback(ListenEvent::Error(error.clone()));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn is_network_enabled(&self) -> bool {
        self.state.lock().network_enabled
    }

    /// Every enable (`true`) / disable (`false`) request, in order.
    pub fn network_log(&self) -> Vec<bool> {
        self.state.lock().network_log.clone()
    }

    fn begin(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(call.clone());

        if !state.network_enabled && call.op != RemoteOp::Listen {
            return Err(RemoteError::unavailable(
                "Failed to reach backend: network disabled",
            ));
        }
        if let Some(pos) = state.failures.iter().position(|(op, _)| *op == call.op) {
            if let Some((_, error)) = state.failures.remove(pos) {
                return Err(error);
            }
        }
        if let Some(error) = state.rule.as_ref().and_then(|rule| rule(&call)) {
            return Err(error);
        }
        Ok(())
    }

    /// Recompute every listener and deliver the ones that changed. Callbacks
    /// run after the state lock is released.
    fn notify(&self) {
        let deliveries: Vec<(ListenCallback, ChangeBatch)> = {
            let mut state = self.state.lock();
            if !state.network_enabled {
                return;
            }

            let State {
                collections,
                listeners,
                ..
            } = &mut *state;

            listeners
                .values_mut()
                .filter_map(|listener| {
                    let current = evaluate(&listener.target, collections);
                    let batch = ChangeBatch::between(&listener.last, current);
                    if batch.is_empty() && listener.delivered {
                        return None;
                    }
                    listener.last = batch.documents.clone();
                    listener.delivered = true;
                    Some((listener.callback.clone(), batch))
                })
                .collect()
        };

        for (callback, batch) in deliveries {
            callback(ListenEvent::Changes(batch));
        }
    }

    fn attach(
        &self,
        target: Target,
        callback: ListenCallback,
    ) -> Result<ListenerHandle, RemoteError> {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);

        let initial = {
            let mut state = self.state.lock();
            let online = state.network_enabled;
            let current = evaluate(&target, &state.collections);
            state.listeners.insert(
                id,
                Listener {
                    target,
                    callback: callback.clone(),
                    last: if online { current.clone() } else { Vec::new() },
                    delivered: online,
                },
            );
            online.then_some(current)
        };

        let state = Arc::downgrade(&self.state);
        let handle = ListenerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().listeners.remove(&id);
            }
        });

        if let Some(documents) = initial {
            callback(ListenEvent::Changes(ChangeBatch::initial(documents)));
        }
        Ok(handle)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn evaluate(target: &Target, collections: &Collections) -> Vec<Document> {
    match target {
        Target::Query(query) => {
            let docs = collections
                .get(&query.collection)
                .into_iter()
                .flat_map(|docs| docs.iter())
                .map(|(id, fields)| Document::new(id.clone(), fields.clone()));
            query.apply(docs)
        }
        Target::Document { collection, id } => collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| vec![Document::new(id.clone(), fields.clone())])
            .unwrap_or_default(),
    }
}

#[async_trait]
impl NetworkControl for MemoryRemote {
    async fn enable_network(&self) -> Result<(), RemoteError> {
        {
            let mut state = self.state.lock();
            state.network_enabled = true;
            state.network_log.push(true);
        }
        self.notify();
        Ok(())
    }

    async fn disable_network(&self) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.network_enabled = false;
        state.network_log.push(false);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn query(&self, query: &Query) -> Result<Vec<Document>, RemoteError> {
        self.begin(RemoteCall::new(RemoteOp::Query, &query.collection))?;
        let state = self.state.lock();
        Ok(evaluate(&Target::Query(query.clone()), &state.collections))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RemoteError> {
        self.begin(RemoteCall::new(RemoteOp::Get, collection).with_id(id))?;
        Ok(self.document(collection, id))
    }

    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, RemoteError> {
        self.begin(RemoteCall::new(RemoteOp::Create, collection).with_fields(&fields))?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        self.notify();
        Ok(id)
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        self.begin(
            RemoteCall::new(RemoteOp::Set, collection)
                .with_id(id)
                .with_fields(&fields),
        )?;
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        self.notify();
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        self.begin(
            RemoteCall::new(RemoteOp::Update, collection)
                .with_id(id)
                .with_fields(&fields),
        )?;
        {
            let mut state = self.state.lock();
            let existing = state
                .collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| {
                    RemoteError::not_found(format!("No document to update: {}/{}", collection, id))
                })?;
            existing.extend(fields);
        }
        self.notify();
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.begin(RemoteCall::new(RemoteOp::Delete, collection).with_id(id))?;
        if let Some(docs) = self.state.lock().collections.get_mut(collection) {
            docs.remove(id);
        }
        self.notify();
        Ok(())
    }

    fn listen(
        &self,
        query: &Query,
        callback: ListenCallback,
    ) -> Result<ListenerHandle, RemoteError> {
        self.begin(RemoteCall::new(RemoteOp::Listen, &query.collection))?;
        self.attach(Target::Query(query.clone()), callback)
    }

    fn listen_document(
        &self,
        collection: &str,
        id: &str,
        callback: ListenCallback,
    ) -> Result<ListenerHandle, RemoteError> {
        self.begin(RemoteCall::new(RemoteOp::Listen, collection).with_id(id))?;
        self.attach(
            Target::Document {
                collection: collection.to_string(),
                id: id.to_string(),
            },
            callback,
        )
    }
}
