//! Remote document store seam
//!
//! Everything the sync layer needs from the backend: collection queries,
//! per-document reads and writes, live change listeners, and the network
//! switch the connection monitor flips to force a reconnect.

pub mod http;
pub mod memory;

pub use http::HttpRemote;
pub use memory::{MemoryRemote, RemoteCall, RemoteOp};

use crate::model::{ChangeBatch, Document, Query};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Error shape as reported by the backend. Only the classifier looks inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not-found", message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == "not-found"
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// What a live listener receives.
#[derive(Debug, Clone)]
pub enum ListenEvent {
    Changes(ChangeBatch),
    Error(RemoteError),
}

pub type ListenCallback = Arc<dyn Fn(ListenEvent) + Send + Sync>;

/// Registration of one live listener. Releasing twice is a no-op; dropping
/// the handle releases it.
#[must_use = "dropping a ListenerHandle detaches the listener"]
pub struct ListenerHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Switch for the backend's network layer.
#[async_trait]
pub trait NetworkControl: Send + Sync {
    async fn enable_network(&self) -> Result<(), RemoteError>;
    async fn disable_network(&self) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait RemoteStore: NetworkControl {
    async fn query(&self, query: &Query) -> Result<Vec<Document>, RemoteError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RemoteError>;

    /// Create a document with a backend-assigned id.
    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, RemoteError>;

    /// Create or replace the document with this id.
    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError>;

    /// Merge fields into an existing document. Fails with `not-found`.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// Attach a live listener to a query. The first delivery carries the
    /// full current result set.
    fn listen(&self, query: &Query, callback: ListenCallback)
        -> Result<ListenerHandle, RemoteError>;

    /// Attach a live listener to a single document.
    fn listen_document(
        &self,
        collection: &str,
        id: &str,
        callback: ListenCallback,
    ) -> Result<ListenerHandle, RemoteError>;
}
