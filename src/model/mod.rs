//! Documents, queries and change batches exchanged with the remote store.

pub mod fleet;
pub mod query;

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

pub use fleet::{DieselRecord, DriverBehaviorEvent, Severity, Trip, TripStatus};
pub use query::{Direction, Filter, FilterOp, OrderBy, Query, QueryParams};

/// A typed record stored in one remote collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

/// One persisted document: its identifier plus the remaining fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a document from a JSON object carrying a non-empty string `id`.
    pub fn from_value(value: Value) -> SyncResult<Self> {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(SyncError::Validation(format!(
                    "record must be a JSON object, got {}",
                    json_type(&other)
                )))
            }
        };

        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(_) => {
                return Err(SyncError::Validation(
                    "record `id` must be a non-empty string".to_string(),
                ))
            }
            None => {
                return Err(SyncError::Validation(
                    "record is missing its `id`".to_string(),
                ))
            }
        };

        Ok(Self { id, fields })
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(map)
    }

    /// Look up a field by dotted path. `id` resolves to the document id.
    pub fn get(&self, path: &str) -> Option<Value> {
        if path == "id" {
            return Some(Value::String(self.id.clone()));
        }

        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }

    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_value(self.to_value()).map_err(|e| {
            SyncError::Validation(format!("document '{}' does not decode: {}", self.id, e))
        })
    }

    pub fn encode<T: Serialize>(record: &T) -> SyncResult<Self> {
        Self::from_value(serde_json::to_value(record)?)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode a list of documents into typed records, failing on the first bad one.
pub fn decode_all<T: DeserializeOwned>(documents: &[Document]) -> SyncResult<Vec<T>> {
    documents.iter().map(Document::decode).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// One push from a live listener: the classified changes plus the complete
/// current result set of the listener.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    pub changes: Vec<DocumentChange>,
    pub documents: Vec<Document>,
}

impl ChangeBatch {
    /// First delivery of a listener: every document counts as added.
    pub fn initial(documents: Vec<Document>) -> Self {
        let changes = documents
            .iter()
            .map(|doc| DocumentChange {
                kind: ChangeKind::Added,
                document: doc.clone(),
            })
            .collect();
        Self { changes, documents }
    }

    /// Classify the difference between two consecutive result sets.
    pub fn between(previous: &[Document], current: Vec<Document>) -> Self {
        let before: HashMap<&str, &Document> =
            previous.iter().map(|doc| (doc.id.as_str(), doc)).collect();

        let mut changes = Vec::new();
        for doc in &current {
            match before.get(doc.id.as_str()) {
                None => changes.push(DocumentChange {
                    kind: ChangeKind::Added,
                    document: doc.clone(),
                }),
                Some(old) if old.fields != doc.fields => changes.push(DocumentChange {
                    kind: ChangeKind::Modified,
                    document: doc.clone(),
                }),
                Some(_) => {}
            }
        }

        let after: HashSet<&str> = current.iter().map(|doc| doc.id.as_str()).collect();
        for old in previous {
            if !after.contains(old.id.as_str()) {
                changes.push(DocumentChange {
                    kind: ChangeKind::Removed,
                    document: old.clone(),
                });
            }
        }

        Self {
            changes,
            documents: current,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }
}
