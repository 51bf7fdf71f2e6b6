//! Write/Sync Coordinator
//!
//! Writes go straight to the remote store while connected and into the
//! pending queue otherwise. Every transition into `Connected` replays the
//! queue in enqueue order.
//!
//! Delivery is at-least-once: a replay whose acknowledgement is lost stays
//! queued and is sent again. Offline creates carry a locally generated id
//! and replay as an upsert, so every replay is safe to repeat.

pub mod coordinator;

pub use coordinator::WriteCoordinator;

use crate::error::{SyncError, SyncResult};
use crate::store::{DrainReport, OperationType};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const UPDATED_AT: &str = "updatedAt";
pub const CREATED_AT: &str = "createdAt";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// A queued operation that failed this many replays is discarded.
    pub max_replay_attempts: u32,
    /// Drain once when the coordinator starts connected.
    pub drain_on_start: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_replay_attempts: 5,
            drain_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Written to the remote store.
    Applied { id: String },
    /// Stored in the pending queue for a later drain.
    Queued { id: String, pending_id: i64 },
}

impl SubmitOutcome {
    pub fn id(&self) -> &str {
        match self {
            SubmitOutcome::Applied { id } | SubmitOutcome::Queued { id, .. } => id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A queued write was dropped and will never reach the remote store.
    ReplayDiscarded {
        pending_id: i64,
        operation_type: OperationType,
        collection: String,
        doc_id: Option<String>,
        reason: String,
    },
    Drained(DrainReport),
}

/// Apply the timestamp rule: `updatedAt` is always now, `createdAt` is set
/// on creates unless the payload already carries one.
pub fn stamp(
    mut fields: Map<String, Value>,
    operation_type: OperationType,
    now: DateTime<Utc>,
) -> Map<String, Value> {
    let now = Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true));
    if operation_type == OperationType::Create {
        fields
            .entry(CREATED_AT.to_string())
            .or_insert_with(|| now.clone());
    }
    fields.insert(UPDATED_AT.to_string(), now);
    fields
}

pub(crate) fn validate_collection(collection: &str) -> SyncResult<()> {
    if collection.is_empty() || collection.split('/').any(str::is_empty) {
        return Err(SyncError::Validation(format!(
            "invalid collection path '{}'",
            collection
        )));
    }
    Ok(())
}

pub(crate) fn validate_id(id: &str) -> SyncResult<()> {
    if id.is_empty() || id.contains('/') {
        return Err(SyncError::Validation(format!("invalid document id '{}'", id)));
    }
    Ok(())
}

pub(crate) fn validate_payload(data: Value) -> SyncResult<Map<String, Value>> {
    match data {
        Value::Object(fields) if fields.contains_key("id") => Err(SyncError::Validation(
            "payload must not set `id`; pass it separately".to_string(),
        )),
        Value::Object(fields) => Ok(fields),
        _ => Err(SyncError::Validation(
            "payload must be a JSON object".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_stamp_create_sets_both() {
        let fields = stamp(Map::new(), OperationType::Create, at(1_704_067_200));
        assert_eq!(fields[CREATED_AT], "2024-01-01T00:00:00.000Z");
        assert_eq!(fields[UPDATED_AT], "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_stamp_preserves_created_at() {
        let first = stamp(Map::new(), OperationType::Create, at(1_704_067_200));
        let replayed = stamp(first, OperationType::Create, at(1_704_067_260));
        assert_eq!(replayed[CREATED_AT], "2024-01-01T00:00:00.000Z");
        assert_eq!(replayed[UPDATED_AT], "2024-01-01T00:01:00.000Z");
    }

    #[test]
    fn test_stamp_update_leaves_created_at_alone() {
        let fields = stamp(Map::new(), OperationType::Update, at(0));
        assert!(!fields.contains_key(CREATED_AT));
        assert!(fields.contains_key(UPDATED_AT));
    }

    #[test]
    fn test_validation() {
        assert!(validate_collection("trips").is_ok());
        assert!(validate_collection("fleets/f1/trips").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("trips//x").is_err());
        assert!(validate_collection("/trips").is_err());

        assert!(validate_id("t1").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("a/b").is_err());

        assert!(validate_payload(json!({"status": "active"})).is_ok());
        assert!(validate_payload(json!({"id": "x"})).is_err());
        assert!(validate_payload(json!([1])).is_err());
        assert!(validate_payload(Value::Null).is_err());
    }
}
