//! SQLite-backed local storage
//!
//! Holds cached query results (with TTL) and the queue of pending write
//! operations. One connection, used behind the async [`super::CacheStore`].

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::model::{Document, QueryParams};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA_VERSION: &str = "1";

/// Bounds for the pending operation queue
///
/// When the queue is full (either by count or bytes), new operations are
/// rejected rather than dropping older ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending operations (default: 10,000)
    pub max_count: usize,
    /// Maximum total size in bytes of pending operation data (default: 100MB)
    pub max_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_count: 10_000,
            max_bytes: 100 * 1024 * 1024, // 100MB
        }
    }
}

impl QueueConfig {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count,
            max_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub count: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(SyncError::CacheUnavailable(format!(
                "unknown operation type '{}' in pending queue",
                other
            ))),
        }
    }
}

/// A write waiting to be replayed against the remote store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub id: i64,
    pub operation_type: OperationType,
    pub collection_path: String,
    pub doc_id: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub timestamp: i64,
    pub attempts: u32,
}

/// Operation handed to [`LocalStore::add_pending`]; id, timestamp and
/// attempts are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub operation_type: OperationType,
    pub collection_path: String,
    pub doc_id: Option<String>,
    pub data: Option<Map<String, Value>>,
}

/// One cached query result
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub cache_key: String,
    pub collection_path: String,
    pub query_params: QueryParams,
    pub data: Vec<Document>,
    pub expires_at: i64,
    pub timestamp: i64,
}

/// Deterministic key for `(collection, sorted params)`. `None` and empty
/// params share a key.
pub fn cache_key(collection_path: &str, query_params: Option<&QueryParams>) -> String {
    let empty = QueryParams::new();
    let params = query_params.unwrap_or(&empty);
    // BTreeMap serializes in key order; serde_json::Map does too.
    let canonical = serde_json::to_string(params).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(collection_path.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Local storage backend using SQLite
pub struct LocalStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
    queue: QueueConfig,
}

impl LocalStore {
    /// Open or create a local store at the given path
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, clock)
    }

    /// Open a throwaway store that lives only as long as this value
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, clock)
    }

    /// Open a local store in the default location (user data directory)
    pub fn open_default(app_name: &str, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
            })
            .join(app_name);

        std::fs::create_dir_all(&data_dir)?;
        Self::open(data_dir.join("cache.db"), clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let mut store = Self {
            conn,
            clock,
            queue: QueueConfig::default(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    fn init_schema(&mut self) -> SyncResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key TEXT PRIMARY KEY,
                collection_path TEXT NOT NULL,
                query_params TEXT NOT NULL,
                data TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_type TEXT NOT NULL,
                collection_path TEXT NOT NULL,
                doc_id TEXT,
                data TEXT,
                timestamp INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS store_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_timestamp ON cache_entries(timestamp);
            CREATE INDEX IF NOT EXISTS idx_cache_collection ON cache_entries(collection_path);
            CREATE INDEX IF NOT EXISTS idx_pending_timestamp ON pending_operations(timestamp);",
        )?;

        self.set_metadata("schema_version", SCHEMA_VERSION)?;
        Ok(())
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    // === Cache entries ===

    /// Store a query result, replacing any entry with the same key
    pub fn put_entry(
        &mut self,
        collection_path: &str,
        query_params: Option<&QueryParams>,
        data: &[Document],
        ttl: Duration,
    ) -> SyncResult<()> {
        let key = cache_key(collection_path, query_params);
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);
        let params_str = match query_params {
            Some(p) => serde_json::to_string(p)?,
            None => "{}".to_string(),
        };
        let data_str = serde_json::to_string(data)?;

        self.conn.execute(
            "INSERT INTO cache_entries (cache_key, collection_path, query_params, data, expires_at, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(cache_key) DO UPDATE SET
             data = excluded.data,
             expires_at = excluded.expires_at,
             timestamp = excluded.timestamp",
            params![key, collection_path, params_str, data_str, expires_at, now],
        )?;

        Ok(())
    }

    /// Fetch a live cache entry. Expired or undecodable entries are deleted
    /// and reported as absent.
    pub fn get_entry(
        &mut self,
        collection_path: &str,
        query_params: Option<&QueryParams>,
    ) -> SyncResult<Option<Vec<Document>>> {
        let key = cache_key(collection_path, query_params);
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT data, expires_at FROM cache_entries WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((data_str, expires_at)) = row else {
            return Ok(None);
        };

        if self.clock.now_millis() >= expires_at {
            tracing::debug!("Cache entry for {} expired, removing", collection_path);
            self.delete_entry(&key)?;
            return Ok(None);
        }

        match serde_json::from_str::<Vec<Document>>(&data_str) {
            Ok(docs) => Ok(Some(docs)),
            Err(e) => {
                tracing::warn!(
                    "Dropping undecodable cache entry for {}: {}",
                    collection_path,
                    e
                );
                self.delete_entry(&key)?;
                Ok(None)
            }
        }
    }

    /// Raw entry lookup, ignoring expiry
    pub fn entry(&self, cache_key: &str) -> SyncResult<Option<CacheEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT cache_key, collection_path, query_params, data, expires_at, timestamp
                 FROM cache_entries WHERE cache_key = ?1",
                params![cache_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((cache_key, collection_path, params_str, data_str, expires_at, timestamp)) = row
        else {
            return Ok(None);
        };

        Ok(Some(CacheEntry {
            cache_key,
            collection_path,
            query_params: serde_json::from_str(&params_str)?,
            data: serde_json::from_str(&data_str)?,
            expires_at,
            timestamp,
        }))
    }

    fn delete_entry(&mut self, cache_key: &str) -> SyncResult<()> {
        self.conn.execute(
            "DELETE FROM cache_entries WHERE cache_key = ?1",
            params![cache_key],
        )?;
        Ok(())
    }

    /// Delete every entry whose expiry has passed
    pub fn sweep_expired(&mut self) -> SyncResult<usize> {
        let now = self.clock.now_millis();
        let deleted = self.conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(deleted)
    }

    /// Delete every entry cached for a collection, whatever its query
    pub fn invalidate_collection(&mut self, collection_path: &str) -> SyncResult<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM cache_entries WHERE collection_path = ?1",
            params![collection_path],
        )?;
        Ok(deleted)
    }

    pub fn cache_stats(&self) -> SyncResult<CacheStats> {
        let now = self.clock.now_millis();
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(LENGTH(data)), 0)
             FROM cache_entries",
        )?;

        let stats = stmt.query_row(params![now], |row| {
            let entries: i64 = row.get(0)?;
            let expired: i64 = row.get(1)?;
            let bytes: i64 = row.get(2)?;
            Ok(CacheStats {
                entries: entries as usize,
                expired: expired as usize,
                bytes: bytes as usize,
            })
        })?;
        Ok(stats)
    }

    // === Pending operations ===

    /// Append an operation to the queue, respecting the queue bounds
    pub fn add_pending(&mut self, operation: &NewOperation) -> SyncResult<i64> {
        let data_str = operation
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let stats = self.queue_stats()?;
        if stats.count >= self.queue.max_count {
            return Err(SyncError::CacheUnavailable(format!(
                "pending queue full ({} operations)",
                stats.count
            )));
        }
        let new_size = data_str.as_ref().map(|s| s.len()).unwrap_or(0);
        if stats.bytes + new_size > self.queue.max_bytes {
            return Err(SyncError::CacheUnavailable(format!(
                "pending queue full ({} bytes)",
                stats.bytes
            )));
        }

        let now = self.clock.now_millis();
        self.conn.execute(
            "INSERT INTO pending_operations (operation_type, collection_path, doc_id, data, timestamp, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                operation.operation_type.as_str(),
                operation.collection_path,
                operation.doc_id,
                data_str,
                now
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// All pending operations, oldest first
    pub fn pending_operations(&self) -> SyncResult<Vec<PendingOperation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, operation_type, collection_path, doc_id, data, timestamp, attempts
             FROM pending_operations
             ORDER BY timestamp ASC, id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut operations = Vec::new();
        for row in rows {
            let (id, op_type, collection_path, doc_id, data_str, timestamp, attempts) = row?;
            let data = data_str
                .map(|s| serde_json::from_str::<Map<String, Value>>(&s))
                .transpose()
                .map_err(|e| {
                    SyncError::CacheUnavailable(format!("corrupt pending operation {}: {}", id, e))
                })?;

            operations.push(PendingOperation {
                id,
                operation_type: op_type.parse()?,
                collection_path,
                doc_id,
                data,
                timestamp,
                attempts: attempts as u32,
            });
        }
        Ok(operations)
    }

    /// Remove a pending operation after it was applied
    pub fn remove_pending(&mut self, id: i64) -> SyncResult<()> {
        self.conn
            .execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Record a failed replay
    pub fn increment_attempts(&mut self, id: i64) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE pending_operations SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn clear_pending(&mut self) -> SyncResult<usize> {
        Ok(self.conn.execute("DELETE FROM pending_operations", [])?)
    }

    pub fn queue_stats(&self) -> SyncResult<QueueStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM pending_operations")?;

        let stats = stmt.query_row([], |row| {
            let count: i64 = row.get(0)?;
            let bytes: i64 = row.get(1)?;
            Ok(QueueStats {
                count: count as usize,
                bytes: bytes as usize,
            })
        })?;
        Ok(stats)
    }

    // === Metadata ===

    pub fn set_metadata(&mut self, key: &str, value: &str) -> SyncResult<()> {
        let now = self.clock.now_millis();

        self.conn.execute(
            "INSERT INTO store_metadata (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
            params![key, value, now],
        )?;

        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> SyncResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM store_metadata WHERE key = ?1")?;

        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn create_test_store() -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = LocalStore::open_in_memory(clock.clone()).unwrap();
        (store, clock)
    }

    fn trips() -> Vec<Document> {
        vec![Document::from_value(json!({"id": "trip-1", "vehicleId": "truck-7"})).unwrap()]
    }

    fn params(vehicle: &str) -> QueryParams {
        let mut p = QueryParams::new();
        p.insert("vehicleId".to_string(), json!(vehicle));
        p
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let mut a = QueryParams::new();
        a.insert("b".to_string(), json!(2));
        a.insert("a".to_string(), json!(1));
        let mut b = QueryParams::new();
        b.insert("a".to_string(), json!(1));
        b.insert("b".to_string(), json!(2));

        assert_eq!(cache_key("trips", Some(&a)), cache_key("trips", Some(&b)));
        assert_eq!(cache_key("trips", None), cache_key("trips", Some(&QueryParams::new())));
        assert_ne!(cache_key("trips", Some(&a)), cache_key("diesel_records", Some(&a)));
        assert_eq!(cache_key("trips", None).len(), 64);
    }

    #[test]
    fn test_entry_storage() {
        let (mut store, _clock) = create_test_store();
        let p = params("truck-7");

        store
            .put_entry("trips", Some(&p), &trips(), Duration::from_secs(60))
            .unwrap();

        let cached = store.get_entry("trips", Some(&p)).unwrap().unwrap();
        assert_eq!(cached, trips());
        assert!(store.get_entry("trips", None).unwrap().is_none());

        let entry = store.entry(&cache_key("trips", Some(&p))).unwrap().unwrap();
        assert_eq!(entry.collection_path, "trips");
        assert_eq!(entry.query_params, p);
        assert_eq!(entry.expires_at - entry.timestamp, 60_000);
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let (mut store, clock) = create_test_store();
        store
            .put_entry("trips", None, &trips(), Duration::from_secs(5))
            .unwrap();

        clock.advance(Duration::from_secs(6));
        assert!(store.get_entry("trips", None).unwrap().is_none());
        assert!(store.entry(&cache_key("trips", None)).unwrap().is_none());
    }

    #[test]
    fn test_overwrite_is_last_write_wins() {
        let (mut store, _clock) = create_test_store();
        store
            .put_entry("trips", None, &trips(), Duration::from_secs(60))
            .unwrap();
        store
            .put_entry("trips", None, &[], Duration::from_secs(60))
            .unwrap();

        assert_eq!(store.get_entry("trips", None).unwrap(), Some(vec![]));
        assert_eq!(store.cache_stats().unwrap().entries, 1);
    }

    #[test]
    fn test_sweep_and_invalidate() {
        let (mut store, clock) = create_test_store();
        store
            .put_entry("trips", None, &trips(), Duration::from_secs(5))
            .unwrap();
        store
            .put_entry("trips", Some(&params("truck-7")), &trips(), Duration::from_secs(500))
            .unwrap();
        store
            .put_entry("diesel_records", None, &[], Duration::from_secs(500))
            .unwrap();

        clock.advance(Duration::from_secs(10));
        let stats = store.cache_stats().unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.expired, 1);

        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert_eq!(store.invalidate_collection("trips").unwrap(), 1);
        assert_eq!(store.cache_stats().unwrap().entries, 1);
    }

    #[test]
    fn test_pending_operations() {
        let (mut store, clock) = create_test_store();
        let data = json!({"vehicleId": "truck-7"}).as_object().cloned();

        let first = store
            .add_pending(&NewOperation {
                operation_type: OperationType::Create,
                collection_path: "trips".to_string(),
                doc_id: Some("trip-1".to_string()),
                data: data.clone(),
            })
            .unwrap();
        clock.advance(Duration::from_millis(1));
        let second = store
            .add_pending(&NewOperation {
                operation_type: OperationType::Delete,
                collection_path: "trips".to_string(),
                doc_id: Some("trip-0".to_string()),
                data: None,
            })
            .unwrap();
        assert_ne!(first, second);

        let ops = store.pending_operations().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].id, first);
        assert_eq!(ops[0].operation_type, OperationType::Create);
        assert_eq!(ops[0].data, data);
        assert_eq!(ops[1].data, None);
        assert_eq!(ops[1].attempts, 0);

        store.increment_attempts(second).unwrap();
        store.remove_pending(first).unwrap();
        let ops = store.pending_operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].attempts, 1);
    }

    #[test]
    fn test_bounded_queue_count_limit() {
        let clock = Arc::new(ManualClock::default());
        let mut store = LocalStore::open_in_memory(clock)
            .unwrap()
            .with_queue_config(QueueConfig::new(1, 1024 * 1024));
        let op = NewOperation {
            operation_type: OperationType::Update,
            collection_path: "trips".to_string(),
            doc_id: Some("trip-1".to_string()),
            data: json!({"status": "active"}).as_object().cloned(),
        };

        store.add_pending(&op).unwrap();
        assert!(matches!(
            store.add_pending(&op),
            Err(SyncError::CacheUnavailable(_))
        ));
        assert_eq!(store.queue_stats().unwrap().count, 1);
    }

    #[test]
    fn test_bounded_queue_bytes_limit() {
        let clock = Arc::new(ManualClock::default());
        let mut store = LocalStore::open_in_memory(clock)
            .unwrap()
            .with_queue_config(QueueConfig::new(100, 300));
        let op = NewOperation {
            operation_type: OperationType::Update,
            collection_path: "trips".to_string(),
            doc_id: Some("trip-1".to_string()),
            data: json!({"notes": "x".repeat(200)}).as_object().cloned(),
        };

        store.add_pending(&op).unwrap();
        assert!(store.add_pending(&op).is_err());
    }

    #[test]
    fn test_metadata() {
        let (mut store, _clock) = create_test_store();
        assert_eq!(
            store.get_metadata("schema_version").unwrap().as_deref(),
            Some(SCHEMA_VERSION)
        );

        store.set_metadata("last_drain_at", "42").unwrap();
        assert_eq!(store.get_metadata("last_drain_at").unwrap().unwrap(), "42");
    }
}
