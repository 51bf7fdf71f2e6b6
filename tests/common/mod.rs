//! Common test utilities for the sync layer
//!
//! Provides shared helper functions for:
//! - Opening a file-backed local store on a manual clock
//! - Wiring a full service around an in-memory remote store
//! - Building fleet documents

#![allow(dead_code)]

use fleetsync::config::SyncConfig;
use fleetsync::remote::MemoryRemote;
use fleetsync::store::{CacheStore, LocalStore};
use fleetsync::subscriptions::StaticAuth;
use fleetsync::{Clock, Document, ManualClock, SyncService};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub fn create_test_store() -> (CacheStore, Arc<ManualClock>, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let clock = Arc::new(ManualClock::default());
    let local = LocalStore::open(db_path(&tmp_dir), clock.clone())
        .expect("Failed to open local store");
    (CacheStore::new(local), clock, tmp_dir)
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("cache.db")
}

pub struct Harness {
    pub service: SyncService,
    pub remote: Arc<MemoryRemote>,
    pub clock: Arc<ManualClock>,
    pub auth: Arc<StaticAuth>,
    pub dir: TempDir,
}

pub fn create_harness() -> Harness {
    create_harness_with(SyncConfig::default())
}

pub fn create_harness_with(config: SyncConfig) -> Harness {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let clock = Arc::new(ManualClock::default());
    let remote = Arc::new(MemoryRemote::new());
    let auth = Arc::new(StaticAuth::new(true));

    let shared_clock: Arc<dyn Clock> = clock.clone();
    let local = LocalStore::open(db_path(&dir), shared_clock.clone())
        .expect("Failed to open local store");
    let service = SyncService::with_store(config, local, remote.clone(), auth.clone(), shared_clock);

    Harness {
        service,
        remote,
        clock,
        auth,
        dir,
    }
}

pub fn trip(id: &str, vehicle_id: &str, status: &str) -> Document {
    Document::from_value(json!({
        "id": id,
        "vehicleId": vehicle_id,
        "status": status,
    }))
    .expect("valid trip document")
}

pub fn fields(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().expect("object literal")
}

/// Let spawned tasks and listener callbacks run to quiescence.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
