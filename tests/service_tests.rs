//! Sync Service Tests
//!
//! Verifies lifecycle wiring across components:
//! - Writes queued before a restart are replayed by the next session
//! - Disposal releases listeners of every component
//! - Configuration from disk reaches the components

mod common;

use common::{create_harness, create_harness_with, db_path, trip};
use fleetsync::config::{SyncConfig, CONFIG_FILE_NAME};
use fleetsync::remote::MemoryRemote;
use fleetsync::store::LocalStore;
use fleetsync::subscriptions::{StaticAuth, SubscriptionKey};
use fleetsync::{Clock, ConnectionStatus, ErrorOutcome, Query, SyncEvent, SyncService};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_queue_survives_restart_and_drains_on_start() {
    let h = create_harness();
    h.remote.put_document("trips", trip("t1", "v1", "planned"));
    h.service.init().await;
    h.service.monitor().set_online(false).await;

    h.service
        .coordinator()
        .submit("trips", json!({"status": "active"}), Some("t1"))
        .await
        .unwrap();
    h.service.dispose();

    let clock: Arc<dyn Clock> = h.clock.clone();
    let local = LocalStore::open(db_path(&h.dir), clock.clone()).unwrap();
    let restarted = SyncService::with_store(
        SyncConfig::default(),
        local,
        h.remote.clone(),
        Arc::new(StaticAuth::new(true)),
        clock,
    );
    assert_eq!(restarted.coordinator().pending_count().await.unwrap(), 1);

    let mut events = restarted.coordinator().events();
    restarted.init().await;

    let wait = async {
        loop {
            if let Ok(SyncEvent::Drained(report)) = events.recv().await {
                return report;
            }
        }
    };
    let report = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("startup drain did not run");

    assert_eq!(report.succeeded, 1);
    let t1 = h.remote.document("trips", "t1").unwrap();
    assert_eq!(t1.fields.get("status"), Some(&json!("active")));
}

#[tokio::test]
async fn test_dispose_releases_everything() {
    let h = create_harness();
    h.service.init().await;

    h.service
        .subscriptions()
        .subscribe(SubscriptionKey::collection("trips"))
        .unwrap();
    let live = h
        .service
        .queries()
        .watch::<fleetsync::model::Trip>(Query::collection("trips"), Default::default())
        .await;
    assert_eq!(h.remote.listener_count(), 2);

    h.service.dispose();
    assert_eq!(h.remote.listener_count(), 1);
    assert_eq!(h.service.monitor().listener_count(), 0);
    assert_eq!(
        h.service
            .monitor()
            .report_error(&fleetsync::RemoteError::unavailable("late")),
        ErrorOutcome::Suppressed
    );

    drop(live);
    assert_eq!(h.remote.listener_count(), 0);
}

#[tokio::test]
async fn test_config_file_reaches_components() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        "[connection]\nmax_retries = 1\n\n[sync]\ndrain_on_start = false\n",
    )
    .unwrap();
    let config = SyncConfig::load(dir.path()).unwrap();
    assert_eq!(config.connection.max_retries, 1);

    let h = create_harness_with(config);
    h.service.init().await;
    let error = fleetsync::RemoteError::unavailable("unreachable");

    assert!(matches!(
        h.service.monitor().report_error(&error),
        ErrorOutcome::Retrying { attempt: 1, .. }
    ));
    assert!(matches!(
        h.service.monitor().report_error(&error),
        ErrorOutcome::GaveUp { attempts: 1 }
    ));
    assert_eq!(h.service.monitor().status(), ConnectionStatus::Disconnected);
    assert!(!h.service.config().sync.drain_on_start);
}

#[tokio::test]
async fn test_open_uses_configured_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = SyncConfig::default();
    config.store.path = Some(dir.path().join("data").join("fleet.db"));

    let service = SyncService::open(
        config,
        Arc::new(MemoryRemote::new()),
        Arc::new(StaticAuth::new(true)),
    )
    .unwrap();
    service.init().await;

    assert!(dir.path().join("data").join("fleet.db").exists());
    assert!(service.monitor().is_connected());
    service.dispose();
}
