//! Telemetry sync tests: single flight, cache fallback and mid-sync recovery.
//!
//! Run with:
//!   cargo test -p ringd --test sync

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{count, manager, manager_with, memory_store, settle, Behavior, FakeTransport, Read, RING};
use ringd::cache::{MemoryStore, SnapshotStore};
use ringd::config::RingConfig;
use ringd::telemetry::ConnectionMarker;
use ringd::transport::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT, STEP_COUNT};
use ringd::{ConnectionState, TelemetrySnapshot};

fn activity_payload(steps: u32, meters: u32, kcal: u16) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&steps.to_le_bytes());
    data.extend_from_slice(&meters.to_le_bytes());
    data.extend_from_slice(&kcal.to_le_bytes());
    data
}

fn cached_snapshot() -> TelemetrySnapshot {
    TelemetrySnapshot {
        battery: Some(64),
        steps: Some(4200),
        ..TelemetrySnapshot::empty()
    }
}

#[tokio::test(start_paused = true)]
async fn test_sync_without_link_serves_cache() {
    let fake = FakeTransport::new();
    let cached = cached_snapshot();
    let store = Arc::new(MemoryStore::with_snapshot(cached.clone()));
    let manager = manager_with(&fake, RingConfig::default(), store);

    assert_eq!(manager.sync().await, cached);
    assert_eq!(fake.calls.reads_of(BATTERY_LEVEL), 0);
    assert!(!manager.is_syncing());
}

#[tokio::test(start_paused = true)]
async fn test_sync_without_link_or_cache_is_empty() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.sync().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sync_reads_ring_and_persists_snapshot() {
    let fake = FakeTransport::new();
    fake.set_read_default(STEP_COUNT, Read::Value(activity_payload(8421, 6120, 312)));
    fake.set_read_default(HEART_RATE_MEASUREMENT, Read::Value(vec![0x00, 64]));
    let store = memory_store();
    let manager = manager_with(&fake, RingConfig::default(), store.clone());
    assert!(manager.connect(RING).await);

    let snapshot = manager.sync().await;
    assert_eq!(snapshot.battery, Some(87));
    assert_eq!(snapshot.steps, Some(8421));
    assert_eq!(snapshot.distance_km, Some(6.12));
    assert_eq!(snapshot.calories, Some(312));
    assert_eq!(snapshot.heart_rate, Some(64));
    assert_eq!(snapshot.connection, None);

    assert_eq!(store.load_latest(), Some(snapshot.clone()));
    let s = manager.state().await;
    assert_eq!(s.snapshot, Some(snapshot));
    assert_eq!(s.connection, ConnectionState::Connected);
    assert!(s.status.is_none());
    assert!(!manager.is_syncing());
}

#[tokio::test(start_paused = true)]
async fn test_optional_reads_do_not_fail_the_sync() {
    let fake = FakeTransport::new();
    let store = Arc::new(MemoryStore::with_snapshot(cached_snapshot()));
    let manager = manager_with(&fake, RingConfig::default(), store);
    assert!(manager.connect(RING).await);

    // Steps and heart rate are not scripted, so those reads fail.
    let snapshot = manager.sync().await;
    assert_eq!(snapshot.battery, Some(87));
    // Unrefreshed fields keep the previous value.
    assert_eq!(snapshot.steps, Some(4200));
    assert_eq!(snapshot.heart_rate, None);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_syncs_share_one_run() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    fake.set_read_default(BATTERY_LEVEL, Read::Delayed(Duration::from_secs(2), vec![75]));
    let before = fake.calls.reads_of(BATTERY_LEVEL);

    let running = tokio::spawn({
        let manager = manager.clone();
        async move { manager.sync().await }
    });
    settle().await;
    assert!(manager.is_syncing());
    assert_eq!(manager.state().await.connection, ConnectionState::Syncing);

    let (a, b) = tokio::join!(manager.sync(), manager.sync());
    let first = running.await.unwrap();

    assert_eq!(a, first);
    assert_eq!(b, first);
    assert_eq!(first.battery, Some(75));
    assert_eq!(fake.calls.reads_of(BATTERY_LEVEL) - before, 1);
    assert!(!manager.is_syncing());
    assert_eq!(manager.state().await.connection, ConnectionState::Connected);

    // A finished run is not reused.
    manager.sync().await;
    assert_eq!(fake.calls.reads_of(BATTERY_LEVEL) - before, 2);
}

#[tokio::test(start_paused = true)]
async fn test_sync_completes_after_caller_goes_away() {
    let fake = FakeTransport::new();
    let store = memory_store();
    let manager = manager_with(&fake, RingConfig::default(), store.clone());
    assert!(manager.connect(RING).await);
    fake.set_read_default(BATTERY_LEVEL, Read::Delayed(Duration::from_secs(2), vec![70]));

    let caller = tokio::spawn({
        let manager = manager.clone();
        async move { manager.sync().await }
    });
    settle().await;
    caller.abort();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.load_latest().and_then(|s| s.battery), Some(70));
    assert!(!manager.is_syncing());

    // The abandoned run is finished, so the next sync reads the ring again.
    fake.set_read_default(BATTERY_LEVEL, Read::Value(vec![33]));
    let before = fake.calls.reads_of(BATTERY_LEVEL);
    assert_eq!(manager.sync().await.battery, Some(33));
    assert_eq!(fake.calls.reads_of(BATTERY_LEVEL) - before, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_sync_falls_back_to_cache() {
    let fake = FakeTransport::new();
    let cached = cached_snapshot();
    let store = Arc::new(MemoryStore::with_snapshot(cached.clone()));
    let manager = manager_with(&fake, RingConfig::default(), store);
    assert!(manager.connect(RING).await);

    fake.set_read_default(BATTERY_LEVEL, Read::Fail("GATT error 133".to_string()));
    fake.set_connect_default(Behavior::Fail("GATT error 133".to_string()));

    assert_eq!(manager.sync().await, cached);

    let s = manager.state().await;
    assert_eq!(s.connection, ConnectionState::Idle);
    assert!(s.last_error.as_deref().is_some_and(|e| e.starts_with("sync failed")));
    assert_eq!(
        s.status.map(|m| m.text),
        Some("Sync failed, showing last known data".to_string())
    );
    assert!(!manager.is_syncing());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_without_refetch_returns_partial_snapshot() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    // The fetch loses the link, the reconnect reads the battery, the refetch fails.
    fake.queue_read(BATTERY_LEVEL, Read::Fail("Device is not connected".to_string()));
    fake.queue_read(BATTERY_LEVEL, Read::Value(vec![90]));
    fake.queue_read(BATTERY_LEVEL, Read::Fail("GATT error 133".to_string()));

    let snapshot = manager.sync().await;
    assert_eq!(snapshot.connection, Some(ConnectionMarker::Reconnected));
    assert_eq!(snapshot.battery, Some(90));
    assert!(snapshot.steps.is_none());

    let s = manager.state().await;
    assert_eq!(s.connection, ConnectionState::Connected);
    assert_eq!(
        s.status.map(|m| m.text),
        Some("Reconnected, some data could not be refreshed".to_string())
    );
    assert_eq!(count(&fake.calls.connect), 2);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_fault_mid_sync_recovers_and_refetches() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);
    let destroys = count(&fake.calls.destroy);

    fake.queue_read(BATTERY_LEVEL, Read::Fail("BleManager was destroyed".to_string()));

    let snapshot = manager.sync().await;
    assert_eq!(snapshot.battery, Some(87));
    assert_eq!(snapshot.connection, None);

    assert_eq!(manager.state().await.connection, ConnectionState::Connected);
    // Recovery recreates the adapter, then the reconnect resets it again.
    assert_eq!(count(&fake.calls.destroy) - destroys, 2);
}
