//! Heart rate monitor tests: validity gate, stall supervisor and synthetic
//! fallback, driven through the scripted transport.
//!
//! Run with:
//!   cargo test -p ringd --test monitor

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{count, manager, settle, Behavior, FakeTransport, RING};
use ringd::monitor::HeartRateSample;
use ringd::RingManager;

type Samples = Arc<Mutex<Vec<HeartRateSample>>>;

async fn start_collecting(manager: &RingManager) -> Samples {
    let samples: Samples = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    manager
        .start_heart_rate_monitor(move |sample| sink.lock().unwrap().push(sample))
        .await;
    samples
}

fn real(bpm: u16) -> HeartRateSample {
    HeartRateSample { bpm, simulated: false }
}

#[tokio::test(start_paused = true)]
async fn test_only_valid_readings_reach_consumers() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    let samples = start_collecting(&manager).await;
    settle().await;
    assert_eq!(count(&fake.calls.subscribe), 1);
    assert!(manager.state().await.measuring);

    for bpm in [0, 30, 72, 205, 88] {
        fake.push_heart_rate(bpm);
    }
    settle().await;

    assert_eq!(*samples.lock().unwrap(), vec![real(72), real(88)]);
    let s = manager.state().await;
    assert_eq!(s.heart_rate, Some(88));
    assert!(!s.heart_rate_simulated);
    assert!(!s.measuring);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_values_are_thinned() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    let samples = start_collecting(&manager).await;
    settle().await;
    for _ in 0..6 {
        fake.push_heart_rate(70);
    }
    settle().await;

    // The first reading and the fifth repeat.
    assert_eq!(*samples.lock().unwrap(), vec![real(70), real(70)]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_subscription_is_restarted_once_per_window() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    let _samples = start_collecting(&manager).await;
    settle().await;
    assert_eq!(count(&fake.calls.subscribe), 1);

    tokio::time::sleep(Duration::from_secs(19)).await;
    assert_eq!(count(&fake.calls.subscribe), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count(&fake.calls.subscribe), 2);

    tokio::time::sleep(Duration::from_secs(18)).await;
    assert_eq!(count(&fake.calls.subscribe), 2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count(&fake.calls.subscribe), 3);
}

#[tokio::test(start_paused = true)]
async fn test_steady_readings_keep_the_subscription() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    let samples = start_collecting(&manager).await;
    settle().await;
    for i in 0..12u8 {
        fake.push_heart_rate(70 + i % 2);
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    assert_eq!(count(&fake.calls.subscribe), 1);
    assert_eq!(samples.lock().unwrap().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_no_ring_means_simulated_heart_rate() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);

    let samples = start_collecting(&manager).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let samples = samples.lock().unwrap().clone();
    assert!((4..=6).contains(&samples.len()), "got {} samples", samples.len());
    assert!(samples.iter().all(|s| s.simulated && (65..=95).contains(&s.bpm)));
    assert_eq!(count(&fake.calls.subscribe), 0);

    let s = manager.state().await;
    assert!(s.heart_rate_simulated);
    assert!(!s.measuring);
}

#[tokio::test(start_paused = true)]
async fn test_hung_subscribe_falls_back_after_timeout() {
    let fake = FakeTransport::new();
    fake.set_subscribe_default(Behavior::Hang);
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    let samples = start_collecting(&manager).await;
    tokio::time::sleep(Duration::from_secs(14)).await;
    assert!(samples.lock().unwrap().is_empty());
    assert!(manager.state().await.measuring);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let samples = samples.lock().unwrap().clone();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.simulated));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_subscribe_errors_fall_back_to_simulation() {
    let fake = FakeTransport::new();
    fake.set_subscribe_default(Behavior::Fail("GATT error 133".to_string()));
    let manager = manager(&fake);
    assert!(manager.connect(RING).await);

    let samples = start_collecting(&manager).await;
    settle().await;

    assert_eq!(count(&fake.calls.subscribe), 3);
    let samples = samples.lock().unwrap().clone();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.simulated));
}

#[tokio::test(start_paused = true)]
async fn test_stopping_twice_is_harmless_and_ends_samples() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);

    let samples = start_collecting(&manager).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(manager.is_monitoring().await);

    manager.stop_heart_rate_monitor().await;
    manager.stop_heart_rate_monitor().await;
    assert!(!manager.is_monitoring().await);

    let seen = samples.lock().unwrap().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(samples.lock().unwrap().len(), seen);
    assert!(!manager.state().await.measuring);
}

#[tokio::test(start_paused = true)]
async fn test_restarting_replaces_the_previous_monitor() {
    let fake = FakeTransport::new();
    let manager = manager(&fake);

    let first = start_collecting(&manager).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let second = start_collecting(&manager).await;

    let frozen = first.lock().unwrap().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(first.lock().unwrap().len(), frozen);
    assert!(!second.lock().unwrap().is_empty());
}
