//! Telemetry sync with the connected ring.
//!
//! Concurrent callers share one in-flight sync. A sync never comes back
//! empty-handed while a cached snapshot exists: when the ring cannot be
//! read, the last persisted snapshot is returned instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AdapterHandle;
use crate::cache::SnapshotStore;
use crate::classify::{ErrorClassifier, RecoveryAction};
use crate::config::Timings;
use crate::connection::ConnectionController;
use crate::error::{LinkError, Stage};
use crate::state::{ConnectionState, FlagGuard, SharedState};
use crate::status::StatusBoard;
use crate::telemetry::{parse_activity, parse_battery_level, parse_hr_measurement, TelemetrySnapshot};
use crate::transport::{
    BleTransport, BATTERY_LEVEL, BATTERY_SERVICE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
    STEP_COUNT, STEP_SERVICE,
};

type InFlight = Shared<BoxFuture<'static, TelemetrySnapshot>>;

/// A spawned sync and whether its task has returned. Completion is tracked
/// by the task itself, since nobody may be polling the shared result.
struct Running {
    result: InFlight,
    done: Arc<AtomicBool>,
}

enum Outcome {
    Complete(TelemetrySnapshot),
    /// Reconnected, but the refetch failed.
    Partial(TelemetrySnapshot),
}

pub struct SyncController {
    worker: Arc<SyncWorker>,
    in_flight: std::sync::Mutex<Option<Running>>,
}

struct SyncWorker {
    adapter: Arc<AdapterHandle>,
    connection: Arc<ConnectionController>,
    classifier: Arc<ErrorClassifier>,
    state: SharedState,
    status: StatusBoard,
    store: Arc<dyn SnapshotStore>,
    timings: Timings,
    syncing: Arc<AtomicBool>,
    lifetime: CancellationToken,
}

impl SyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<AdapterHandle>,
        connection: Arc<ConnectionController>,
        classifier: Arc<ErrorClassifier>,
        state: SharedState,
        status: StatusBoard,
        store: Arc<dyn SnapshotStore>,
        timings: Timings,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            worker: Arc::new(SyncWorker {
                adapter,
                connection,
                classifier,
                state,
                status,
                store,
                timings,
                syncing: Arc::new(AtomicBool::new(false)),
                lifetime,
            }),
            in_flight: std::sync::Mutex::new(None),
        }
    }

    /// Run a sync, or join the one already running.
    pub async fn sync(&self) -> TelemetrySnapshot {
        let shared = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(running)
                    if !running.done.load(Ordering::SeqCst) && running.result.peek().is_none() =>
                {
                    debug!("Joining sync already in flight");
                    running.result.clone()
                }
                _ => {
                    let worker = Arc::clone(&self.worker);
                    let done = Arc::new(AtomicBool::new(false));
                    let finished = Arc::clone(&done);
                    let task = tokio::spawn(async move {
                        let snapshot = worker.run().await;
                        finished.store(true, Ordering::SeqCst);
                        snapshot
                    });
                    let fresh = async move {
                        task.await.unwrap_or_else(|e| {
                            error!("Sync task failed: {:?}", e);
                            TelemetrySnapshot::empty()
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(Running { result: fresh.clone(), done });
                    fresh
                }
            }
        };
        shared.await
    }

    pub fn is_syncing(&self) -> bool {
        self.worker.syncing.load(Ordering::SeqCst)
    }

    /// The snapshot a sync would fall back to.
    pub async fn cached(&self) -> TelemetrySnapshot {
        self.worker.cached().await
    }
}

impl SyncWorker {
    async fn run(&self) -> TelemetrySnapshot {
        let Some(_guard) = FlagGuard::try_raise(&self.syncing) else {
            return self.cached().await;
        };

        let Some(id) = self.state.lock().await.linked_target() else {
            info!("No ring connected, serving cached snapshot");
            return self.cached().await;
        };

        self.state.lock().await.transition(ConnectionState::Syncing);
        self.status.transient("Syncing...").await;

        let outcome = tokio::select! {
            _ = self.lifetime.cancelled() => Err(LinkError::ShuttingDown),
            outcome = self.sync_linked(&id) => outcome,
        };

        {
            let mut s = self.state.lock().await;
            if s.connection == ConnectionState::Syncing {
                s.transition(ConnectionState::Connected);
            }
        }

        match outcome {
            Ok(Outcome::Complete(snapshot)) => {
                self.status.clear().await;
                self.publish(&snapshot).await
            }
            Ok(Outcome::Partial(snapshot)) => {
                self.status.expiring("Reconnected, some data could not be refreshed").await;
                self.publish(&snapshot).await;
                snapshot
            }
            Err(LinkError::ShuttingDown) => self.cached().await,
            Err(e) => {
                warn!("Sync with {} failed: {}", id, e);
                self.state.lock().await.last_error = Some(e.to_string());
                self.status.expiring("Sync failed, showing last known data").await;
                self.cached().await
            }
        }
    }

    async fn sync_linked(&self, id: &str) -> Result<Outcome, LinkError> {
        let limit = Duration::from_millis(self.timings.sync_timeout_ms);
        let err = match timeout(limit, self.fetch(id)).await {
            Ok(Ok(snapshot)) => return Ok(Outcome::Complete(snapshot)),
            Ok(Err(e)) => e,
            Err(_) => LinkError::Timeout(Stage::Fetch),
        };
        warn!("Fetch from {} failed: {}", id, err);

        let reconnected = match self.classifier.classify_error(&err) {
            RecoveryAction::RecreateAdapter => self.connection.recover_from_fault().await,
            _ => {
                self.connection.disconnect().await;
                tokio::time::sleep(Duration::from_millis(self.timings.sync_retry_delay_ms)).await;
                self.connection.connect_once(id).await.is_ok()
            }
        };
        if !reconnected {
            return Err(LinkError::SyncFailed(err.to_string()));
        }

        info!("Reconnected to {}, fetching again", id);
        self.state.lock().await.transition(ConnectionState::Syncing);
        let limit = Duration::from_millis(self.timings.sync_refetch_timeout_ms);
        match timeout(limit, self.fetch(id)).await {
            Ok(Ok(snapshot)) => Ok(Outcome::Complete(snapshot)),
            Ok(Err(e)) => {
                warn!("Refetch from {} failed: {}", id, e);
                Ok(Outcome::Partial(TelemetrySnapshot::reconnected(self.last_battery().await)))
            }
            Err(_) => {
                warn!("Refetch from {} failed: {}", id, LinkError::Timeout(Stage::Refetch));
                Ok(Outcome::Partial(TelemetrySnapshot::reconnected(self.last_battery().await)))
            }
        }
    }

    /// Read the ring. Battery is required; activity and heart rate are
    /// best-effort unless they fail because the link itself is gone.
    async fn fetch(&self, id: &str) -> Result<TelemetrySnapshot, LinkError> {
        let live = self.adapter.acquire().await?;
        let transport = live.transport();

        let raw = transport.read_characteristic(id, BATTERY_SERVICE, BATTERY_LEVEL).await?;
        let battery = parse_battery_level(&raw)
            .ok_or_else(|| LinkError::SyncFailed("empty battery level".to_string()))?;

        let activity = self
            .read_optional(transport, id, STEP_SERVICE, STEP_COUNT)
            .await?
            .and_then(|data| parse_activity(&data));
        let heart_rate = self
            .read_optional(transport, id, HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT)
            .await?
            .and_then(|data| parse_hr_measurement(&data))
            .filter(|&bpm| bpm > 0);

        debug!("Fetched battery={}% activity={:?} hr={:?}", battery, activity, heart_rate);
        Ok(TelemetrySnapshot {
            battery: Some(battery),
            steps: activity.as_ref().map(|a| a.steps),
            distance_km: activity.as_ref().and_then(|a| a.distance_km),
            calories: activity.as_ref().and_then(|a| a.calories),
            heart_rate,
            ..TelemetrySnapshot::empty()
        })
    }

    async fn read_optional(
        &self,
        transport: &dyn BleTransport,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Vec<u8>>, LinkError> {
        match transport.read_characteristic(id, service, characteristic).await {
            Ok(data) => Ok(Some(data)),
            Err(e) => match self.classifier.classify(&e.message) {
                RecoveryAction::ReconnectDevice | RecoveryAction::RecreateAdapter => Err(e.into()),
                _ => {
                    debug!("Optional read of {} skipped: {}", characteristic, e);
                    Ok(None)
                }
            },
        }
    }

    /// Merge into the in-memory snapshot and persist the result.
    async fn publish(&self, fresh: &TelemetrySnapshot) -> TelemetrySnapshot {
        if self.lifetime.is_cancelled() {
            debug!("Dropping sync result after shutdown");
            return fresh.clone();
        }
        let merged = {
            let mut s = self.state.lock().await;
            let merged = fresh.merged_over(s.snapshot.as_ref());
            s.snapshot = Some(merged.clone());
            merged
        };
        self.store.save_latest(&merged);
        merged
    }

    async fn cached(&self) -> TelemetrySnapshot {
        if let Some(snapshot) = self.store.load_latest() {
            return snapshot;
        }
        self.state
            .lock()
            .await
            .snapshot
            .clone()
            .unwrap_or_else(TelemetrySnapshot::empty)
    }

    async fn last_battery(&self) -> Option<u8> {
        let in_memory = self.state.lock().await.snapshot.as_ref().and_then(|s| s.battery);
        in_memory.or_else(|| self.store.load_latest().and_then(|s| s.battery))
    }
}
