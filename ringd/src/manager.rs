//! The lifecycle manager the daemon surfaces talk to.
//!
//! `RingManager` wires the controllers together around one shared state and
//! one lifetime token. Cancelling the token (via [`RingManager::shutdown`])
//! stops every task the manager started and keeps late results from being
//! applied.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterHandle;
use crate::cache::{MemoryStore, SnapshotStore};
use crate::classify::{ErrorClassifier, FaultRouter, Recovery, RecoveryAction};
use crate::config::{self, PairedDevice, RingConfig};
use crate::connection::ConnectionController;
use crate::error::LinkError;
use crate::monitor::{HeartRateSample, MonitorHandle, RealtimeMonitor};
use crate::scan::{ProductFilter, ScanController};
use crate::state::{Device, RingState, SharedState};
use crate::status::StatusBoard;
use crate::sync::SyncController;
use crate::telemetry::TelemetrySnapshot;
use crate::transport::{BleTransport, NoPrompt, PermissionGate, PowerState};

pub struct RingManagerBuilder {
    transport: Arc<dyn BleTransport>,
    config: RingConfig,
    config_path: Option<String>,
    store: Arc<dyn SnapshotStore>,
    permissions: Arc<dyn PermissionGate>,
    classifier: ErrorClassifier,
}

impl RingManagerBuilder {
    pub fn config(mut self, config: RingConfig) -> Self {
        self.config = config;
        self
    }

    /// Save remembered rings back to this file as they change.
    pub fn persist_config_to(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = store;
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionGate>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Wire everything up and start the power watcher. Needs a running runtime.
    pub fn build(self) -> RingManager {
        let timings = self.config.timings.clone();
        let lifetime = CancellationToken::new();

        let mut initial = RingState {
            snapshot: self.store.load_latest(),
            ..RingState::default()
        };
        for paired in &self.config.paired {
            initial.paired_devices.push(Device {
                id: paired.id.clone(),
                display_name: paired.name.clone(),
                signal: 0,
                is_supported_product: true,
                connected: false,
            });
        }
        let state: SharedState = Arc::new(Mutex::new(initial));

        let status = StatusBoard::new(
            state.clone(),
            Duration::from_millis(timings.status_clear_ms),
            lifetime.clone(),
        );
        let adapter = Arc::new(AdapterHandle::new(
            self.transport,
            self.config.restore_id.clone(),
            Duration::from_millis(timings.adapter_retry_ms),
            Duration::from_millis(timings.adapter_settle_ms),
        ));
        let classifier = Arc::new(self.classifier);

        let mut filter = ProductFilter::new(&self.config.product_markers);
        for service in &self.config.product_services {
            filter = filter.with_service(*service);
        }
        let scan = Arc::new(ScanController::new(
            adapter.clone(),
            state.clone(),
            status.clone(),
            self.permissions.clone(),
            self.config.platform,
            filter,
            Duration::from_millis(timings.scan_timeout_ms),
            lifetime.clone(),
        ));

        let config = Arc::new(std::sync::Mutex::new(self.config.clone()));
        let config_path = self.config_path.clone();
        let connection = {
            let config = config.clone();
            let controller = ConnectionController::new(
                adapter.clone(),
                scan.clone(),
                state.clone(),
                status.clone(),
                classifier.clone(),
                self.permissions.clone(),
                self.config.platform,
                timings.clone(),
                lifetime.clone(),
            )
            .with_paired_hook(Box::new(move |device: &Device| {
                let mut cfg = config.lock().unwrap_or_else(|e| e.into_inner());
                cfg.remember(PairedDevice {
                    id: device.id.clone(),
                    name: device.display_name.clone(),
                });
                if let Some(path) = &config_path {
                    config::save(path, &cfg);
                }
            }));
            Arc::new(controller)
        };

        let recovery: Arc<dyn Recovery> = connection.clone();
        let router = Arc::new(FaultRouter::new(classifier.clone(), recovery, status.clone()));

        let sync = SyncController::new(
            adapter.clone(),
            connection.clone(),
            classifier,
            state.clone(),
            status.clone(),
            self.store.clone(),
            timings.clone(),
            lifetime.clone(),
        );
        let monitor = RealtimeMonitor::new(
            adapter.clone(),
            state.clone(),
            router.clone(),
            timings,
            lifetime.clone(),
        );

        let power_watch = tokio::spawn(watch_power(adapter.clone(), state.clone(), lifetime.clone()));

        RingManager {
            state,
            status,
            adapter,
            scan,
            connection,
            router,
            sync,
            monitor,
            heart_rate: Mutex::new(None),
            power_watch: Mutex::new(Some(power_watch)),
            config,
            config_path: self.config_path,
            lifetime,
        }
    }
}

pub struct RingManager {
    state: SharedState,
    status: StatusBoard,
    adapter: Arc<AdapterHandle>,
    scan: Arc<ScanController>,
    connection: Arc<ConnectionController>,
    router: Arc<FaultRouter>,
    sync: SyncController,
    monitor: RealtimeMonitor,
    heart_rate: Mutex<Option<MonitorHandle>>,
    power_watch: Mutex<Option<JoinHandle<()>>>,
    config: Arc<std::sync::Mutex<RingConfig>>,
    config_path: Option<String>,
    lifetime: CancellationToken,
}

impl RingManager {
    pub fn builder(transport: Arc<dyn BleTransport>) -> RingManagerBuilder {
        RingManagerBuilder {
            transport,
            config: RingConfig::default(),
            config_path: None,
            store: Arc::new(MemoryStore::default()),
            permissions: Arc::new(NoPrompt),
            classifier: ErrorClassifier::default(),
        }
    }

    pub async fn scan(&self) -> Result<(), LinkError> {
        self.scan_with(|_| {}).await
    }

    /// Scan, calling `on_discover` once for every newly seen ring.
    pub async fn scan_with<F>(&self, on_discover: F) -> Result<(), LinkError>
    where
        F: Fn(Device) + Send + Sync + 'static,
    {
        self.status.acknowledge().await;
        self.scan.start_scan(on_discover).await
    }

    pub async fn stop_scan(&self) {
        self.scan.stop_scan().await;
    }

    pub async fn connect(&self, id: &str) -> bool {
        self.connection.connect(id).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn sync(&self) -> TelemetrySnapshot {
        self.sync.sync().await
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.is_syncing()
    }

    /// Start (or restart) the heart rate monitor.
    pub async fn start_heart_rate_monitor<F>(&self, on_sample: F)
    where
        F: Fn(HeartRateSample) + Send + Sync + 'static,
    {
        let mut slot = self.heart_rate.lock().await;
        if let Some(previous) = slot.take() {
            previous.join().await;
        }
        *slot = Some(self.monitor.start(on_sample));
    }

    pub async fn stop_heart_rate_monitor(&self) {
        let handle = self.heart_rate.lock().await.take();
        if let Some(handle) = handle {
            handle.join().await;
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.heart_rate.lock().await.as_ref().is_some_and(|h| h.is_running())
    }

    /// Forget everything: monitor, scan, link, remembered rings.
    pub async fn reset_all(&self) -> bool {
        self.stop_heart_rate_monitor().await;
        let ok = self.connection.reset_all().await;
        {
            let mut cfg = self.config.lock().unwrap_or_else(|e| e.into_inner());
            cfg.paired.clear();
            if let Some(path) = &self.config_path {
                config::save(path, &cfg);
            }
        }
        ok
    }

    /// A copy of the current lifecycle state.
    pub async fn state(&self) -> RingState {
        self.state.lock().await.clone()
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    /// Classify `err` and run the matching recovery.
    pub async fn report_error(&self, err: &LinkError) -> RecoveryAction {
        self.router.route(err).await
    }

    /// Cancel every task the manager started and release the adapter.
    pub async fn shutdown(&self) {
        if self.lifetime.is_cancelled() {
            return;
        }
        info!("Ring manager shutting down");
        self.lifetime.cancel();
        self.stop_heart_rate_monitor().await;
        self.scan.stop_scan().await;
        if let Some(task) = self.power_watch.lock().await.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Power watcher failed: {:?}", e);
                }
            }
        }
        self.adapter.release().await;
    }
}

/// Mirror the radio power state into the shared state, following the adapter
/// across recreations.
async fn watch_power(adapter: Arc<AdapterHandle>, state: SharedState, lifetime: CancellationToken) {
    tokio::select! {
        _ = lifetime.cancelled() => debug!("Power watcher stopped"),
        _ = follow_power(adapter, state) => {}
    }
}

async fn follow_power(adapter: Arc<AdapterHandle>, state: SharedState) {
    let mut live = adapter.watch_live();
    'adapter: loop {
        let current = *live.borrow_and_update();
        let lease = match current {
            Some(generation) => adapter.current().await.filter(|l| l.generation() == generation),
            None => None,
        };
        if let Some(lease) = lease {
            match lease.transport().power_events().await {
                Ok(mut events) => {
                    debug!("Watching power of adapter generation {}", lease.generation());
                    loop {
                        tokio::select! {
                            changed = live.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                continue 'adapter;
                            }
                            event = events.next() => match event {
                                Some(power) => apply_power(&state, power).await,
                                None => break,
                            }
                        }
                    }
                }
                Err(e) => warn!("Cannot watch adapter power: {}", e),
            }
        }
        if live.changed().await.is_err() {
            return;
        }
    }
}

async fn apply_power(state: &SharedState, power: PowerState) {
    let mut s = state.lock().await;
    if s.power != power {
        info!("Bluetooth power {:?} -> {:?}", s.power, power);
        s.power = power;
    }
}
