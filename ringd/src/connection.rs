//! Connection lifecycle for the selected ring.
//!
//! One connect runs at a time. Every connect fully resets the adapter before
//! dialing, because a half-torn-down adapter is the usual reason a ring will
//! not answer. The whole call, preparation included, is bounded by the hard
//! connect timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterHandle, LiveAdapter};
use crate::classify::{ErrorClassifier, Recovery, RecoveryAction};
use crate::config::Timings;
use crate::error::{LinkError, Stage};
use crate::scan::ScanController;
use crate::state::{ConnectionState, Device, FlagGuard, RingState, SharedState};
use crate::status::StatusBoard;
use crate::telemetry::{parse_battery_level, TelemetrySnapshot};
use crate::transport::{
    ConnectOptions, PermissionGate, Platform, PowerState, BATTERY_LEVEL, BATTERY_SERVICE,
};

/// Called with every ring that completes a connect, so it can be remembered.
pub type PairedHook = Box<dyn Fn(&Device) + Send + Sync>;

pub struct ConnectionController {
    adapter: Arc<AdapterHandle>,
    scan: Arc<ScanController>,
    state: SharedState,
    status: StatusBoard,
    classifier: Arc<ErrorClassifier>,
    permissions: Arc<dyn PermissionGate>,
    platform: Platform,
    timings: Timings,
    options: ConnectOptions,
    connecting: Arc<AtomicBool>,
    recovering: Arc<AtomicBool>,
    on_paired: Option<PairedHook>,
    lifetime: CancellationToken,
}

impl ConnectionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<AdapterHandle>,
        scan: Arc<ScanController>,
        state: SharedState,
        status: StatusBoard,
        classifier: Arc<ErrorClassifier>,
        permissions: Arc<dyn PermissionGate>,
        platform: Platform,
        timings: Timings,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            scan,
            state,
            status,
            classifier,
            permissions,
            platform,
            timings,
            options: ConnectOptions::default(),
            connecting: Arc::new(AtomicBool::new(false)),
            recovering: Arc::new(AtomicBool::new(false)),
            on_paired: None,
            lifetime,
        }
    }

    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_paired_hook(mut self, hook: PairedHook) -> Self {
        self.on_paired = Some(hook);
        self
    }

    /// Connect to `id`. Never fails loudly: the outcome is the return value,
    /// and the reason for a failure lands in `last_error` and the status line.
    ///
    /// An adapter fault seen while connecting ends this call and starts fault
    /// recovery in the background.
    pub async fn connect(self: &Arc<Self>, id: &str) -> bool {
        let started = Instant::now();
        if self.lifetime.is_cancelled() {
            return false;
        }
        self.status.acknowledge().await;

        match self.connect_from(id, started).await {
            Ok(()) => true,
            Err(e) => {
                if self.classifier.classify_error(&e) == RecoveryAction::RecreateAdapter {
                    let this = Arc::clone(self);
                    let lifetime = self.lifetime.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = lifetime.cancelled() => debug!("Fault recovery abandoned on shutdown"),
                            _ = this.recover_from_fault() => {}
                        }
                    });
                }
                false
            }
        }
    }

    /// A single connect attempt with all bookkeeping, but no escalation.
    pub async fn connect_once(&self, id: &str) -> Result<(), LinkError> {
        self.connect_from(id, Instant::now()).await
    }

    /// One attempt whose deadlines count from `started`.
    async fn connect_from(&self, id: &str, started: Instant) -> Result<(), LinkError> {
        let result = self.attempt(id, started).await;
        if let Err(e) = &result {
            self.record_failure(id, e).await;
        }
        result
    }

    async fn attempt(&self, id: &str, started: Instant) -> Result<(), LinkError> {
        let hard_deadline = started + Duration::from_millis(self.timings.connect_hard_timeout_ms);
        let soft_deadline = started + Duration::from_millis(self.timings.connect_soft_timeout_ms);

        let already = self.state.lock().await.linked_target();
        if already.as_deref() == Some(id) {
            if timeout_at(hard_deadline, self.probe_alive(id)).await.unwrap_or(false) {
                info!("Already connected to {}", id);
                return Ok(());
            }
            info!("Link to {} is stale, reconnecting", id);
        }

        let Some(_guard) = FlagGuard::try_raise(&self.connecting) else {
            return Err(LinkError::Busy);
        };

        match timeout_at(hard_deadline, self.permissions.request_ble_permissions()).await {
            Ok(true) => {}
            Ok(false) => return Err(LinkError::PermissionDenied),
            Err(_) => {
                warn!("Permission request for {} outlived the connect timeout", id);
                return Err(LinkError::Timeout(Stage::Prepare));
            }
        }

        {
            let mut s = self.state.lock().await;
            if let Some(previous) = s.target.clone().filter(|t| t != id) {
                s.set_device_connected(&previous, false);
            }
            s.target = Some(id.to_string());
            s.services_ready = false;
            if s.connection != ConnectionState::Faulted {
                s.transition(ConnectionState::Connecting);
            }
        }
        let name = self.state.lock().await.display_name(id);
        self.status.transient(format!("Connecting to {}...", name)).await;

        let establish = self.establish(id);
        tokio::pin!(establish);
        let soft = tokio::time::sleep_until(soft_deadline);
        tokio::pin!(soft);
        let mut soft_fired = false;

        let live = loop {
            tokio::select! {
                result = &mut establish => break result?,
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    info!("Connect to {} passed the soft timeout", id);
                    self.status.transient("Connection is taking longer than expected...").await;
                }
                _ = tokio::time::sleep_until(hard_deadline) => {
                    warn!("Connect to {} hit the hard timeout after {:?}", id, started.elapsed());
                    return Err(LinkError::Timeout(Stage::Connect));
                }
            }
        };

        if self.lifetime.is_cancelled() {
            return Err(LinkError::ShuttingDown);
        }
        self.state.lock().await.transition(ConnectionState::Connected);
        info!("Connected to {} in {:?}", id, started.elapsed());

        self.finish(&live, id, hard_deadline).await;
        Ok(())
    }

    /// Everything up to a live link: power, adapter reset, settle, dial.
    async fn establish(&self, id: &str) -> Result<LiveAdapter, LinkError> {
        let live = self.adapter.acquire().await?;
        let power = live.ensure_powered(self.platform).await?;
        self.state.lock().await.power = power;

        let live = self.adapter.recreate().await?;
        {
            let mut s = self.state.lock().await;
            if s.connection == ConnectionState::Faulted {
                s.transition(ConnectionState::Idle);
                s.transition(ConnectionState::Connecting);
            }
        }
        tokio::time::sleep(Duration::from_millis(self.timings.connect_settle_ms)).await;
        self.scan.stop_scan().await;

        debug!("Dialing {}", id);
        live.transport().connect(id, &self.options).await?;
        Ok(live)
    }

    /// Post-connect steps. They only improve the connection, so running out
    /// of budget here still counts as connected.
    async fn finish(&self, live: &LiveAdapter, id: &str, deadline: Instant) {
        let stabilize = Instant::now() + Duration::from_millis(self.timings.stabilize_ms);
        tokio::time::sleep_until(stabilize.min(deadline)).await;

        let services_ready = match timeout_at(deadline, live.transport().discover_services(id)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Service discovery on {} failed, continuing degraded: {}", id, e);
                false
            }
            Err(_) => {
                warn!("Service discovery on {} ran out of time, continuing degraded", id);
                false
            }
        };

        let battery_deadline =
            (Instant::now() + Duration::from_millis(self.timings.battery_verify_timeout_ms)).min(deadline);
        let battery = match timeout_at(
            battery_deadline,
            live.transport().read_characteristic(id, BATTERY_SERVICE, BATTERY_LEVEL),
        )
        .await
        {
            Ok(Ok(data)) => parse_battery_level(&data),
            Ok(Err(e)) => {
                debug!("Battery read on {} failed: {}", id, e);
                None
            }
            Err(_) => {
                debug!("Battery read on {} timed out", id);
                None
            }
        };

        if self.lifetime.is_cancelled() {
            return;
        }
        let paired = {
            let mut s = self.state.lock().await;
            s.services_ready = services_ready;
            s.last_error = None;
            if let Some(level) = battery {
                let fresh = TelemetrySnapshot { battery: Some(level), ..TelemetrySnapshot::empty() };
                s.snapshot = Some(fresh.merged_over(s.snapshot.as_ref()));
            }
            let device = paired_entry(&s, id);
            s.remember_paired(device.clone());
            s.set_device_connected(id, true);
            device
        };
        self.status.clear().await;
        if let Some(hook) = &self.on_paired {
            hook(&paired);
        }
    }

    async fn record_failure(&self, id: &str, err: &LinkError) {
        warn!("Connect to {} failed: {}", id, err);
        if matches!(err, LinkError::Busy) {
            self.state.lock().await.last_error = Some(err.to_string());
            self.status.transient("Connection already in progress").await;
            return;
        }
        {
            let mut s = self.state.lock().await;
            s.last_error = Some(err.to_string());
            s.services_ready = false;
            s.set_device_connected(id, false);
            if s.connection == ConnectionState::Connecting {
                s.transition(ConnectionState::Idle);
            }
        }
        match err {
            LinkError::PermissionDenied => self.status.fatal(err.to_string()).await,
            LinkError::BluetoothDisabled => {
                self.status.transient("Bluetooth not enabled").await;
            }
            LinkError::Timeout(_) => self.status.expiring("Connection timed out").await,
            LinkError::ShuttingDown => {}
            _ => self.status.expiring(format!("Could not connect: {}", err)).await,
        }
    }

    /// Whether the link to `id` is up, asked within the liveness timeout.
    pub async fn probe_alive(&self, id: &str) -> bool {
        let live = match self.adapter.acquire().await {
            Ok(live) => live,
            Err(e) => {
                debug!("Liveness probe skipped, no adapter: {}", e);
                return false;
            }
        };
        let limit = Duration::from_millis(self.timings.liveness_timeout_ms);
        match timeout(limit, live.transport().is_connected(id)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                let alive = self.classifier.indicates_alive(&e.message);
                debug!("Liveness probe on {} failed ({}), alive={}", id, e, alive);
                alive
            }
            Err(_) => {
                debug!("Liveness probe on {} timed out", id);
                false
            }
        }
    }

    /// Recover from an adapter fault: recreate the adapter, then reconnect
    /// the selected ring once. Never leaves the state in `Faulted` unless the
    /// adapter itself cannot be brought back.
    pub async fn recover_from_fault(&self) -> bool {
        let Some(_guard) = FlagGuard::try_raise(&self.recovering) else {
            info!("Fault recovery already running");
            return false;
        };
        info!("Recovering from adapter fault");

        let target = {
            let mut s = self.state.lock().await;
            s.transition(ConnectionState::Faulted);
            s.services_ready = false;
            if let Some(id) = s.target.clone() {
                s.set_device_connected(&id, false);
            }
            s.target.clone()
        };
        self.scan.stop_scan().await;

        let live = match self.adapter.recreate().await {
            Ok(live) => live,
            Err(e) => {
                self.state.lock().await.last_error = Some(e.to_string());
                self.status.fatal("Bluetooth could not be restarted. Try turning it off and on.").await;
                return false;
            }
        };
        let power = live.transport().power_state().await.unwrap_or(PowerState::Unknown);
        {
            let mut s = self.state.lock().await;
            s.power = power;
            s.transition(ConnectionState::Idle);
        }

        let Some(id) = target else {
            info!("Adapter recovered, no ring selected");
            return true;
        };

        tokio::select! {
            _ = self.lifetime.cancelled() => return false,
            _ = tokio::time::sleep(Duration::from_millis(self.timings.fault_reconnect_delay_ms)) => {}
        }
        match self.connect_once(&id).await {
            Ok(()) => {
                info!("Reconnected to {} after adapter fault", id);
                true
            }
            Err(e) => {
                let name = self.state.lock().await.display_name(&id);
                self.status.fatal(format!("Could not reconnect to {}: {}", name, e)).await;
                false
            }
        }
    }

    /// The link to the selected ring dropped: wait, probe, reconnect once.
    pub async fn handle_link_loss(&self) -> bool {
        let id = {
            let mut s = self.state.lock().await;
            let Some(id) = s.target.clone() else {
                return false;
            };
            if !s.connection.is_linked() && s.connection != ConnectionState::Disconnected {
                debug!("Ignoring link loss in {:?}", s.connection);
                return false;
            }
            s.set_device_connected(&id, false);
            s.services_ready = false;
            s.transition(ConnectionState::Disconnected);
            id
        };
        info!("Lost link to {}", id);

        tokio::select! {
            _ = self.lifetime.cancelled() => return false,
            _ = tokio::time::sleep(Duration::from_millis(self.timings.link_loss_probe_delay_ms)) => {}
        }

        if self.probe_alive(&id).await {
            info!("Link to {} came back on its own", id);
            let mut s = self.state.lock().await;
            s.set_device_connected(&id, true);
            s.transition(ConnectionState::Connected);
            return true;
        }
        match self.connect_once(&id).await {
            Ok(()) => true,
            Err(e) => {
                info!("Reconnect to {} after link loss failed: {}", id, e);
                false
            }
        }
    }

    /// Drop the link to the selected ring. Local state is cleared even when
    /// the transport refuses, so the user is never stuck "connected".
    pub async fn disconnect(&self) {
        let target = self.state.lock().await.target.clone();
        if let Some(id) = &target {
            match self.adapter.acquire().await {
                Ok(live) => {
                    if let Err(e) = live.transport().disconnect(id).await {
                        warn!("Transport disconnect of {} failed: {}", id, e);
                    }
                }
                Err(e) => warn!("No adapter to disconnect {}: {}", id, e),
            }
        }

        let mut s = self.state.lock().await;
        if let Some(id) = &target {
            s.set_device_connected(id, false);
            info!("Disconnected from {}", id);
        }
        s.target = None;
        s.services_ready = false;
        settle_idle(&mut s);
    }

    /// Back to a clean slate: no scan, no link, no remembered rings, fresh adapter.
    pub async fn reset_all(&self) -> bool {
        info!("Resetting connection state");
        self.scan.stop_scan().await;
        self.disconnect().await;
        {
            let mut s = self.state.lock().await;
            s.available_devices.clear();
            s.paired_devices.clear();
            s.last_error = None;
        }
        self.status.acknowledge().await;

        match self.adapter.recreate().await {
            Ok(live) => {
                let power = live.transport().power_state().await.unwrap_or(PowerState::Unknown);
                let mut s = self.state.lock().await;
                s.power = power;
                s.transition(ConnectionState::Idle);
                true
            }
            Err(e) => {
                self.state.lock().await.last_error = Some(e.to_string());
                self.status.fatal("Bluetooth could not be restarted. Try turning it off and on.").await;
                false
            }
        }
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recovery for ConnectionController {
    async fn recreate_adapter(&self) -> bool {
        self.recover_from_fault().await
    }

    async fn reconnect_device(&self) -> bool {
        self.handle_link_loss().await
    }
}

/// Walk to `Idle` through the states the table allows. A running scan keeps
/// its state; the scan session returns it to `Idle` when it ends.
fn settle_idle(s: &mut RingState) {
    if s.connection == ConnectionState::Scanning {
        return;
    }
    if s.connection.is_linked() {
        s.transition(ConnectionState::Disconnected);
    }
    s.transition(ConnectionState::Idle);
}

fn paired_entry(s: &RingState, id: &str) -> Device {
    let known = s
        .available_devices
        .iter()
        .chain(s.paired_devices.iter())
        .find(|d| d.id == id)
        .cloned();
    Device {
        connected: true,
        ..known.unwrap_or_else(|| Device {
            id: id.to_string(),
            display_name: s.display_name(id),
            signal: 0,
            is_supported_product: true,
            connected: true,
        })
    }
}
