//! Discovery of supported rings.
//!
//! A scan session runs as its own task and ends on `stop_scan`, after the
//! scan timeout, when the advertisement stream ends, or when the adapter is
//! recreated underneath it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{AdapterHandle, LiveAdapter};
use crate::error::LinkError;
use crate::state::{ConnectionState, Device, SharedState};
use crate::status::StatusBoard;
use crate::transport::{Advertisement, PermissionGate, Platform};

/// Decides which advertisements belong to the supported product family.
#[derive(Debug, Clone)]
pub struct ProductFilter {
    name_markers: Vec<String>,
    services: Vec<Uuid>,
}

impl ProductFilter {
    pub fn new(name_markers: &[String]) -> Self {
        Self {
            name_markers: name_markers.iter().map(|m| m.to_lowercase()).collect(),
            services: Vec::new(),
        }
    }

    /// Also accept devices advertising this service, whatever their name.
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    pub fn matches(&self, adv: &Advertisement) -> bool {
        let by_name = adv.name.as_ref().is_some_and(|name| {
            let name = name.to_lowercase();
            self.name_markers.iter().any(|m| name.contains(m.as_str()))
        });
        by_name || adv.services.iter().any(|s| self.services.contains(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    TimedOut,
    StreamEnded,
    AdapterReplaced,
}

struct ScanSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ScanController {
    adapter: Arc<AdapterHandle>,
    state: SharedState,
    status: StatusBoard,
    permissions: Arc<dyn PermissionGate>,
    platform: Platform,
    filter: ProductFilter,
    timeout: Duration,
    session: Mutex<Option<ScanSession>>,
    /// Held for a whole start, so two starts cannot both install a session.
    starting: Mutex<()>,
    lifetime: CancellationToken,
}

impl ScanController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<AdapterHandle>,
        state: SharedState,
        status: StatusBoard,
        permissions: Arc<dyn PermissionGate>,
        platform: Platform,
        filter: ProductFilter,
        timeout: Duration,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            state,
            status,
            permissions,
            platform,
            filter,
            timeout,
            session: Mutex::new(None),
            starting: Mutex::new(()),
            lifetime,
        }
    }

    /// Start a scan session. `on_discover` fires once per newly seen ring.
    pub async fn start_scan<F>(&self, on_discover: F) -> Result<(), LinkError>
    where
        F: Fn(Device) + Send + Sync + 'static,
    {
        if !self.permissions.request_ble_permissions().await {
            self.status.fatal("Bluetooth permission denied").await;
            return Err(LinkError::PermissionDenied);
        }

        let _starting = self.starting.lock().await;
        self.stop_scan().await;

        let live = self.adapter.acquire().await?;
        let power = match live.ensure_powered(self.platform).await {
            Ok(power) => power,
            Err(e) => {
                self.status.transient("Bluetooth not enabled").await;
                return Err(e);
            }
        };
        let stream = live.transport().start_scan().await?;

        {
            let mut s = self.state.lock().await;
            s.power = power;
            s.scanning = true;
            s.available_devices.clear();
            if matches!(s.connection, ConnectionState::Idle | ConnectionState::Disconnected) {
                // Disconnected -> Scanning is not in the table; settle to Idle first.
                s.transition(ConnectionState::Idle);
                s.transition(ConnectionState::Scanning);
            }
        }
        self.status.transient("Scanning for rings...").await;

        let cancel = self.lifetime.child_token();
        let session = SessionTask {
            live,
            state: self.state.clone(),
            status: self.status.clone(),
            filter: self.filter.clone(),
            timeout: self.timeout,
            cancel: cancel.clone(),
            generation: self.adapter.subscribe(),
        };
        let task = tokio::spawn(session.run(stream, on_discover));

        *self.session.lock().await = Some(ScanSession { cancel, task });
        info!("Device scan task started.");
        Ok(())
    }

    /// Stop the running session, if any, and wait for it to wind down.
    pub async fn stop_scan(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        info!("Stopping Bluetooth scan.");
        session.cancel.cancel();
        match session.task.await {
            Ok(()) => debug!("Scan task finished."),
            Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
            Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }
}

struct SessionTask {
    live: LiveAdapter,
    state: SharedState,
    status: StatusBoard,
    filter: ProductFilter,
    timeout: Duration,
    cancel: CancellationToken,
    generation: watch::Receiver<u64>,
}

impl SessionTask {
    async fn run<F>(
        mut self,
        mut stream: futures::stream::BoxStream<'static, Advertisement>,
        on_discover: F,
    ) where
        F: Fn(Device) + Send + Sync + 'static,
    {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut found = 0usize;

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Stopped,
                _ = &mut deadline => break SessionEnd::TimedOut,
                _ = self.generation.changed() => break SessionEnd::AdapterReplaced,
                adv = stream.next() => {
                    let Some(adv) = adv else {
                        break SessionEnd::StreamEnded;
                    };
                    if !self.filter.matches(&adv) {
                        continue;
                    }
                    let device = Device {
                        id: adv.id.clone(),
                        display_name: adv.name.clone().unwrap_or_default(),
                        signal: adv.rssi,
                        is_supported_product: true,
                        connected: false,
                    };
                    let first_sighting = self.state.lock().await.upsert_available(device.clone());
                    if first_sighting {
                        found += 1;
                        info!("Found ring: {} ({}) RSSI={}", device.display_name, device.id, device.signal);
                        on_discover(device);
                    }
                }
            }
        };
        drop(stream);

        if end != SessionEnd::AdapterReplaced {
            if let Err(e) = self.live.transport().stop_scan().await {
                warn!("Failed to stop scan cleanly: {}", e);
            }
        }

        {
            let mut s = self.state.lock().await;
            s.scanning = false;
            if s.connection == ConnectionState::Scanning {
                s.transition(ConnectionState::Idle);
            }
        }

        match end {
            SessionEnd::TimedOut if found == 0 => {
                info!("Scan timed out without finding a ring");
                self.status.transient("No devices found").await;
            }
            SessionEnd::TimedOut | SessionEnd::StreamEnded => {
                info!("Scan complete, {} ring(s) found", found);
                self.status.clear().await;
            }
            SessionEnd::Stopped => info!("Scan stopped, {} ring(s) found", found),
            SessionEnd::AdapterReplaced => info!("Adapter recreated, scan session ended"),
        }
    }
}
