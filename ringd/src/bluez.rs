//! `BleTransport` over BlueZ, via the `bluer` D-Bus bindings.
//!
//! Device ids are BlueZ addresses ("AA:BB:CC:DD:EE:FF"). The "adapter" the
//! core creates and destroys is our handle on a BlueZ adapter object; the
//! D-Bus session itself lives as long as the transport.

use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Device, Session};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::classify::{ErrorClassifier, RecoveryAction};
use crate::transport::{
    Advertisement, BleTransport, ConnectOptions, NotificationStream, PowerState, TransportError,
    TransportResult,
};

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        TransportError::new(e.to_string())
    }
}

/// Classifier with the error texts BlueZ produces ahead of the defaults.
pub fn classifier() -> ErrorClassifier {
    ErrorClassifier::default()
        .with_rule("does not exist", RecoveryAction::RecreateAdapter)
        .with_rule("Resource Not Ready", RecoveryAction::RecreateAdapter)
        .with_rule("Not Connected", RecoveryAction::ReconnectDevice)
        .with_rule("connection abort", RecoveryAction::ReconnectDevice)
        .with_liveness_markers(&["already connected", "Already Connected", "AlreadyConnected"])
}

pub struct BluezTransport {
    session: Session,
    adapter: Mutex<Option<Adapter>>,
}

impl BluezTransport {
    pub async fn new() -> TransportResult<Self> {
        let session = Session::new().await?;
        Ok(Self { session, adapter: Mutex::new(None) })
    }

    async fn adapter(&self) -> TransportResult<Adapter> {
        self.adapter
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::new("Bluetooth adapter was destroyed"))
    }

    async fn device(&self, id: &str) -> TransportResult<Device> {
        let address: Address = id
            .parse()
            .map_err(|e| TransportError::new(format!("Invalid address '{}': {}", id, e)))?;
        Ok(self.adapter().await?.device(address)?)
    }
}

#[async_trait]
impl BleTransport for BluezTransport {
    async fn power_state(&self) -> TransportResult<PowerState> {
        let powered = self.adapter().await?.is_powered().await?;
        Ok(if powered { PowerState::On } else { PowerState::Off })
    }

    async fn request_enable(&self) -> TransportResult<()> {
        let adapter = self.adapter().await?;
        info!("Powering on adapter {}", adapter.name());
        adapter.set_powered(true).await?;
        Ok(())
    }

    async fn power_events(&self) -> TransportResult<BoxStream<'static, PowerState>> {
        let events = self.adapter().await?.events().await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(true)) => Some(PowerState::On),
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => Some(PowerState::Off),
                    _ => None,
                }
            })
            .boxed())
    }

    async fn start_scan(&self) -> TransportResult<BoxStream<'static, Advertisement>> {
        let adapter = self.adapter().await?;
        let discover = adapter.discover_devices().await?;
        // Dropping the stream ends the discovery session.
        Ok(discover
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    let AdapterEvent::DeviceAdded(addr) = event else {
                        return None;
                    };
                    let device = adapter.device(addr).ok()?;
                    Some(Advertisement {
                        id: addr.to_string(),
                        name: device.name().await.ok().flatten(),
                        rssi: device.rssi().await.ok().flatten().unwrap_or(0),
                        services: device
                            .uuids()
                            .await
                            .ok()
                            .flatten()
                            .map(|uuids| uuids.into_iter().collect())
                            .unwrap_or_default(),
                    })
                }
            })
            .boxed())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        debug!("Discovery ends with its stream");
        Ok(())
    }

    async fn connect(&self, id: &str, opts: &ConnectOptions) -> TransportResult<()> {
        let device = self.device(id).await?;
        if opts.auto_connect {
            // BlueZ reconnects trusted devices on its own.
            device.set_trusted(true).await?;
        }
        if let Some(mtu) = opts.request_mtu {
            debug!("BlueZ negotiates MTU itself, ignoring request for {}", mtu);
        }
        if device.is_connected().await? {
            return Ok(());
        }
        info!("Connecting to {}...", id);
        device.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> TransportResult<()> {
        self.device(id).await?.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> TransportResult<bool> {
        Ok(self.device(id).await?.is_connected().await?)
    }

    async fn discover_services(&self, id: &str) -> TransportResult<()> {
        let device = self.device(id).await?;
        // Wait briefly for services to be resolved
        for _ in 0..20 {
            if device.is_services_resolved().await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err(TransportError::new(format!("services of {} not resolved", id)))
    }

    async fn read_characteristic(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Vec<u8>> {
        let device = self.device(id).await?;
        let chr = find_characteristic(&device, service, characteristic).await?;
        Ok(chr.read().await?)
    }

    async fn subscribe_notify(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<NotificationStream> {
        let device = self.device(id).await?;
        let chr = find_characteristic(&device, service, characteristic).await?;
        let notify = chr.notify().await?;
        Ok(notify.map(Ok).boxed())
    }

    async fn destroy_adapter(&self) -> TransportResult<()> {
        if let Some(adapter) = self.adapter.lock().await.take() {
            info!("Released adapter {}", adapter.name());
        }
        Ok(())
    }

    async fn create_adapter(&self, restore_id: &str) -> TransportResult<()> {
        let adapter = if restore_id.is_empty() {
            self.session.default_adapter().await?
        } else {
            self.session.adapter(restore_id)?
        };
        if let Err(e) = adapter.address().await {
            warn!("Adapter {} is not usable: {}", adapter.name(), e);
            return Err(e.into());
        }
        info!("Using BLE adapter: {}", adapter.name());
        *self.adapter.lock().await = Some(adapter);
        Ok(())
    }
}

/// Walk the GATT service tree to find a characteristic.
async fn find_characteristic(
    device: &Device,
    service: Uuid,
    characteristic: Uuid,
) -> TransportResult<Characteristic> {
    for svc in device.services().await? {
        if svc.uuid().await? != service {
            continue;
        }
        for chr in svc.characteristics().await? {
            if chr.uuid().await? == characteristic {
                return Ok(chr);
            }
        }
    }
    Err(TransportError::new(format!(
        "characteristic {} not found in service {}",
        characteristic, service
    )))
}
