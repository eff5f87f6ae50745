//! Collaborator interfaces the lifecycle core is written against.
//!
//! The BLE stack, the permission prompt and the snapshot cache live outside
//! the core. The daemon plugs in the BlueZ transport; tests plug
//! in a scripted fake.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(
        ((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128,
    )
}

pub const HEART_RATE_SERVICE: Uuid = ble_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = ble_uuid(0x2A37);
pub const BATTERY_SERVICE: Uuid = ble_uuid(0x180F);
pub const BATTERY_LEVEL: Uuid = ble_uuid(0x2A19);
pub const STEP_SERVICE: Uuid = ble_uuid(0x181C);
pub const STEP_COUNT: Uuid = ble_uuid(0x2A56);

/// Raw error from the BLE stack. Only its text is meaningful to the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Let the stack reconnect on its own when the device comes back in range.
    pub auto_connect: bool,
    pub request_mtu: Option<u16>,
}

/// Notification payloads. Dropping the stream ends the subscription.
pub type NotificationStream = BoxStream<'static, TransportResult<Vec<u8>>>;

#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn power_state(&self) -> TransportResult<PowerState>;

    /// Ask the platform to switch the radio on.
    async fn request_enable(&self) -> TransportResult<()>;

    /// Power changes of the current adapter. Ends when the adapter is destroyed.
    async fn power_events(&self) -> TransportResult<BoxStream<'static, PowerState>>;

    async fn start_scan(&self) -> TransportResult<BoxStream<'static, Advertisement>>;
    async fn stop_scan(&self) -> TransportResult<()>;

    async fn connect(&self, id: &str, opts: &ConnectOptions) -> TransportResult<()>;
    async fn disconnect(&self, id: &str) -> TransportResult<()>;
    async fn is_connected(&self, id: &str) -> TransportResult<bool>;
    async fn discover_services(&self, id: &str) -> TransportResult<()>;

    async fn read_characteristic(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Vec<u8>>;

    async fn subscribe_notify(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<NotificationStream>;

    async fn destroy_adapter(&self) -> TransportResult<()>;
    async fn create_adapter(&self, restore_id: &str) -> TransportResult<()>;
}

/// Host platform, which decides how a powered-off radio and permissions are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "os", rename_all = "snake_case")]
pub enum Platform {
    Android { api_level: u32 },
    Ios,
    #[default]
    Linux,
}

impl Platform {
    /// iOS gives apps no way to switch the radio on.
    pub fn can_request_enable(&self) -> bool {
        !matches!(self, Platform::Ios)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlePermission {
    FineLocation,
    BluetoothScan,
    BluetoothConnect,
}

/// Runtime permissions needed before scanning or connecting.
pub fn required_permissions(platform: Platform) -> Vec<BlePermission> {
    match platform {
        Platform::Android { api_level } if api_level >= 31 => vec![
            BlePermission::BluetoothScan,
            BlePermission::BluetoothConnect,
            BlePermission::FineLocation,
        ],
        Platform::Android { .. } => vec![BlePermission::FineLocation],
        Platform::Ios | Platform::Linux => Vec::new(),
    }
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_ble_permissions(&self) -> bool;
}

/// BlueZ authorises through D-Bus policy, so there is nothing to prompt for.
pub struct NoPrompt;

#[async_trait]
impl PermissionGate for NoPrompt {
    async fn request_ble_permissions(&self) -> bool {
        true
    }
}
