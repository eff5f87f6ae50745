//! Shared lifecycle state, updated by the controllers and read by the
//! socket server and debug console.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::telemetry::TelemetrySnapshot;
use crate::transport::PowerState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Syncing,
    Disconnected,
    Faulted,
}

impl ConnectionState {
    /// The transition table. Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next {
            return true;
        }
        match self {
            Idle => matches!(next, Scanning | Connecting | Faulted),
            Scanning => matches!(next, Idle | Connecting | Faulted),
            Connecting => matches!(next, Connected | Idle | Faulted),
            Connected => matches!(next, Connecting | Syncing | Disconnected | Faulted),
            Syncing => matches!(next, Connected | Disconnected | Faulted),
            Disconnected => matches!(next, Idle | Connecting | Connected | Faulted),
            // Leaving Faulted requires a recreated adapter; only the recovery path does this.
            Faulted => matches!(next, Idle),
        }
    }

    /// A link to the target ring is up.
    pub fn is_linked(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Syncing)
    }
}

/// A ring seen during scanning or remembered from a previous connect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub display_name: String,
    /// RSSI in dBm.
    pub signal: i16,
    pub is_supported_product: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Transient,
    Fatal,
}

/// User-facing status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub text: String,
    pub kind: StatusKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct RingState {
    pub connection: ConnectionState,
    /// The selected ring. Kept through link loss so recovery knows what to reconnect.
    pub target: Option<String>,
    pub power: PowerState,
    pub scanning: bool,
    pub services_ready: bool,
    pub last_error: Option<String>,
    pub status: Option<StatusMessage>,
    #[serde(skip)]
    pub(crate) status_seq: u64,
    pub available_devices: Vec<Device>,
    pub paired_devices: Vec<Device>,
    pub snapshot: Option<TelemetrySnapshot>,
    pub heart_rate: Option<u16>,
    pub heart_rate_simulated: bool,
    /// No sample accepted yet since the monitor started.
    pub measuring: bool,
}

impl Default for RingState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Idle,
            target: None,
            power: PowerState::Unknown,
            scanning: false,
            services_ready: false,
            last_error: None,
            status: None,
            status_seq: 0,
            available_devices: Vec::new(),
            paired_devices: Vec::new(),
            snapshot: None,
            heart_rate: None,
            heart_rate_simulated: false,
            measuring: false,
        }
    }
}

pub type SharedState = Arc<Mutex<RingState>>;

/// Holds a busy flag raised and lowers it on drop, whichever way the
/// owning operation ends.
pub struct FlagGuard {
    flag: Arc<AtomicBool>,
}

impl FlagGuard {
    /// Raise `flag`, or None if it is already raised.
    pub fn try_raise(flag: &Arc<AtomicBool>) -> Option<FlagGuard> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(FlagGuard { flag: flag.clone() })
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl RingState {
    /// Move to `next` if the table allows it. Illegal moves are logged and ignored.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.connection == next {
            return true;
        }
        if !self.connection.can_transition_to(next) {
            error!("Illegal connection transition {:?} -> {:?}", self.connection, next);
            return false;
        }
        info!("Connection state {:?} -> {:?}", self.connection, next);
        self.connection = next;
        true
    }

    /// Target id, only while the link is up.
    pub fn linked_target(&self) -> Option<String> {
        if self.connection.is_linked() {
            self.target.clone()
        } else {
            None
        }
    }

    /// Insert or refresh a discovered ring. New ids go to the front, known
    /// ids keep their position. Returns true for a first sighting.
    pub fn upsert_available(&mut self, device: Device) -> bool {
        if let Some(known) = self.available_devices.iter_mut().find(|d| d.id == device.id) {
            known.signal = device.signal;
            if known.display_name.is_empty() && !device.display_name.is_empty() {
                known.display_name = device.display_name;
            }
            return false;
        }
        self.available_devices.insert(0, device);
        true
    }

    /// Mirror a connected flag into both device lists.
    pub fn set_device_connected(&mut self, id: &str, connected: bool) {
        for d in self
            .available_devices
            .iter_mut()
            .chain(self.paired_devices.iter_mut())
            .filter(|d| d.id == id)
        {
            d.connected = connected;
        }
    }

    pub fn remember_paired(&mut self, device: Device) {
        self.paired_devices.retain(|d| d.id != device.id);
        self.paired_devices.insert(0, device);
    }

    pub fn display_name(&self, id: &str) -> String {
        self.available_devices
            .iter()
            .chain(self.paired_devices.iter())
            .find(|d| d.id == id)
            .map(|d| d.display_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| id.to_string())
    }
}
