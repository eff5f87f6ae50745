//! Error taxonomy for the connection lifecycle.
//!
//! Every error renders to text that the [`crate::classify`] rules can match,
//! so a `LinkError` can be routed to a recovery action without a second
//! hand-written mapping.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::transport::TransportError;

/// Which step of an operation ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Connect,
    Liveness,
    Discovery,
    Battery,
    Fetch,
    Refetch,
    Subscribe,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prepare => "connection setup",
            Stage::Connect => "connect",
            Stage::Liveness => "liveness check",
            Stage::Discovery => "service discovery",
            Stage::Battery => "battery read",
            Stage::Fetch => "data fetch",
            Stage::Refetch => "data refetch",
            Stage::Subscribe => "heart rate subscription",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Bluetooth not enabled")]
    BluetoothDisabled,

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("{0} timed out")]
    Timeout(Stage),

    #[error("device {0} disconnected")]
    DeviceDisconnected(String),

    #[error("adapter faulted: {0}")]
    AdapterFaulted(String),

    #[error("sync failed: {0}")]
    SyncFailed(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("no device connected")]
    NotConnected,

    #[error("a connection attempt is already in progress")]
    Busy,

    #[error("ring manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
