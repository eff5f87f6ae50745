//! Connection lifecycle for a BLE smart ring.
//!
//! [`manager::RingManager`] is the entry point: it owns the adapter, drives
//! scanning, connecting and fault recovery, supervises telemetry sync and the
//! real-time heart rate stream, and falls back to cached or simulated values
//! when the ring cannot be reached. The BLE stack is reached through the
//! [`transport::BleTransport`] trait.

pub mod adapter;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod cache;
pub mod classify;
pub mod config;
pub mod connection;
pub mod debug_server;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod scan;
pub mod server;
pub mod state;
pub mod status;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use error::LinkError;
pub use manager::{RingManager, RingManagerBuilder};
pub use state::{ConnectionState, Device, RingState};
pub use telemetry::TelemetrySnapshot;
