//! Persistent daemon configuration.
//!
//! Reads and writes `ringd_config.json` to remember paired rings, the
//! product filter and any timing overrides between daemon restarts.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transport::Platform;

/// Name fragments that identify the supported ring family.
pub const DEFAULT_PRODUCT_MARKERS: &[&str] = &["ring"];

/// A ring remembered from a previous successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Every delay and timeout used by the lifecycle, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub adapter_retry_ms: u64,
    pub adapter_settle_ms: u64,
    pub scan_timeout_ms: u64,
    pub connect_settle_ms: u64,
    pub connect_soft_timeout_ms: u64,
    pub connect_hard_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    pub stabilize_ms: u64,
    pub battery_verify_timeout_ms: u64,
    pub fault_reconnect_delay_ms: u64,
    pub link_loss_probe_delay_ms: u64,
    pub sync_timeout_ms: u64,
    pub sync_retry_delay_ms: u64,
    pub sync_refetch_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub stall_check_ms: u64,
    pub status_clear_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            adapter_retry_ms: 1_000,
            adapter_settle_ms: 1_000,
            scan_timeout_ms: 25_000,
            connect_settle_ms: 3_000,
            connect_soft_timeout_ms: 30_000,
            connect_hard_timeout_ms: 45_000,
            liveness_timeout_ms: 5_000,
            stabilize_ms: 1_500,
            battery_verify_timeout_ms: 8_000,
            fault_reconnect_delay_ms: 2_000,
            link_loss_probe_delay_ms: 3_000,
            sync_timeout_ms: 25_000,
            sync_retry_delay_ms: 1_000,
            sync_refetch_timeout_ms: 10_000,
            subscribe_timeout_ms: 15_000,
            stall_check_ms: 20_000,
            status_clear_ms: 5_000,
        }
    }
}

/// Saved daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingConfig {
    #[serde(default)]
    pub paired: Vec<PairedDevice>,
    #[serde(default = "default_markers")]
    pub product_markers: Vec<String>,
    /// Advertised services that mark a supported ring regardless of its name.
    #[serde(default)]
    pub product_services: Vec<Uuid>,
    #[serde(default)]
    pub platform: Platform,
    /// Adapter restore id; on BlueZ the adapter name (e.g. "hci0").
    #[serde(default)]
    pub restore_id: String,
    #[serde(default)]
    pub timings: Timings,
}

fn default_markers() -> Vec<String> {
    DEFAULT_PRODUCT_MARKERS.iter().map(|m| m.to_string()).collect()
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            paired: Vec::new(),
            product_markers: default_markers(),
            product_services: Vec::new(),
            platform: Platform::default(),
            restore_id: String::new(),
            timings: Timings::default(),
        }
    }
}

impl RingConfig {
    /// Remember a ring, replacing any entry with the same id.
    pub fn remember(&mut self, device: PairedDevice) {
        self.paired.retain(|d| d.id != device.id);
        self.paired.insert(0, device);
    }
}

/// Load config from disk. Returns None if file missing or invalid.
pub fn load(path: &str) -> Option<RingConfig> {
    let data = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<RingConfig>(&data) {
        Ok(cfg) => {
            info!("Loaded config: {} paired ring(s), platform {:?}", cfg.paired.len(), cfg.platform);
            Some(cfg)
        }
        Err(e) => {
            warn!("Failed to parse config {}: {}", path, e);
            None
        }
    }
}

/// Save config to disk. Logs on failure but does not return error.
pub fn save(path: &str, config: &RingConfig) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to write config {}: {}", path, e);
            } else {
                info!("Saved config: {} paired ring(s)", config.paired.len());
            }
        }
        Err(e) => {
            warn!("Failed to serialize config: {}", e);
        }
    }
}

/// Delete config file. Used by a full reset.
pub fn forget(path: &str) {
    if std::fs::remove_file(path).is_ok() {
        info!("Deleted config file {}", path);
    }
}
