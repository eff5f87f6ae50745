//! Last-known-good telemetry, kept across daemon restarts.

use std::sync::Mutex;

use log::{info, warn};

use crate::telemetry::TelemetrySnapshot;

pub trait SnapshotStore: Send + Sync {
    fn load_latest(&self) -> Option<TelemetrySnapshot>;
    fn save_latest(&self, snapshot: &TelemetrySnapshot);
    fn forget(&self);
}

/// Snapshot persisted as a JSON file.
pub struct JsonFileStore {
    path: String,
}

impl JsonFileStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStore for JsonFileStore {
    /// Returns None if file missing or invalid.
    fn load_latest(&self) -> Option<TelemetrySnapshot> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<TelemetrySnapshot>(&data) {
            Ok(snapshot) => {
                info!("Loaded cached snapshot captured at {}", snapshot.captured_at);
                Some(snapshot)
            }
            Err(e) => {
                warn!("Failed to parse snapshot cache {}: {}", self.path, e);
                None
            }
        }
    }

    fn save_latest(&self, snapshot: &TelemetrySnapshot) {
        match serde_json::to_string_pretty(snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!("Failed to write snapshot cache {}: {}", self.path, e);
                }
            }
            Err(e) => warn!("Failed to serialize snapshot: {}", e),
        }
    }

    fn forget(&self) {
        if std::fs::remove_file(&self.path).is_ok() {
            info!("Deleted snapshot cache {}", self.path);
        }
    }
}

/// Process-local store, for `--no-cache` runs.
#[derive(Default)]
pub struct MemoryStore {
    latest: Mutex<Option<TelemetrySnapshot>>,
}

impl MemoryStore {
    pub fn with_snapshot(snapshot: TelemetrySnapshot) -> Self {
        Self { latest: Mutex::new(Some(snapshot)) }
    }
}

impl SnapshotStore for MemoryStore {
    fn load_latest(&self) -> Option<TelemetrySnapshot> {
        self.latest.lock().ok()?.clone()
    }

    fn save_latest(&self, snapshot: &TelemetrySnapshot) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(snapshot.clone());
        }
    }

    fn forget(&self) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = None;
        }
    }
}
