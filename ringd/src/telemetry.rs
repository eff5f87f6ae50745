//! Telemetry snapshots and characteristic decoding.
//!
//! A snapshot is a value: a newer one supersedes an older one, it is never
//! edited in place. Absent fields mean "not refreshed this cycle", so
//! [`TelemetrySnapshot::merged_over`] keeps the previous value for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepSummary {
    pub deep_minutes: u32,
    pub light_minutes: u32,
    pub awake_minutes: u32,
    pub total_minutes: u32,
}

/// Set on partial results produced after a mid-sync reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMarker {
    Reconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<SleepSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionMarker>,
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    /// A snapshot with no refreshed fields.
    pub fn empty() -> Self {
        Self {
            heart_rate: None,
            steps: None,
            distance_km: None,
            calories: None,
            battery: None,
            sleep: None,
            connection: None,
            captured_at: Utc::now(),
        }
    }

    /// The minimal result returned when a reconnect succeeded but the
    /// refetch did not: only the last known battery level.
    pub fn reconnected(battery: Option<u8>) -> Self {
        Self {
            battery,
            connection: Some(ConnectionMarker::Reconnected),
            ..Self::empty()
        }
    }

    /// Field-by-field merge: fields defined here win, absent ones keep the
    /// value from `previous`.
    pub fn merged_over(&self, previous: Option<&TelemetrySnapshot>) -> TelemetrySnapshot {
        let Some(prev) = previous else {
            return self.clone();
        };
        TelemetrySnapshot {
            heart_rate: self.heart_rate.or(prev.heart_rate),
            steps: self.steps.or(prev.steps),
            distance_km: self.distance_km.or(prev.distance_km),
            calories: self.calories.or(prev.calories),
            battery: self.battery.or(prev.battery),
            sleep: self.sleep.or(prev.sleep),
            connection: self.connection,
            captured_at: self.captured_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heart_rate.is_none()
            && self.steps.is_none()
            && self.distance_km.is_none()
            && self.calories.is_none()
            && self.battery.is_none()
            && self.sleep.is_none()
    }
}

/// Parse a BLE Heart Rate Measurement characteristic value.
///
/// Per the Bluetooth spec, byte 0 is flags:
///   bit 0: 0 = HR is uint8 in byte 1, 1 = HR is uint16 LE in bytes 1-2
///
/// Returns the heart rate in BPM, or None if the data is too short.
pub fn parse_hr_measurement(data: &[u8]) -> Option<u16> {
    let (&flags, rest) = data.split_first()?;
    if flags & 0x01 != 0 {
        let bytes = rest.get(..2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    } else {
        rest.first().map(|&b| b as u16)
    }
}

/// Battery Level (0x2A19): a single percentage byte.
pub fn parse_battery_level(data: &[u8]) -> Option<u8> {
    data.first().map(|&b| b.min(100))
}

/// Activity counters carried by the step-count characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Activity {
    pub steps: u32,
    pub distance_km: Option<f64>,
    pub calories: Option<u32>,
}

/// Decode the step-count characteristic (0x2A56).
///
/// Layout (all little-endian): steps u32 in bytes 0-3, then optionally
/// distance in meters u32 in bytes 4-7, then calories u16 in bytes 8-9.
/// Rings with older firmware send only a 3-byte step count.
pub fn parse_activity(data: &[u8]) -> Option<Activity> {
    if data.len() < 3 {
        return None;
    }
    let mut steps_bytes = [0u8; 4];
    let n = data.len().min(4);
    steps_bytes[..n].copy_from_slice(&data[..n]);
    let steps = u32::from_le_bytes(steps_bytes);

    let distance_km = data
        .get(4..8)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / 1000.0);
    let calories = data
        .get(8..10)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as u32);

    Some(Activity { steps, distance_km, calories })
}
