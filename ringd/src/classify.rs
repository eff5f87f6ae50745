//! Maps raw transport errors to recovery actions, and routes those actions
//! to the recovery functions supplied at construction.
//!
//! Matching is case-sensitive substring search over the error text, first
//! rule wins. The default table covers the messages BLE stacks actually
//! produce when the adapter is torn down underneath us.

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;

use crate::error::LinkError;
use crate::status::StatusBoard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Ignore,
    RetrySameOp,
    ReconnectDevice,
    RecreateAdapter,
    SurfaceFatal,
}

const DEFAULT_RULES: &[(&str, RecoveryAction)] = &[
    ("destroyed", RecoveryAction::RecreateAdapter),
    ("operation was cancelled", RecoveryAction::RecreateAdapter),
    ("Native module", RecoveryAction::RecreateAdapter),
    ("disconnected", RecoveryAction::ReconnectDevice),
    ("not connected", RecoveryAction::ReconnectDevice),
    ("timed out", RecoveryAction::RetrySameOp),
    ("permission", RecoveryAction::SurfaceFatal),
];

/// Some stacks fail a connect to an already-linked device with an error
/// instead of succeeding. Such errors are read as "alive".
const DEFAULT_LIVENESS_MARKERS: &[&str] = &["already connected"];

pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong with the ring connection";

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<(String, RecoveryAction)>,
    liveness_markers: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.iter().map(|(k, a)| (k.to_string(), *a)).collect(),
            liveness_markers: DEFAULT_LIVENESS_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl ErrorClassifier {
    /// Add a transport-specific rule that takes precedence over the defaults.
    pub fn with_rule(mut self, pattern: impl Into<String>, action: RecoveryAction) -> Self {
        self.rules.insert(0, (pattern.into(), action));
        self
    }

    /// Replace the markers that make an error count as proof of a live link.
    pub fn with_liveness_markers(mut self, markers: &[&str]) -> Self {
        self.liveness_markers = markers.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn classify(&self, raw: &str) -> RecoveryAction {
        self.rules
            .iter()
            .find(|(pattern, _)| raw.contains(pattern.as_str()))
            .map(|(_, action)| *action)
            .unwrap_or(RecoveryAction::Ignore)
    }

    pub fn classify_error(&self, err: &LinkError) -> RecoveryAction {
        self.classify(&err.to_string())
    }

    /// Whether a failed liveness probe should still be read as "alive".
    pub fn indicates_alive(&self, raw: &str) -> bool {
        self.liveness_markers.iter().any(|m| raw.contains(m.as_str()))
    }
}

/// Classification with the default table.
pub fn classify(raw: &str) -> RecoveryAction {
    ErrorClassifier::default().classify(raw)
}

/// Recovery functions the router calls into.
#[async_trait]
pub trait Recovery: Send + Sync {
    /// Recreate the adapter and reconnect the selected ring once.
    async fn recreate_adapter(&self) -> bool;
    /// Probe the selected ring and reconnect it once if it is gone.
    async fn reconnect_device(&self) -> bool;
}

pub struct FaultRouter {
    classifier: Arc<ErrorClassifier>,
    recovery: Arc<dyn Recovery>,
    status: StatusBoard,
}

impl FaultRouter {
    pub fn new(
        classifier: Arc<ErrorClassifier>,
        recovery: Arc<dyn Recovery>,
        status: StatusBoard,
    ) -> Self {
        Self { classifier, recovery, status }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Classify `err` and run the matching recovery. `RetrySameOp` is left
    /// to the caller.
    pub async fn route(&self, err: &LinkError) -> RecoveryAction {
        let action = self.classifier.classify_error(err);
        info!("Routing '{}' as {:?}", err, action);
        match action {
            RecoveryAction::RecreateAdapter => {
                self.recovery.recreate_adapter().await;
            }
            RecoveryAction::ReconnectDevice => {
                self.recovery.reconnect_device().await;
            }
            RecoveryAction::SurfaceFatal => {
                self.status.fatal(err.to_string()).await;
            }
            RecoveryAction::Ignore => {
                warn!("Unclassified error: {}", err);
                self.status.expiring(GENERIC_ERROR_MESSAGE).await;
            }
            RecoveryAction::RetrySameOp => {}
        }
        action
    }
}
