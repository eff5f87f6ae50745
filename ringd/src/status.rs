//! User-facing status line.
//!
//! Transient messages are replaced freely and some expire on their own.
//! A fatal message stays until the user acts (scan, connect, reset) and is
//! never overwritten by a transient one.

use std::time::Duration;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::state::{SharedState, StatusKind, StatusMessage};

#[derive(Clone)]
pub struct StatusBoard {
    state: SharedState,
    clear_after: Duration,
    lifetime: CancellationToken,
}

impl StatusBoard {
    pub fn new(state: SharedState, clear_after: Duration, lifetime: CancellationToken) -> Self {
        Self { state, clear_after, lifetime }
    }

    /// Show a transient message. Returns its sequence number, or None when a
    /// fatal message is showing.
    pub async fn transient(&self, text: impl Into<String>) -> Option<u64> {
        let text = text.into();
        let mut s = self.state.lock().await;
        if matches!(s.status, Some(StatusMessage { kind: StatusKind::Fatal, .. })) {
            debug!("Status '{}' suppressed by fatal status", text);
            return None;
        }
        s.status_seq += 1;
        s.status = Some(StatusMessage { text, kind: StatusKind::Transient });
        Some(s.status_seq)
    }

    /// Show a transient message that clears itself unless superseded first.
    pub async fn expiring(&self, text: impl Into<String>) {
        let Some(seq) = self.transient(text).await else {
            return;
        };
        let state = self.state.clone();
        let lifetime = self.lifetime.clone();
        let clear_after = self.clear_after;
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {}
                _ = tokio::time::sleep(clear_after) => {
                    let mut s = state.lock().await;
                    if s.status_seq == seq {
                        s.status = None;
                    }
                }
            }
        });
    }

    pub async fn fatal(&self, text: impl Into<String>) {
        let text = text.into();
        warn!("Fatal status: {}", text);
        let mut s = self.state.lock().await;
        s.status_seq += 1;
        s.status = Some(StatusMessage { text, kind: StatusKind::Fatal });
    }

    /// Clear a transient message; a fatal one stays.
    pub async fn clear(&self) {
        let mut s = self.state.lock().await;
        if matches!(s.status, Some(StatusMessage { kind: StatusKind::Transient, .. })) {
            s.status_seq += 1;
            s.status = None;
        }
    }

    /// Clear everything, including a fatal message. Called on user action.
    pub async fn acknowledge(&self) {
        let mut s = self.state.lock().await;
        s.status_seq += 1;
        s.status = None;
    }
}
