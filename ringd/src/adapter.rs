//! Ownership of the single BLE adapter.
//!
//! There is never more than one live adapter. Readers take a [`LiveAdapter`]
//! per operation instead of holding one, and watch the generation counter to
//! learn that the adapter underneath them was replaced.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{watch, Mutex};

use crate::error::LinkError;
use crate::transport::{BleTransport, Platform, PowerState};

/// Lease on the live adapter for the duration of one operation.
#[derive(Clone)]
pub struct LiveAdapter {
    generation: u64,
    transport: Arc<dyn BleTransport>,
}

impl LiveAdapter {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transport(&self) -> &dyn BleTransport {
        self.transport.as_ref()
    }

    /// Make sure the radio is on, asking the platform to enable it where that
    /// is possible. Returns the power state that was finally observed.
    pub async fn ensure_powered(&self, platform: Platform) -> Result<PowerState, LinkError> {
        let power = self.transport.power_state().await?;
        if power == PowerState::On {
            return Ok(power);
        }
        if !platform.can_request_enable() {
            warn!("Bluetooth is {:?} and {:?} cannot enable it", power, platform);
            return Err(LinkError::BluetoothDisabled);
        }
        info!("Bluetooth is {:?}, requesting enable", power);
        if let Err(e) = self.transport.request_enable().await {
            warn!("Enable request failed: {}", e);
            return Err(LinkError::BluetoothDisabled);
        }
        match self.transport.power_state().await? {
            PowerState::On => Ok(PowerState::On),
            _ => Err(LinkError::BluetoothDisabled),
        }
    }
}

pub struct AdapterHandle {
    transport: Arc<dyn BleTransport>,
    restore_id: String,
    retry_delay: Duration,
    settle_delay: Duration,
    /// Generation of the live adapter, None when there is none.
    live: Mutex<Option<u64>>,
    generation: watch::Sender<u64>,
    /// Mirrors `live` for observers that wait for an adapter to exist.
    published: watch::Sender<Option<u64>>,
}

impl AdapterHandle {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        restore_id: impl Into<String>,
        retry_delay: Duration,
        settle_delay: Duration,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        let (published, _) = watch::channel(None);
        Self {
            transport,
            restore_id: restore_id.into(),
            retry_delay,
            settle_delay,
            live: Mutex::new(None),
            generation,
            published,
        }
    }

    /// Notified with the new generation after every successful recreate.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Generation of the live adapter as it comes and goes; None while there is none.
    pub fn watch_live(&self) -> watch::Receiver<Option<u64>> {
        self.published.subscribe()
    }

    pub async fn is_live(&self) -> bool {
        self.live.lock().await.is_some()
    }

    /// The live adapter if there is one. Never creates.
    pub async fn current(&self) -> Option<LiveAdapter> {
        let generation = (*self.live.lock().await)?;
        Some(self.lease(generation))
    }

    /// The live adapter, created on first use. A failed creation is retried
    /// once after the retry delay.
    pub async fn acquire(&self) -> Result<LiveAdapter, LinkError> {
        let mut live = self.live.lock().await;
        if let Some(generation) = *live {
            return Ok(self.lease(generation));
        }

        self.create_with_retry().await?;

        let generation = *self.generation.borrow();
        *live = Some(generation);
        self.published.send_replace(Some(generation));
        info!("Bluetooth adapter ready (generation {})", generation);
        Ok(self.lease(generation))
    }

    /// Destroy the live adapter. Failures are logged, never returned.
    pub async fn release(&self) {
        let mut live = self.live.lock().await;
        if live.take().is_none() {
            return;
        }
        self.published.send_replace(None);
        if let Err(e) = self.transport.destroy_adapter().await {
            warn!("Ignoring adapter destroy failure: {}", e);
        } else {
            info!("Bluetooth adapter destroyed");
        }
    }

    /// Destroy and recreate the adapter, then tell observers about the new one.
    pub async fn recreate(&self) -> Result<LiveAdapter, LinkError> {
        info!("Recreating Bluetooth adapter");
        {
            // The transport may still hold an adapter we never acquired.
            let mut live = self.live.lock().await;
            *live = None;
            self.published.send_replace(None);
            if let Err(e) = self.transport.destroy_adapter().await {
                warn!("Ignoring adapter destroy failure: {}", e);
            }
        }
        tokio::time::sleep(self.settle_delay).await;

        let mut live = self.live.lock().await;
        self.create_with_retry().await?;

        let generation = *self.generation.borrow() + 1;
        *live = Some(generation);
        self.generation.send_replace(generation);
        self.published.send_replace(Some(generation));
        info!("Bluetooth adapter recreated (generation {})", generation);
        Ok(self.lease(generation))
    }

    async fn create_with_retry(&self) -> Result<(), LinkError> {
        let Err(first) = self.transport.create_adapter(&self.restore_id).await else {
            return Ok(());
        };
        warn!("Adapter creation failed ({}), retrying in {:?}", first, self.retry_delay);
        tokio::time::sleep(self.retry_delay).await;
        self.transport
            .create_adapter(&self.restore_id)
            .await
            .map_err(|e| {
                warn!("Adapter creation failed again: {}", e);
                LinkError::AdapterUnavailable(e.message)
            })
    }

    fn lease(&self, generation: u64) -> LiveAdapter {
        LiveAdapter { generation, transport: self.transport.clone() }
    }
}
