//! Scripted in-process BLE transport for lifecycle tests.
//!
//! Behaviors are queued per operation: a queued behavior is used once, then
//! the operation falls back to its default. Streams are backed by unbounded
//! channels so tests can push advertisements, notifications and power
//! changes at will.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use ringd::cache::{MemoryStore, SnapshotStore};
use ringd::config::RingConfig;
use ringd::transport::{
    Advertisement, BleTransport, ConnectOptions, NotificationStream, PermissionGate, PowerState,
    TransportError, TransportResult, BATTERY_LEVEL,
};
use ringd::RingManager;

pub const RING: &str = "AA:BB:CC:DD:EE:01";
pub const OTHER_RING: &str = "AA:BB:CC:DD:EE:02";

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    Hang,
    Delay(Duration),
}

#[derive(Debug, Clone)]
pub enum Read {
    Value(Vec<u8>),
    Fail(String),
    Hang,
    Delayed(Duration, Vec<u8>),
}

#[derive(Default)]
pub struct Calls {
    pub create: AtomicUsize,
    pub destroy: AtomicUsize,
    pub connect: AtomicUsize,
    pub disconnect: AtomicUsize,
    pub is_connected: AtomicUsize,
    pub start_scan: AtomicUsize,
    pub stop_scan: AtomicUsize,
    pub subscribe: AtomicUsize,
    pub enable: AtomicUsize,
    reads: Mutex<HashMap<Uuid, usize>>,
}

impl Calls {
    pub fn reads_of(&self, characteristic: Uuid) -> usize {
        self.reads.lock().unwrap().get(&characteristic).copied().unwrap_or(0)
    }
}

struct Script {
    power: PowerState,
    enable_turns_on: bool,
    create_failures: usize,
    connected: HashSet<String>,
    connect: VecDeque<Behavior>,
    connect_default: Behavior,
    disconnect_error: Option<String>,
    is_connected_error: Option<String>,
    is_connected_hangs: bool,
    scan_start_delay: Option<Duration>,
    discover: Behavior,
    reads: HashMap<Uuid, VecDeque<Read>>,
    read_defaults: HashMap<Uuid, Read>,
    subscribe: VecDeque<Behavior>,
    subscribe_default: Behavior,
    scan_tx: Option<mpsc::UnboundedSender<Advertisement>>,
    notify_tx: Option<mpsc::UnboundedSender<TransportResult<Vec<u8>>>>,
    power_tx: Vec<mpsc::UnboundedSender<PowerState>>,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub struct FakeTransport {
    script: Mutex<Script>,
    pub calls: Calls,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let mut read_defaults = HashMap::new();
        read_defaults.insert(BATTERY_LEVEL, Read::Value(vec![87]));
        Arc::new(Self {
            script: Mutex::new(Script {
                power: PowerState::On,
                enable_turns_on: true,
                create_failures: 0,
                connected: HashSet::new(),
                connect: VecDeque::new(),
                connect_default: Behavior::Succeed,
                disconnect_error: None,
                is_connected_error: None,
                is_connected_hangs: false,
                scan_start_delay: None,
                discover: Behavior::Succeed,
                reads: HashMap::new(),
                read_defaults,
                subscribe: VecDeque::new(),
                subscribe_default: Behavior::Succeed,
                scan_tx: None,
                notify_tx: None,
                power_tx: Vec::new(),
            }),
            calls: Calls::default(),
        })
    }

    pub fn set_power(&self, power: PowerState) {
        self.script.lock().unwrap().power = power;
    }

    pub fn set_enable_turns_on(&self, on: bool) {
        self.script.lock().unwrap().enable_turns_on = on;
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.script.lock().unwrap().create_failures = n;
    }

    pub fn queue_connect(&self, behavior: Behavior) {
        self.script.lock().unwrap().connect.push_back(behavior);
    }

    pub fn set_connect_default(&self, behavior: Behavior) {
        self.script.lock().unwrap().connect_default = behavior;
    }

    pub fn set_disconnect_error(&self, message: &str) {
        self.script.lock().unwrap().disconnect_error = Some(message.to_string());
    }

    pub fn set_is_connected_error(&self, message: &str) {
        self.script.lock().unwrap().is_connected_error = Some(message.to_string());
    }

    pub fn set_is_connected_hang(&self) {
        self.script.lock().unwrap().is_connected_hangs = true;
    }

    pub fn set_scan_start_delay(&self, delay: Duration) {
        self.script.lock().unwrap().scan_start_delay = Some(delay);
    }

    pub fn set_discover(&self, behavior: Behavior) {
        self.script.lock().unwrap().discover = behavior;
    }

    pub fn queue_read(&self, characteristic: Uuid, read: Read) {
        self.script
            .lock()
            .unwrap()
            .reads
            .entry(characteristic)
            .or_default()
            .push_back(read);
    }

    pub fn set_read_default(&self, characteristic: Uuid, read: Read) {
        self.script.lock().unwrap().read_defaults.insert(characteristic, read);
    }

    pub fn queue_subscribe(&self, behavior: Behavior) {
        self.script.lock().unwrap().subscribe.push_back(behavior);
    }

    pub fn set_subscribe_default(&self, behavior: Behavior) {
        self.script.lock().unwrap().subscribe_default = behavior;
    }

    /// The ring goes out of range without telling anyone.
    pub fn drop_link(&self, id: &str) {
        self.script.lock().unwrap().connected.remove(id);
    }

    pub fn is_linked(&self, id: &str) -> bool {
        self.script.lock().unwrap().connected.contains(id)
    }

    pub fn advertise(&self, id: &str, name: Option<&str>, rssi: i16) {
        let adv = Advertisement {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi,
            services: Vec::new(),
        };
        if let Some(tx) = &self.script.lock().unwrap().scan_tx {
            let _ = tx.unbounded_send(adv);
        }
    }

    /// Push a Heart Rate Measurement notification with a uint8 value.
    pub fn push_heart_rate(&self, bpm: u8) {
        if let Some(tx) = &self.script.lock().unwrap().notify_tx {
            let _ = tx.unbounded_send(Ok(vec![0x00, bpm]));
        }
    }

    pub fn push_notify_error(&self, message: &str) {
        if let Some(tx) = &self.script.lock().unwrap().notify_tx {
            let _ = tx.unbounded_send(Err(TransportError::new(message)));
        }
    }

    pub fn emit_power(&self, power: PowerState) {
        let mut script = self.script.lock().unwrap();
        script.power = power;
        script.power_tx.retain(|tx| tx.unbounded_send(power).is_ok());
    }

    fn next_connect(&self) -> Behavior {
        let mut script = self.script.lock().unwrap();
        script.connect.pop_front().unwrap_or_else(|| script.connect_default.clone())
    }

    fn next_read(&self, characteristic: Uuid) -> Option<Read> {
        let mut script = self.script.lock().unwrap();
        let queued = script.reads.get_mut(&characteristic).and_then(|q| q.pop_front());
        queued.or_else(|| script.read_defaults.get(&characteristic).cloned())
    }

    fn next_subscribe(&self) -> Behavior {
        let mut script = self.script.lock().unwrap();
        script.subscribe.pop_front().unwrap_or_else(|| script.subscribe_default.clone())
    }
}

async fn play(behavior: Behavior) -> TransportResult<()> {
    match behavior {
        Behavior::Succeed => Ok(()),
        Behavior::Fail(message) => Err(TransportError::new(message)),
        Behavior::Hang => futures::future::pending().await,
        Behavior::Delay(d) => {
            tokio::time::sleep(d).await;
            Ok(())
        }
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn power_state(&self) -> TransportResult<PowerState> {
        Ok(self.script.lock().unwrap().power)
    }

    async fn request_enable(&self) -> TransportResult<()> {
        self.calls.enable.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.enable_turns_on {
            script.power = PowerState::On;
        }
        Ok(())
    }

    async fn power_events(&self) -> TransportResult<BoxStream<'static, PowerState>> {
        let (tx, rx) = mpsc::unbounded();
        self.script.lock().unwrap().power_tx.push(tx);
        Ok(rx.boxed())
    }

    async fn start_scan(&self) -> TransportResult<BoxStream<'static, Advertisement>> {
        self.calls.start_scan.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.lock().unwrap().scan_start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (tx, rx) = mpsc::unbounded();
        self.script.lock().unwrap().scan_tx = Some(tx);
        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.calls.stop_scan.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().scan_tx = None;
        Ok(())
    }

    async fn connect(&self, id: &str, _opts: &ConnectOptions) -> TransportResult<()> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        play(self.next_connect()).await?;
        self.script.lock().unwrap().connected.insert(id.to_string());
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> TransportResult<()> {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.connected.remove(id);
        match &script.disconnect_error {
            Some(message) => Err(TransportError::new(message.clone())),
            None => Ok(()),
        }
    }

    async fn is_connected(&self, id: &str) -> TransportResult<bool> {
        self.calls.is_connected.fetch_add(1, Ordering::SeqCst);
        if self.script.lock().unwrap().is_connected_hangs {
            futures::future::pending::<()>().await;
        }
        let script = self.script.lock().unwrap();
        match &script.is_connected_error {
            Some(message) => Err(TransportError::new(message.clone())),
            None => Ok(script.connected.contains(id)),
        }
    }

    async fn discover_services(&self, _id: &str) -> TransportResult<()> {
        let behavior = self.script.lock().unwrap().discover.clone();
        play(behavior).await
    }

    async fn read_characteristic(
        &self,
        _id: &str,
        _service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Vec<u8>> {
        *self.calls.reads.lock().unwrap().entry(characteristic).or_default() += 1;
        match self.next_read(characteristic) {
            Some(Read::Value(data)) => Ok(data),
            Some(Read::Fail(message)) => Err(TransportError::new(message)),
            Some(Read::Hang) => futures::future::pending().await,
            Some(Read::Delayed(d, data)) => {
                tokio::time::sleep(d).await;
                Ok(data)
            }
            None => Err(TransportError::new("characteristic not found")),
        }
    }

    async fn subscribe_notify(
        &self,
        _id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> TransportResult<NotificationStream> {
        self.calls.subscribe.fetch_add(1, Ordering::SeqCst);
        play(self.next_subscribe()).await?;
        let (tx, rx) = mpsc::unbounded();
        self.script.lock().unwrap().notify_tx = Some(tx);
        Ok(rx.boxed())
    }

    async fn destroy_adapter(&self) -> TransportResult<()> {
        self.calls.destroy.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.scan_tx = None;
        script.notify_tx = None;
        script.power_tx.clear();
        Ok(())
    }

    async fn create_adapter(&self, _restore_id: &str) -> TransportResult<()> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.create_failures > 0 {
            script.create_failures -= 1;
            return Err(TransportError::new("Native module cannot be null"));
        }
        Ok(())
    }
}

pub struct DenyPermissions;

#[async_trait]
impl PermissionGate for DenyPermissions {
    async fn request_ble_permissions(&self) -> bool {
        false
    }
}

/// A permission prompt the user never answers.
pub struct UnansweredPermissions;

#[async_trait]
impl PermissionGate for UnansweredPermissions {
    async fn request_ble_permissions(&self) -> bool {
        futures::future::pending().await
    }
}

pub fn manager(fake: &Arc<FakeTransport>) -> Arc<RingManager> {
    Arc::new(RingManager::builder(fake.clone()).build())
}

pub fn manager_with(
    fake: &Arc<FakeTransport>,
    config: RingConfig,
    store: Arc<dyn SnapshotStore>,
) -> Arc<RingManager> {
    Arc::new(RingManager::builder(fake.clone()).config(config).store(store).build())
}

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::default())
}

/// Let spawned tasks run without moving the clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
