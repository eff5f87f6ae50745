//! Real-time heart rate from the ring's Heart Rate Measurement notifications.
//!
//! Samples pass a validity gate before anyone sees them. A subscription that
//! goes quiet is restarted by a stall supervisor, and when no ring can be
//! reached the monitor switches to a synthetic generator so consumers keep
//! receiving plausible, clearly flagged values.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterHandle;
use crate::classify::FaultRouter;
use crate::config::Timings;
use crate::error::{LinkError, Stage};
use crate::state::SharedState;
use crate::telemetry::parse_hr_measurement;
use crate::transport::{NotificationStream, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

pub const MIN_VALID_BPM: u16 = 40;
pub const MAX_VALID_BPM: u16 = 200;
/// Every Nth repeat of an unchanged value is still forwarded.
const REPEAT_FORWARD_EVERY: u32 = 5;
/// Resubscribe attempts after subscription errors before falling back to synthetic.
const MAX_RESUBSCRIBES: u32 = 3;

const SYNTHETIC_MIN_BPM: u16 = 65;
const SYNTHETIC_MAX_BPM: u16 = 95;
const SYNTHETIC_MAX_STEP: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeartRateSample {
    pub bpm: u16,
    pub simulated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward(u16),
    /// Valid repeat of the last value, not forwarded this time.
    Held,
    Rejected,
}

/// Validity and repeat filter for raw heart-rate readings.
#[derive(Debug, Default)]
pub struct SampleGate {
    last: Option<u16>,
    repeats: u32,
    accepted: u64,
}

impl SampleGate {
    pub fn offer(&mut self, bpm: u16) -> Verdict {
        if bpm == 0 {
            return Verdict::Rejected;
        }
        if !(MIN_VALID_BPM..=MAX_VALID_BPM).contains(&bpm) {
            warn!("Dropping out-of-range heart rate: {} BPM", bpm);
            return Verdict::Rejected;
        }
        self.accepted += 1;

        if self.last == Some(bpm) {
            self.repeats += 1;
            if self.repeats % REPEAT_FORWARD_EVERY == 0 {
                return Verdict::Forward(bpm);
            }
            return Verdict::Held;
        }
        self.last = Some(bpm);
        self.repeats = 0;
        Verdict::Forward(bpm)
    }

    /// Valid samples seen so far, forwarded or not.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

/// Random walk inside a resting heart-rate band.
pub struct SyntheticHeartRate {
    rng: StdRng,
    current: u16,
}

impl SyntheticHeartRate {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        let current = rng.gen_range(SYNTHETIC_MIN_BPM..=SYNTHETIC_MAX_BPM);
        Self { rng, current }
    }

    pub fn next_bpm(&mut self) -> u16 {
        let step = self.rng.gen_range(-SYNTHETIC_MAX_STEP..=SYNTHETIC_MAX_STEP);
        let next = (self.current as i32 + step)
            .clamp(SYNTHETIC_MIN_BPM as i32, SYNTHETIC_MAX_BPM as i32);
        self.current = next as u16;
        self.current
    }

    /// Time until the next sample: 2 to 3 seconds.
    pub fn next_delay(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(2_000..=3_000))
    }
}

impl Default for SyntheticHeartRate {
    fn default() -> Self {
        Self::new()
    }
}

/// Running monitor. Stops when `stop` is called or when dropped.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping heart rate monitor");
            self.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and wait for the monitor task to finish its cleanup.
    pub async fn join(mut self) {
        self.stop();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!("Heart rate monitor task failed: {:?}", e);
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct RealtimeMonitor {
    adapter: Arc<AdapterHandle>,
    state: SharedState,
    router: Arc<FaultRouter>,
    timings: Timings,
    lifetime: CancellationToken,
}

enum PumpEnd {
    Stalled,
    Ended,
    Failed(LinkError),
}

impl RealtimeMonitor {
    pub fn new(
        adapter: Arc<AdapterHandle>,
        state: SharedState,
        router: Arc<FaultRouter>,
        timings: Timings,
        lifetime: CancellationToken,
    ) -> Self {
        Self { adapter, state, router, timings, lifetime }
    }

    pub fn start<F>(&self, on_sample: F) -> MonitorHandle
    where
        F: Fn(HeartRateSample) + Send + Sync + 'static,
    {
        let cancel = self.lifetime.child_token();
        let session = Session {
            adapter: self.adapter.clone(),
            state: self.state.clone(),
            router: self.router.clone(),
            timings: self.timings.clone(),
            on_sample: Box::new(on_sample),
        };
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Heart rate monitor cancelled"),
                _ = session.run() => {}
            }
            session.state.lock().await.measuring = false;
        });
        info!("Heart rate monitor started");
        MonitorHandle { cancel, task: Some(task) }
    }
}

struct Session {
    adapter: Arc<AdapterHandle>,
    state: SharedState,
    router: Arc<FaultRouter>,
    timings: Timings,
    on_sample: Box<dyn Fn(HeartRateSample) + Send + Sync>,
}

impl Session {
    async fn run(&self) {
        {
            let mut s = self.state.lock().await;
            s.measuring = true;
            s.heart_rate_simulated = false;
        }

        let mut gate = SampleGate::default();
        let mut failures = 0u32;
        loop {
            let Some(id) = self.state.lock().await.linked_target() else {
                info!("No ring connected, simulating heart rate");
                return self.simulate().await;
            };

            let limit = Duration::from_millis(self.timings.subscribe_timeout_ms);
            let stream = match timeout(limit, self.subscribe(&id)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("Heart rate subscription on {} failed: {}", id, e);
                    self.router.route(&e).await;
                    failures += 1;
                    if failures >= MAX_RESUBSCRIBES {
                        return self.simulate().await;
                    }
                    continue;
                }
                Err(_) => {
                    warn!("{}, simulating heart rate", LinkError::Timeout(Stage::Subscribe));
                    return self.simulate().await;
                }
            };
            info!("Subscribed to heart rate on {}", id);

            match self.pump(stream, &mut gate).await {
                PumpEnd::Stalled => {
                    info!("No heart rate from {} for a full window, resubscribing", id);
                }
                PumpEnd::Ended => {
                    info!("Heart rate stream from {} ended", id);
                    failures += 1;
                }
                PumpEnd::Failed(e) => {
                    warn!("Heart rate stream from {} failed: {}", id, e);
                    self.router.route(&e).await;
                    failures += 1;
                }
            }
            if failures >= MAX_RESUBSCRIBES {
                return self.simulate().await;
            }
        }
    }

    async fn subscribe(&self, id: &str) -> Result<NotificationStream, LinkError> {
        let live = self.adapter.acquire().await?;
        let stream = live
            .transport()
            .subscribe_notify(id, HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT)
            .await?;
        Ok(stream)
    }

    /// Forward samples until the stream ends, fails or stalls for a window.
    async fn pump(&self, mut stream: NotificationStream, gate: &mut SampleGate) -> PumpEnd {
        let window = Duration::from_millis(self.timings.stall_check_ms);
        let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
        let mut seen = gate.accepted();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if gate.accepted() == seen {
                        return PumpEnd::Stalled;
                    }
                    seen = gate.accepted();
                }
                item = stream.next() => match item {
                    None => return PumpEnd::Ended,
                    Some(Err(e)) => return PumpEnd::Failed(e.into()),
                    Some(Ok(data)) => {
                        let Some(bpm) = parse_hr_measurement(&data) else {
                            debug!("Ignoring short heart rate payload {:02x?}", data);
                            continue;
                        };
                        if let Verdict::Forward(bpm) = gate.offer(bpm) {
                            self.emit(HeartRateSample { bpm, simulated: false }).await;
                        }
                    }
                }
            }
        }
    }

    async fn simulate(&self) {
        let mut generator = SyntheticHeartRate::new();
        loop {
            let bpm = generator.next_bpm();
            self.emit(HeartRateSample { bpm, simulated: true }).await;
            tokio::time::sleep(generator.next_delay()).await;
        }
    }

    async fn emit(&self, sample: HeartRateSample) {
        debug!("Heart rate: {} BPM{}", sample.bpm, if sample.simulated { " (simulated)" } else { "" });
        {
            let mut s = self.state.lock().await;
            s.heart_rate = Some(sample.bpm);
            s.heart_rate_simulated = sample.simulated;
            s.measuring = false;
        }
        (self.on_sample)(sample);
    }
}
