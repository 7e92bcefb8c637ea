//! Virtual time and quiescence tracking
//!
//! The simulation runs against an accelerated clock: every simulated delay
//! is divided by `speed` before the task actually sleeps, and orchestration
//! waits shrink further by `wait_acc`. On top of that the clock supports
//! fast-forwarding over idle intervals by bumping a `base_time` offset, and
//! a [`DownloadGauge`] tracks how many downloads are in flight so the
//! orchestrator knows when fast-forwarding is legal.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};

/// Everything a simulation run shares: the virtual clock and the in-flight
/// download gauge. One `SimContext` per run; two side-by-side replays each
/// own their own context, so nothing in the crate is process-global.
#[derive(Debug)]
pub struct SimContext {
    pub clock: SimClock,
    pub downloads: DownloadGauge,
}

impl SimContext {
    pub fn new(speed: f64, wait_acc: f64) -> Self {
        SimContext {
            clock: SimClock::new(speed, wait_acc),
            downloads: DownloadGauge::new(),
        }
    }
}

/// Monotonic simulated clock.
///
/// `now()` is `wall_elapsed * speed + base_time`; the scheduler variant
/// applies the extra `wait_acc` factor. `base_time` only ever grows, so both
/// readings are non-decreasing.
#[derive(Debug)]
pub struct SimClock {
    speed: f64,
    wait_acc: f64,
    start: Instant,
    base_time: Mutex<f64>,
}

impl SimClock {
    pub fn new(speed: f64, wait_acc: f64) -> Self {
        SimClock {
            speed,
            wait_acc,
            start: Instant::now(),
            base_time: Mutex::new(0.0),
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Current simulated time on the transfer basis.
    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * self.speed + self.base()
    }

    /// Current simulated time on the orchestration basis (includes the
    /// additional wait acceleration).
    pub fn now_sched(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * self.speed * self.wait_acc + self.base()
    }

    /// Sleep `delay_s` simulated seconds of transfer time.
    pub async fn sleep(&self, delay_s: f64) {
        let wall = (delay_s / self.speed).max(0.0);
        tokio::time::sleep(Duration::from_secs_f64(wall)).await;
    }

    /// Sleep `delay_s` simulated seconds of orchestration time.
    pub async fn sleep_sched(&self, delay_s: f64) {
        let wall = (delay_s / (self.speed * self.wait_acc)).max(0.0);
        tokio::time::sleep(Duration::from_secs_f64(wall)).await;
    }

    /// Jump the clock forward by `delta_s` simulated seconds.
    ///
    /// Callers must hold the quiescence condition (no download in flight);
    /// the orchestrator checks the gauge before calling.
    pub fn fast_forward(&self, delta_s: f64) {
        if delta_s <= 0.0 {
            return;
        }
        let mut base = self.base_time.lock().unwrap();
        *base += delta_s;
        debug!(delta_s, base_time = *base, "fast-forwarded virtual clock");
    }

    fn base(&self) -> f64 {
        *self.base_time.lock().unwrap()
    }
}

/// Counts downloads in flight and wakes waiters when the count hits zero.
///
/// Clients bump it from `request_media` and drop it from
/// `download_complete`; the orchestrator waits on it for idle skipping, for
/// the event-lock replay, and for the end-of-run drain.
#[derive(Debug, Default)]
pub struct DownloadGauge {
    count: Mutex<u64>,
    zero: Notify,
}

impl DownloadGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        debug!(active = *count, "download started");
    }

    /// Decrement; the transition to zero wakes everyone parked on
    /// [`DownloadGauge::notified`] / [`DownloadGauge::wait_idle`].
    pub fn dec(&self) {
        let mut count = self.count.lock().unwrap();
        match *count {
            0 => {
                warn!("download gauge decremented below zero");
            }
            1 => {
                *count = 0;
                drop(count);
                debug!("system quiescent");
                self.zero.notify_waiters();
            }
            _ => {
                *count -= 1;
                debug!(active = *count, "download finished");
            }
        }
    }

    pub fn active(&self) -> u64 {
        *self.count.lock().unwrap()
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0
    }

    /// A future that resolves on the next transition to zero. Enable it
    /// before checking [`DownloadGauge::is_idle`] to avoid a missed wakeup.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.zero.notified()
    }

    /// Block until no download is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
