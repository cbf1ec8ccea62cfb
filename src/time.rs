//! Pluggable time source for real and simulated playback.
//!
//! The playback engine is written against [`TimeSource`] so the same loop
//! drives wall-clock playback in production and virtual-time playback in
//! tests, where a twenty-second ad plays out in microseconds.

use crate::error::{Result, VastError};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Abstraction over `now()` and `sleep(d)`.
///
/// Contract: within a single playback, time never goes backward, and
/// `sleep(0)` is legal (it yields control to the scheduler).
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Current time in seconds. Real sources report monotonic wall-clock
    /// seconds since construction; virtual sources report accumulated
    /// virtual seconds.
    async fn now(&self) -> f64;

    /// Suspend the caller for `secs` seconds of this provider's clock.
    async fn sleep(&self, secs: f64);

    /// Provider mode identifier, for logging.
    fn mode(&self) -> &'static str;
}

/// Wall-clock time source backed by the tokio runtime.
pub struct RealTimeSource {
    origin: Instant,
}

impl RealTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for RealTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSource for RealTimeSource {
    async fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    async fn sleep(&self, secs: f64) {
        tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
    }

    fn mode(&self) -> &'static str {
        "real"
    }
}

struct VirtualState {
    now: f64,
    speed: f64,
}

/// Virtual time source for headless playback.
///
/// `sleep(d)` advances the internal counter by `d * speed` without any real
/// suspension beyond a scheduler yield, so simulated sessions complete as
/// fast as the CPU allows. A speed of 2.0 means each slept second counts as
/// two virtual seconds.
pub struct VirtualTimeSource {
    state: Mutex<VirtualState>,
}

impl VirtualTimeSource {
    /// Create a virtual source at `speed` times real scale, starting at 0.
    /// Speed must be positive and finite.
    pub fn new(speed: f64) -> Result<Self> {
        Self::with_start(speed, 0.0)
    }

    /// Create a virtual source with an explicit starting timestamp.
    pub fn with_start(speed: f64, start: f64) -> Result<Self> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(VastError::Config(format!(
                "virtual time speed must be positive and finite, got {speed}"
            )));
        }
        Ok(Self {
            state: Mutex::new(VirtualState { now: start, speed }),
        })
    }

    /// Advance the counter directly by `secs`.
    pub fn advance(&self, secs: f64) {
        let mut state = self.state.lock().unwrap();
        state.now += secs;
    }

    /// Jump the counter to `t`.
    pub fn set_time(&self, t: f64) {
        let mut state = self.state.lock().unwrap();
        state.now = t;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().unwrap().speed
    }
}

#[async_trait]
impl TimeSource for VirtualTimeSource {
    async fn now(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    async fn sleep(&self, secs: f64) {
        {
            let mut state = self.state.lock().unwrap();
            let advance = secs.max(0.0) * state.speed;
            state.now += advance;
        }
        // Yield so other tasks make progress between virtual ticks.
        tokio::task::yield_now().await;
    }

    fn mode(&self) -> &'static str {
        "virtual"
    }
}
