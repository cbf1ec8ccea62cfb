//! Cooperative playback loop.
//!
//! A single task repeatedly sleeps for a tick, recomputes the offset from
//! the time source, and fires whatever became due: quartiles, progress
//! offsets, completion. Pause, resume and stop arrive through a cloneable
//! [`PlaybackControl`] handle and take effect at the next tick.
//!
//! In virtual mode, provider-specific interruption rules can cut a session
//! short with a deterministic RNG seeded from the session id, so failure
//! schedules replay exactly in tests.

use crate::config::{PlaybackConfig, PlaybackMode};
use crate::metrics;
use crate::playback::session::{
    quartile_name, PlaybackEventType, PlaybackSession, PlaybackState,
};
use crate::time::TimeSource;
use crate::track::tracker::Tracker;
use crate::vast::model::ParsedAd;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Map;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cloneable handle for pausing, resuming and stopping a running engine.
/// Flags are consulted at the next tick; tick granularity bounds latency.
#[derive(Clone, Default)]
pub struct PlaybackControl {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl PlaybackControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Drives one playback session against a tracker and a time source.
///
/// The engine owns its session; tracker and time source are borrowed for the
/// duration of the run. Not shareable across tasks.
pub struct PlaybackEngine<'a> {
    tracker: &'a mut Tracker,
    time: Arc<dyn TimeSource>,
    config: PlaybackConfig,
    session: PlaybackSession,
    control: PlaybackControl,
    rng: StdRng,
}

impl<'a> PlaybackEngine<'a> {
    pub fn new(
        tracker: &'a mut Tracker,
        time: Arc<dyn TimeSource>,
        config: PlaybackConfig,
        ad: &ParsedAd,
    ) -> Self {
        let session = PlaybackSession::new(ad.creative_id.clone(), f64::from(ad.duration_secs));
        Self::with_session(tracker, time, config, session)
    }

    pub fn with_session(
        tracker: &'a mut Tracker,
        time: Arc<dyn TimeSource>,
        config: PlaybackConfig,
        session: PlaybackSession,
    ) -> Self {
        // Deterministic interruption schedule per session id
        let mut hasher = DefaultHasher::new();
        session.session_id.hash(&mut hasher);
        let rng = StdRng::seed_from_u64(hasher.finish());
        Self {
            tracker,
            time,
            config,
            session,
            control: PlaybackControl::default(),
            rng,
        }
    }

    pub fn control(&self) -> PlaybackControl {
        self.control.clone()
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    fn is_virtual(&self) -> bool {
        match self.config.mode {
            PlaybackMode::Real => false,
            PlaybackMode::Headless => true,
            PlaybackMode::Auto => self.time.mode() == "virtual",
        }
    }

    fn tick_secs(&self) -> f64 {
        if self.is_virtual() {
            self.config.headless_tick_interval_secs
        } else {
            self.config.tick_interval_secs
        }
    }

    /// Run the playback loop to a terminal state and return the session.
    pub async fn run(mut self) -> PlaybackSession {
        let started_at = self.time.now().await;
        if let Err(e) = self.session.start(started_at) {
            warn!(error = %e, "session could not start");
            return self.session;
        }
        metrics::playback_started();
        info!(
            session_id = %self.session.session_id,
            duration = self.session.duration_secs,
            mode = self.time.mode(),
            "playback started"
        );

        // First entry to running: impression, start, creativeView
        self.fire_tracking("impression", PlaybackEventType::Tracking, 0.0, started_at)
            .await;
        self.session.mark_quartile(0, started_at, 0.0);
        self.fire_url("start", 0.0).await;
        self.fire_tracking("creativeView", PlaybackEventType::Tracking, 0.0, started_at)
            .await;

        if self.session.duration_secs <= 0.0 {
            let now = self.time.now().await;
            self.session.error("zero-duration creative", now);
            metrics::playback_ended();
            return self.session;
        }

        let tick = self.tick_secs();
        let duration = self.session.duration_secs;
        let tolerance = self.config.quartile_tolerance_secs;
        let virtual_mode = self.is_virtual();
        let progress_offsets: Vec<i64> = self.tracker.progress_offsets();
        let mut fired_progress: HashSet<i64> = HashSet::new();
        let mut anchor = started_at;
        let mut frozen_offset = 0.0f64;
        let mut start_rule_checked = false;

        loop {
            // Control flags first; granularity is one tick
            if self.control.is_stopped() {
                let now = self.time.now().await;
                self.fire_url("close", frozen_offset).await;
                if let Err(e) = self.session.close(now) {
                    warn!(error = %e, "close after terminal state ignored");
                }
                break;
            }

            match (self.control.is_paused(), self.session.state) {
                (true, PlaybackState::Running) => {
                    let now = self.time.now().await;
                    frozen_offset = self.session.current_offset_secs;
                    self.fire_url("pause", frozen_offset).await;
                    let _ = self.session.pause(now);
                }
                (false, PlaybackState::Paused) => {
                    let now = self.time.now().await;
                    // Re-anchor so now − anchor equals the frozen offset
                    anchor = now - frozen_offset;
                    self.fire_url("resume", frozen_offset).await;
                    let _ = self.session.resume(now);
                }
                _ => {}
            }

            if self.session.state == PlaybackState::Paused {
                self.time.sleep(tick).await;
                continue;
            }

            let now = self.time.now().await;
            let offset = now - anchor;
            self.session.advance(offset);
            frozen_offset = self.session.current_offset_secs;

            if let Some(max) = self.config.max_session_duration_secs {
                if now - started_at > max {
                    self.session
                        .error(format!("session exceeded {max}s cap"), now);
                    break;
                }
            }

            // Stochastic start interruption fires on the first real tick,
            // after the initial events have gone out
            if virtual_mode && !start_rule_checked {
                start_rule_checked = true;
                if let Some(offset_hit) = self.draw_interruption("start", 0.0) {
                    self.interrupt_at(offset_hit, now).await;
                    break;
                }
            }

            // Quartiles 1..3
            let mut interrupted = false;
            for n in 1..=3u8 {
                if !self.session.quartile_due(n, tolerance) {
                    continue;
                }
                let name = quartile_name(n);
                let boundary = duration * f64::from(n) / 4.0;
                if virtual_mode {
                    if let Some(offset_hit) = self.draw_interruption(name, boundary) {
                        self.interrupt_at(offset_hit, now).await;
                        interrupted = true;
                        break;
                    }
                }
                self.session.mark_quartile(n, now, tolerance);
                self.fire_url(name, offset).await;
            }
            if interrupted {
                break;
            }

            // progress-N events; negative offsets count back from the end
            for &progress in &progress_offsets {
                if fired_progress.contains(&progress) {
                    continue;
                }
                let due_at = if progress >= 0 {
                    progress as f64
                } else {
                    duration + progress as f64
                };
                if offset >= due_at {
                    fired_progress.insert(progress);
                    self.fire_tracking(
                        &format!("progress-{progress}"),
                        PlaybackEventType::Progress,
                        offset,
                        now,
                    )
                    .await;
                }
            }

            if offset >= duration {
                if virtual_mode {
                    if let Some(offset_hit) = self.draw_interruption("complete", duration) {
                        self.interrupt_at(offset_hit, now).await;
                        break;
                    }
                }
                self.session.quartiles_reached.insert(4);
                self.tracker.set_playhead(duration);
                if self.tracker.has_event("complete") {
                    let _ = self.tracker.track("complete", None).await;
                }
                if let Err(e) = self.session.complete(now) {
                    warn!(error = %e, "complete transition failed");
                }
                break;
            }

            self.time.sleep(tick).await;
        }

        metrics::playback_ended();
        info!(
            session_id = %self.session.session_id,
            state = ?self.session.state,
            events = self.session.events.len(),
            "playback finished"
        );
        self.session
    }

    /// Fire a tracking event and log it in the session.
    async fn fire_tracking(
        &mut self,
        name: &str,
        event_type: PlaybackEventType,
        offset: f64,
        now: f64,
    ) {
        self.tracker.set_playhead(offset);
        if self.tracker.has_event(name) {
            let result = self.tracker.track(name, None).await;
            debug!(
                event = name,
                successful = result.successful,
                total = result.total,
                "playback tracking fired"
            );
        }
        self.session
            .record(event_type, name, offset, now, Map::new());
    }

    /// Fire a tracking URL whose session log entry is written elsewhere
    /// (quartiles by `mark_quartile`, pause/resume/close by the session
    /// transition methods).
    async fn fire_url(&mut self, name: &str, offset: f64) {
        self.tracker.set_playhead(offset);
        if self.tracker.has_event(name) {
            let _ = self.tracker.track(name, None).await;
        }
    }

    /// Consult the interruption rule for `event`; returns the sampled
    /// interruption offset when the draw hits.
    fn draw_interruption(&mut self, event: &str, boundary: f64) -> Option<f64> {
        let rule = self.config.interruption_rules.get(event)?;
        if rule.probability <= 0.0 {
            return None;
        }
        if self.rng.gen::<f64>() >= rule.probability {
            return None;
        }
        let (lo, hi) = rule.jitter;
        let jitter = if hi > lo { self.rng.gen_range(lo..=hi) } else { lo };
        Some(boundary + jitter)
    }

    async fn interrupt_at(&mut self, offset: f64, now: f64) {
        let duration = self.session.duration_secs;
        // Position-derived reason, early failures look like network faults
        let reason = if offset < 0.25 * duration {
            "network_error"
        } else if offset < 0.75 * duration {
            "timeout"
        } else {
            "device_error"
        };
        self.session.interrupt(reason, offset, now);
    }
}
