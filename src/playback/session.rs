//! Playback session domain object.
//!
//! Tracks state, progress, events, quartiles and interruptions for one ad
//! playback, and round-trips through JSON for persistence. Unknown keys on
//! read are preserved so older readers survive newer writers.

use crate::error::{Result, VastError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Playback session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Closed,
    Error,
}

impl PlaybackState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlaybackState::Completed | PlaybackState::Closed | PlaybackState::Error
        )
    }
}

/// Category of a recorded playback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackEventType {
    Start,
    Pause,
    Resume,
    Quartile,
    Progress,
    Tracking,
    Interrupt,
    Error,
    Complete,
    Close,
}

/// One entry in the session's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub event_type: PlaybackEventType,
    /// Tracking-event name this entry corresponds to (`impression`,
    /// `firstQuartile`, `interrupt`, ...)
    pub name: String,
    pub offset_secs: f64,
    /// Timestamp from the driving time source (wall or virtual)
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Interruption record: why and where playback was cut short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interruption {
    pub reason: String,
    pub offset_secs: f64,
}

/// A single ad playback session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSession {
    pub session_id: String,
    pub creative_id: String,
    pub duration_secs: f64,
    pub state: PlaybackState,
    pub current_offset_secs: f64,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub events: Vec<PlaybackEvent>,
    /// Reached quartiles, 0 = start through 4 = complete
    pub quartiles_reached: BTreeSet<u8>,
    pub interruption: Option<Interruption>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Unknown document keys, preserved across round-trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlaybackSession {
    pub fn new(creative_id: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            creative_id: creative_id.into(),
            duration_secs,
            state: PlaybackState::Pending,
            current_offset_secs: 0.0,
            start_time: 0.0,
            end_time: None,
            events: Vec::new(),
            quartiles_reached: BTreeSet::new(),
            interruption: None,
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn start(&mut self, now: f64) -> Result<()> {
        if self.state != PlaybackState::Pending {
            return Err(self.bad_transition("start"));
        }
        self.state = PlaybackState::Running;
        self.start_time = now;
        info!(session_id = %self.session_id, "session started");
        Ok(())
    }

    pub fn pause(&mut self, now: f64) -> Result<()> {
        if self.state != PlaybackState::Running {
            return Err(self.bad_transition("pause"));
        }
        self.state = PlaybackState::Paused;
        self.record(
            PlaybackEventType::Pause,
            "pause",
            self.current_offset_secs,
            now,
            Map::new(),
        );
        Ok(())
    }

    pub fn resume(&mut self, now: f64) -> Result<()> {
        if self.state != PlaybackState::Paused {
            return Err(self.bad_transition("resume"));
        }
        self.state = PlaybackState::Running;
        self.record(
            PlaybackEventType::Resume,
            "resume",
            self.current_offset_secs,
            now,
            Map::new(),
        );
        Ok(())
    }

    /// Advance the playback position. Offsets only move forward; a stale
    /// value is ignored.
    pub fn advance(&mut self, offset_secs: f64) {
        if self.state != PlaybackState::Running {
            return;
        }
        if offset_secs > self.current_offset_secs {
            self.current_offset_secs = offset_secs;
        }
    }

    /// Whether quartile `n` may fire now: not yet reached, and the offset
    /// has crossed n·duration/4 (within `tolerance`).
    pub fn quartile_due(&self, n: u8, tolerance: f64) -> bool {
        if self.quartiles_reached.contains(&n) {
            return false;
        }
        let boundary = self.duration_secs * f64::from(n) / 4.0;
        self.current_offset_secs + tolerance >= boundary
    }

    /// Mark quartile `n` reached. Enforces the offset invariant.
    pub fn mark_quartile(&mut self, n: u8, now: f64, tolerance: f64) {
        let boundary = self.duration_secs * f64::from(n) / 4.0;
        if self.current_offset_secs + tolerance < boundary {
            warn!(
                session_id = %self.session_id,
                quartile = n,
                offset = self.current_offset_secs,
                "refusing to mark quartile before its boundary"
            );
            return;
        }
        if self.quartiles_reached.insert(n) {
            let name = quartile_name(n);
            let mut metadata = Map::new();
            metadata.insert("quartile".into(), Value::from(n));
            self.record(
                PlaybackEventType::Quartile,
                name,
                self.current_offset_secs,
                now,
                metadata,
            );
        }
    }

    pub fn complete(&mut self, now: f64) -> Result<()> {
        if self.state != PlaybackState::Running {
            return Err(self.bad_transition("complete"));
        }
        self.state = PlaybackState::Completed;
        self.end_time = Some(now);
        self.current_offset_secs = self.duration_secs;
        self.record(
            PlaybackEventType::Complete,
            "complete",
            self.duration_secs,
            now,
            Map::new(),
        );
        info!(session_id = %self.session_id, "session completed");
        Ok(())
    }

    pub fn close(&mut self, now: f64) -> Result<()> {
        if !matches!(self.state, PlaybackState::Running | PlaybackState::Paused) {
            return Err(self.bad_transition("close"));
        }
        self.state = PlaybackState::Closed;
        self.end_time = Some(now);
        self.record(
            PlaybackEventType::Close,
            "close",
            self.current_offset_secs,
            now,
            Map::new(),
        );
        info!(session_id = %self.session_id, "session closed");
        Ok(())
    }

    /// Record an interruption and move to the error terminal state.
    pub fn interrupt(&mut self, reason: impl Into<String>, offset_secs: f64, now: f64) {
        let reason = reason.into();
        self.interruption = Some(Interruption {
            reason: reason.clone(),
            offset_secs,
        });
        let mut metadata = Map::new();
        metadata.insert("reason".into(), Value::String(reason.clone()));
        self.record(PlaybackEventType::Interrupt, "interrupt", offset_secs, now, metadata);
        self.state = PlaybackState::Error;
        self.end_time = Some(now);
        warn!(session_id = %self.session_id, reason = %reason, offset = offset_secs, "session interrupted");
    }

    /// Record an error and move to the error terminal state.
    pub fn error(&mut self, message: impl Into<String>, now: f64) {
        let message = message.into();
        let mut metadata = Map::new();
        metadata.insert("error".into(), Value::String(message.clone()));
        self.record(
            PlaybackEventType::Error,
            "error",
            self.current_offset_secs,
            now,
            metadata,
        );
        self.state = PlaybackState::Error;
        self.end_time = Some(now);
        warn!(session_id = %self.session_id, error = %message, "session error");
    }

    pub fn record(
        &mut self,
        event_type: PlaybackEventType,
        name: impl Into<String>,
        offset_secs: f64,
        timestamp: f64,
        metadata: Map<String, Value>,
    ) {
        self.events.push(PlaybackEvent {
            event_type,
            name: name.into(),
            offset_secs,
            timestamp,
            metadata,
        });
    }

    /// Names of logged events, in order.
    pub fn event_names(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn bad_transition(&self, operation: &str) -> VastError {
        VastError::PlaybackState(format!(
            "cannot {operation} session {} in state {:?}",
            self.session_id, self.state
        ))
    }
}

pub fn quartile_name(n: u8) -> &'static str {
    match n {
        0 => "start",
        1 => "firstQuartile",
        2 => "midpoint",
        3 => "thirdQuartile",
        _ => "complete",
    }
}
