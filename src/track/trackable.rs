//! A single tracking URL with its send state.

use crate::config::TrackerConfig;
use crate::error::ErrorKind;
use crate::macros::{expand, fingerprint, MacroMap};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

/// Mutable send state of one trackable. Mutated only by send attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackableState {
    /// Once true, further sends are no-ops — this transitions at most once.
    pub tracked: bool,
    pub failed: Option<ErrorKind>,
    pub failure_message: Option<String>,
    pub attempts: u32,
    pub last_status: Option<u16>,
    /// Seconds taken by the last completed request
    pub last_response_time: Option<f64>,
}

/// Anything that can fire a tracking request.
///
/// The caller must not fire the same trackable from two tasks at once;
/// `&mut self` makes that a compile-time property here.
#[async_trait]
pub trait Trackable: Send {
    async fn send_with(
        &mut self,
        client: &Client,
        macros: &MacroMap,
        config: &TrackerConfig,
    ) -> bool;
}

/// One tracking URL template plus state and a macro-expansion cache.
#[derive(Debug, Clone, Default)]
pub struct TrackableEvent {
    /// Stable key, e.g. `impression_0`, `firstquartile_1`
    pub key: String,
    /// URL template with unexpanded macros
    pub url: String,
    /// Caller-attached context, merged into macros at send time
    pub extras: MacroMap,
    pub state: TrackableState,
    /// (macro fingerprint, expanded URL) of the last expansion, so retries
    /// skip re-substitution
    expansion: Option<(u64, String)>,
}

impl TrackableEvent {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Expand the URL template against `macros`, reusing the cached result
    /// when the macro map has not changed.
    pub fn resolved_url(&mut self, macros: &MacroMap, config: &TrackerConfig) -> String {
        let effective = if self.extras.is_empty() {
            macros.clone()
        } else {
            // extras are lower precedence than per-call macros
            let mut merged = self.extras.clone();
            for (k, v) in macros {
                merged.insert(k.clone(), v.clone());
            }
            merged
        };
        let fp = fingerprint(&effective);
        if let Some((cached_fp, cached)) = &self.expansion {
            if *cached_fp == fp {
                return cached.clone();
            }
        }
        let resolved = expand(&self.url, &effective, &config.macro_formats);
        self.expansion = Some((fp, resolved.clone()));
        resolved
    }
}

#[async_trait]
impl Trackable for TrackableEvent {
    async fn send_with(
        &mut self,
        client: &Client,
        macros: &MacroMap,
        config: &TrackerConfig,
    ) -> bool {
        if self.state.tracked {
            debug!(key = %self.key, "already tracked, skipping send");
            return true;
        }
        if self.url.is_empty() {
            self.state.failed = Some(ErrorKind::EmptyUrl);
            self.state.failure_message = Some("tracking URL template is empty".into());
            return false;
        }

        let url = self.resolved_url(macros, config);
        let timeout = std::time::Duration::from_secs_f64(config.timeout_secs);

        let mut last_kind = ErrorKind::Transport;
        let mut last_message = String::new();

        for attempt in 0..=config.max_retries {
            self.state.attempts += 1;
            let started = Instant::now();

            match client.get(&url).timeout(timeout).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    self.state.last_status = Some(status.as_u16());
                    self.state.last_response_time = Some(started.elapsed().as_secs_f64());
                    if status.is_success() {
                        self.state.tracked = true;
                        self.state.failed = None;
                        self.state.failure_message = None;
                        debug!(key = %self.key, status = status.as_u16(), "tracking sent");
                        return true;
                    }
                    last_kind = ErrorKind::HttpStatus;
                    last_message = format!("HTTP {status}");
                }
                Err(e) => {
                    self.state.last_response_time = Some(started.elapsed().as_secs_f64());
                    if e.is_timeout() {
                        last_kind = ErrorKind::TimeoutPerSource;
                        last_message = format!("tracking request timed out after {timeout:?}");
                    } else {
                        last_kind = ErrorKind::Transport;
                        last_message = e.to_string();
                    }
                }
            }

            if attempt < config.max_retries {
                tokio::time::sleep(config.retry_backoff(attempt)).await;
            }
        }

        self.state.failed = Some(last_kind);
        self.state.failure_message = Some(last_message.clone());
        warn!(key = %self.key, kind = %last_kind, error = %last_message, "tracking failed");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn macros(value: serde_json::Value) -> MacroMap {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn empty_url_marks_failed_without_network() {
        let mut trackable = TrackableEvent::new("impression_0", "");
        let client = Client::new();
        let ok = trackable
            .send_with(&client, &MacroMap::new(), &TrackerConfig::default())
            .await;
        assert!(!ok);
        assert_eq!(trackable.state.failed, Some(ErrorKind::EmptyUrl));
        assert_eq!(trackable.state.attempts, 0);
        assert!(!trackable.state.tracked);
    }

    #[tokio::test]
    async fn tracked_state_short_circuits() {
        let mut trackable =
            TrackableEvent::new("impression_0", "http://127.0.0.1:1/unreachable");
        trackable.state.tracked = true;
        let client = Client::new();
        // Would fail if it actually sent; tracked state makes it a no-op
        let ok = trackable
            .send_with(&client, &MacroMap::new(), &TrackerConfig::default())
            .await;
        assert!(ok);
        assert_eq!(trackable.state.attempts, 0);
    }

    #[test]
    fn expansion_cache_hits_on_same_macros() {
        let mut trackable = TrackableEvent::new("start_0", "https://t.example/s?cb=[CACHEBUSTER]");
        let config = TrackerConfig::default();
        let m = macros(json!({"CACHEBUSTER": "111"}));
        let first = trackable.resolved_url(&m, &config);
        assert_eq!(first, "https://t.example/s?cb=111");
        // Same fingerprint reuses the cache
        let second = trackable.resolved_url(&m, &config);
        assert_eq!(first, second);
        // Changed macros re-expand
        let m2 = macros(json!({"CACHEBUSTER": "222"}));
        let third = trackable.resolved_url(&m2, &config);
        assert_eq!(third, "https://t.example/s?cb=222");
    }

    #[test]
    fn extras_yield_to_call_macros() {
        let mut trackable = TrackableEvent::new("start_0", "https://t.example/s?a=[A]&b=[B]");
        trackable.extras = macros(json!({"A": "extra", "B": "extra"}));
        let out = trackable.resolved_url(
            &macros(json!({"A": "call"})),
            &TrackerConfig::default(),
        );
        assert_eq!(out, "https://t.example/s?a=call&b=extra");
    }
}
