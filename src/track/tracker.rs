//! Registry of tracking events and the firing engine.
//!
//! The registry maps lowercased event types to ordered trackable lists;
//! multiple URLs per event fire in registration order (or concurrently when
//! parallel tracking is enabled — success counting stays deterministic).

use crate::config::TrackerConfig;
use crate::error::ErrorKind;
use crate::macros::{format_playhead, MacroMap};
use crate::metrics;
use crate::track::trackable::{Trackable, TrackableEvent};
use crate::vast::model::ParsedAd;
use futures::future::join_all;
use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Per-trackable outcome of one `track()` call.
#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub key: String,
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<ErrorKind>,
    /// Seconds spent on this trackable, retries included
    pub duration: f64,
}

/// Aggregate result of firing one event type.
#[derive(Debug, Clone, Default)]
pub struct TrackResult {
    pub successful: usize,
    pub total: usize,
    pub outcomes: Vec<TrackOutcome>,
}

impl TrackResult {
    pub fn all_succeeded(&self) -> bool {
        self.successful == self.total
    }
}

/// Handles VAST tracking events for ad playback.
pub struct Tracker {
    registry: BTreeMap<String, Vec<TrackableEvent>>,
    client: Client,
    config: TrackerConfig,
    creative_id: Option<String>,
    /// Ad-request context: raw nested tree plus flattened UPPERCASE keys
    context_macros: MacroMap,
    /// Current playback offset, feeding CONTENTPLAYHEAD
    playhead_secs: Option<f64>,
}

impl Tracker {
    pub fn new(client: Client, config: TrackerConfig) -> Self {
        Self {
            registry: BTreeMap::new(),
            client,
            config,
            creative_id: None,
            context_macros: MacroMap::new(),
            playhead_secs: None,
        }
    }

    /// Build a tracker from a parsed ad: impressions register under
    /// `impression`, tracking-event entries under their parsed keys.
    pub fn from_ad(ad: &ParsedAd, client: Client, config: TrackerConfig) -> Self {
        let mut tracker = Self::new(client, config);
        if !ad.creative_id.is_empty() {
            tracker.creative_id = Some(ad.creative_id.clone());
        }
        for url in &ad.impressions {
            tracker.register("impression", url.clone());
        }
        for (event, urls) in &ad.tracking_events {
            for url in urls {
                tracker.register(event, url.clone());
            }
        }
        tracker
    }

    /// Attach ad-request context. Keys become macros both as their raw
    /// nested paths (`ext.domain`) and flattened uppercase (`EXT_DOMAIN`).
    pub fn with_context(mut self, ad_request: &MacroMap) -> Self {
        for (key, value) in ad_request {
            self.context_macros.insert(key.clone(), value.clone());
        }
        flatten_into(&mut self.context_macros, ad_request, "");
        self
    }

    pub fn with_creative_id(mut self, creative_id: impl Into<String>) -> Self {
        self.creative_id = Some(creative_id.into());
        self
    }

    /// Register one URL under an event type (appended in order).
    pub fn register(&mut self, event: &str, url: String) {
        let key = event.to_ascii_lowercase();
        let list = self.registry.entry(key.clone()).or_default();
        let trackable = TrackableEvent::new(format!("{key}_{}", list.len()), url);
        list.push(trackable);
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.registry.contains_key(&event.to_ascii_lowercase())
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    /// Registered `progress-N` offsets in seconds, for the playback engine.
    pub fn progress_offsets(&self) -> Vec<i64> {
        self.registry
            .keys()
            .filter_map(|key| key.strip_prefix("progress-"))
            .filter_map(|raw| raw.parse().ok())
            .collect()
    }

    /// Update the playback offset feeding the CONTENTPLAYHEAD macro.
    pub fn set_playhead(&mut self, offset_secs: f64) {
        self.playhead_secs = Some(offset_secs);
    }

    /// Fire every URL registered for `event`.
    pub async fn track(&mut self, event: &str, macros: Option<&MacroMap>) -> TrackResult {
        let key = event.to_ascii_lowercase();
        let final_macros = self.build_macros(macros);
        let client = self.client.clone();
        let config = self.config.clone();

        let Some(trackables) = self.registry.get_mut(&key) else {
            warn!(event = %key, "event not found in tracking registry");
            return TrackResult::default();
        };

        debug!(
            event = %key,
            trackables = trackables.len(),
            parallel = config.parallel_tracking,
            "tracking event"
        );

        let outcomes: Vec<TrackOutcome> = if config.parallel_tracking {
            let futures = trackables.iter_mut().map(|trackable| {
                let client = client.clone();
                let config = config.clone();
                let macros = final_macros.clone();
                async move {
                    let started = Instant::now();
                    let success = trackable.send_with(&client, &macros, &config).await;
                    outcome_of(trackable, success, started)
                }
            });
            join_all(futures).await
        } else {
            let mut outcomes = Vec::with_capacity(trackables.len());
            for trackable in trackables.iter_mut() {
                let started = Instant::now();
                let success = trackable.send_with(&client, &final_macros, &config).await;
                outcomes.push(outcome_of(trackable, success, started));
            }
            outcomes
        };

        for outcome in &outcomes {
            let result = if outcome.success { "success" } else { "error" };
            metrics::record_tracking_event(&key, result);
        }

        let successful = outcomes.iter().filter(|o| o.success).count();
        let total = outcomes.len();
        if successful < total {
            warn!(event = %key, successful, total, "event tracked partially");
        } else {
            debug!(event = %key, total, "event tracked");
        }

        TrackResult {
            successful,
            total,
            outcomes,
        }
    }

    /// Merge macro layers, lowest precedence first: static config macros,
    /// ad-request context, automatic builtins, explicitly provided macros.
    pub(crate) fn build_macros(&self, provided: Option<&MacroMap>) -> MacroMap {
        let mut merged = self.config.static_macros.clone();
        for (k, v) in &self.context_macros {
            merged.insert(k.clone(), v.clone());
        }

        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let cachebuster = rand::thread_rng().gen_range(100_000..1_000_000).to_string();
        merged.insert("TIMESTAMP".into(), Value::String(now_secs.to_string()));
        merged.insert("CACHEBUSTER".into(), Value::String(cachebuster.clone()));
        merged.insert("CACHEBUSTING".into(), Value::String(cachebuster));
        merged.insert(
            "RANDOM".into(),
            Value::String(rand::thread_rng().gen_range(100_000..1_000_000).to_string()),
        );
        if let Some(offset) = self.playhead_secs {
            merged.insert(
                "CONTENTPLAYHEAD".into(),
                Value::String(format_playhead(offset)),
            );
        }
        if let Some(creative_id) = &self.creative_id {
            merged.insert("CREATIVE_ID".into(), Value::String(creative_id.clone()));
            merged.insert("ADID".into(), Value::String(creative_id.clone()));
        }

        if let Some(provided) = provided {
            for (k, v) in provided {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

fn outcome_of(trackable: &TrackableEvent, success: bool, started: Instant) -> TrackOutcome {
    TrackOutcome {
        key: trackable.key.clone(),
        success,
        status: trackable.state.last_status,
        error: if success { None } else { trackable.state.failed },
        duration: started.elapsed().as_secs_f64(),
    }
}

/// Flatten nested maps into `PATH_SEGMENTS` uppercase macro keys without
/// overriding existing entries.
fn flatten_into(target: &mut MacroMap, source: &MacroMap, prefix: &str) {
    for (key, value) in source {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) => flatten_into(target, nested, &path),
            other => {
                let macro_key = path.replace('.', "_").to_ascii_uppercase();
                target.entry(macro_key).or_insert_with(|| other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::expand;
    use serde_json::json;

    fn macros(value: serde_json::Value) -> MacroMap {
        value.as_object().unwrap().clone()
    }

    fn tracker() -> Tracker {
        Tracker::new(Client::new(), TrackerConfig::default())
    }

    #[test]
    fn registry_preserves_per_event_order() {
        let mut t = tracker();
        t.register("impression", "https://a.example/1".into());
        t.register("impression", "https://a.example/2".into());
        t.register("Start", "https://a.example/s".into());
        assert!(t.has_event("impression"));
        assert!(t.has_event("start"));
        assert!(t.has_event("START"));
        assert!(!t.has_event("complete"));
    }

    #[test]
    fn from_ad_registers_impressions_and_events() {
        let mut ad = ParsedAd {
            creative_id: "cr-1".into(),
            impressions: vec!["https://t/i1".into(), "https://t/i2".into()],
            ..Default::default()
        };
        ad.tracking_events
            .insert("firstquartile".into(), vec!["https://t/q1".into()]);
        ad.tracking_events
            .insert("progress-5".into(), vec!["https://t/p5".into()]);
        ad.tracking_events
            .insert("progress--5".into(), vec!["https://t/pm5".into()]);

        let t = Tracker::from_ad(&ad, Client::new(), TrackerConfig::default());
        assert!(t.has_event("impression"));
        assert!(t.has_event("firstquartile"));
        let mut offsets = t.progress_offsets();
        offsets.sort();
        assert_eq!(offsets, vec![-5, 5]);
    }

    #[test]
    fn macro_precedence_explicit_over_builtin_over_context_over_static() {
        let mut config = TrackerConfig::default();
        config.static_macros = macros(json!({
            "TIMESTAMP": "static-ts",
            "PUBLISHER": "static-pub",
            "DEVICE_SERIAL": "static-serial"
        }));
        let t = Tracker::new(Client::new(), config)
            .with_context(&macros(json!({"device_serial": "ctx-serial"})))
            .with_creative_id("cr-9");

        let merged = t.build_macros(Some(&macros(json!({"TIMESTAMP": "explicit-ts"}))));

        // explicit beats builtin
        assert_eq!(merged["TIMESTAMP"], "explicit-ts");
        // context beats static
        assert_eq!(merged["DEVICE_SERIAL"], "ctx-serial");
        // static survives when nothing overrides
        assert_eq!(merged["PUBLISHER"], "static-pub");
        // builtins are present
        assert!(merged.contains_key("CACHEBUSTER"));
        assert_eq!(merged["CREATIVE_ID"], "cr-9");
    }

    #[test]
    fn context_flattens_nested_paths() {
        let t = tracker().with_context(&macros(json!({
            "ext": {"channel": {"display_name": "News One"}},
            "device_serial": "abc-123"
        })));
        let merged = t.build_macros(None);
        assert_eq!(merged["EXT_CHANNEL_DISPLAY_NAME"], "News One");
        assert_eq!(merged["DEVICE_SERIAL"], "abc-123");
        // Raw nested tree stays reachable for dotted template names
        let out = expand(
            "d=[ext.channel.display_name]",
            &merged,
            &crate::macros::default_formats(),
        );
        assert_eq!(out, "d=News One");
    }

    #[test]
    fn playhead_feeds_contentplayhead() {
        let mut t = tracker();
        assert!(!t.build_macros(None).contains_key("CONTENTPLAYHEAD"));
        t.set_playhead(7.5);
        assert_eq!(t.build_macros(None)["CONTENTPLAYHEAD"], "00:00:07.500");
    }

    #[tokio::test]
    async fn unknown_event_returns_empty_result() {
        let mut t = tracker();
        let result = t.track("complete", None).await;
        assert_eq!(result.total, 0);
        assert_eq!(result.successful, 0);
        assert!(result.outcomes.is_empty());
    }

    #[tokio::test]
    async fn empty_url_outcome_is_failed_without_network() {
        let mut t = tracker();
        t.register("impression", String::new());
        let result = t.track("impression", None).await;
        assert_eq!(result.total, 1);
        assert_eq!(result.successful, 0);
        assert_eq!(result.outcomes[0].error, Some(ErrorKind::EmptyUrl));
    }
}
