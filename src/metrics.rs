use metrics::{counter, gauge, histogram};
use std::time::Instant;

// ── Metric names ────────────────────────────────────────────────────────

/// VAST fetch attempts by result (success, error, timeout, no_content)
pub const FETCH_REQUESTS: &str = "vastkit_fetch_requests_total";
/// End-to-end pipeline duration in seconds
pub const PIPELINE_DURATION: &str = "vastkit_pipeline_duration_seconds";
/// Parse outcomes by result (success, error)
pub const PARSE_RESULTS: &str = "vastkit_parse_total";
/// Tracking pixel sends by event type and result
pub const TRACKING_EVENTS: &str = "vastkit_tracking_events_total";
/// Wrapper redirects followed
pub const WRAPPER_HOPS: &str = "vastkit_wrapper_hops_total";
/// Fallback source activations
pub const FALLBACKS: &str = "vastkit_fallbacks_total";
/// Currently running playback sessions
pub const ACTIVE_PLAYBACKS: &str = "vastkit_active_playbacks";

// ── Recording helpers ───────────────────────────────────────────────────

/// Record a fetch attempt result
pub fn record_fetch(result: &str) {
    counter!(FETCH_REQUESTS, "result" => result.to_string()).increment(1);
}

/// Record full pipeline duration
pub fn record_pipeline_duration(start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    histogram!(PIPELINE_DURATION).record(duration);
}

/// Record a parse outcome
pub fn record_parse(result: &str) {
    counter!(PARSE_RESULTS, "result" => result.to_string()).increment(1);
}

/// Record a tracking pixel send
pub fn record_tracking_event(event: &str, result: &str) {
    counter!(TRACKING_EVENTS, "event" => event.to_string(), "result" => result.to_string())
        .increment(1);
}

/// Record a followed wrapper redirect
pub fn record_wrapper_hop() {
    counter!(WRAPPER_HOPS).increment(1);
}

/// Record a fallback source activation
pub fn record_fallback() {
    counter!(FALLBACKS).increment(1);
}

/// Update running playback session count
pub fn set_active_playbacks(count: usize) {
    gauge!(ACTIVE_PLAYBACKS).set(count as f64);
}

/// A playback session entered the running state
pub fn playback_started() {
    gauge!(ACTIVE_PLAYBACKS).increment(1.0);
}

/// A playback session reached a terminal state
pub fn playback_ended() {
    gauge!(ACTIVE_PLAYBACKS).decrement(1.0);
}
