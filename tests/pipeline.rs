//! End-to-end pipeline tests against live stub ad servers.
//!
//! Each test binds one or more axum servers on random ports, points the
//! client at them, and asserts on the full fetch → parse → select → track
//! pipeline, including tracking hits observed server-side.

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::routing::{any, get};
use axum::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vastkit::vast::ParseFilter;
use vastkit::{ErrorKind, FetchConfig, FetchMode, FetchStrategy, Phase, VastClient};

// ── Stub servers ──────────────────────────────────────────────────────────────

/// Bind a router on a random localhost port and serve it in the background.
async fn start(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Ad server stub answering GET /vast with a fixed status/body after an
/// optional delay, counting hits.
async fn ad_server(status: u16, body: &str, delay_ms: u64) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let body = body.to_string();
    let handler_hits = Arc::clone(&hits);
    let router = Router::new().route(
        "/vast",
        get(move || {
            let body = body.clone();
            let hits = Arc::clone(&handler_hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                (StatusCode::from_u16(status).unwrap(), body)
            }
        }),
    );
    let base = start(router).await;
    (format!("{base}/vast"), hits)
}

type HitLog = Arc<Mutex<HashMap<String, usize>>>;

/// Tracking server recording every request path, always 200.
async fn tracking_server() -> (String, HitLog) {
    let log: HitLog = Arc::new(Mutex::new(HashMap::new()));
    let router = Router::new()
        .route("/{*path}", any(track_handler))
        .with_state(Arc::clone(&log));
    let base = start(router).await;
    (base, log)
}

async fn track_handler(State(log): State<HitLog>, uri: Uri) -> StatusCode {
    *log.lock().unwrap().entry(uri.path().to_string()).or_insert(0) += 1;
    StatusCode::OK
}

fn hit_count(log: &HitLog, path: &str) -> usize {
    log.lock().unwrap().get(path).copied().unwrap_or(0)
}

// ── VAST bodies ───────────────────────────────────────────────────────────────

fn inline_vast(tracking_base: &str, duration: &str, bitrate: u32) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="4.0">
  <Ad id="ad-001">
    <InLine>
      <AdSystem>Stub Adserver</AdSystem>
      <AdTitle>Stub Ad</AdTitle>
      <Impression><![CDATA[{tracking_base}/i]]></Impression>
      <Creatives>
        <Creative id="creative-001">
          <Linear>
            <Duration>{duration}</Duration>
            <TrackingEvents>
              <Tracking event="start"><![CDATA[{tracking_base}/start]]></Tracking>
              <Tracking event="firstQuartile"><![CDATA[{tracking_base}/q1]]></Tracking>
              <Tracking event="midpoint"><![CDATA[{tracking_base}/mid]]></Tracking>
              <Tracking event="thirdQuartile"><![CDATA[{tracking_base}/q3]]></Tracking>
              <Tracking event="complete"><![CDATA[{tracking_base}/complete]]></Tracking>
            </TrackingEvents>
            <MediaFiles>
              <MediaFile delivery="progressive" type="video/mp4" width="1280" height="720" bitrate="{bitrate}" codec="H.264">
                <![CDATA[https://cdn.example/ad.mp4]]>
              </MediaFile>
            </MediaFiles>
          </Linear>
        </Creative>
      </Creatives>
    </InLine>
  </Ad>
</VAST>"#
    )
}

fn wrapper_vast(next_uri: &str, impression: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="3.0">
  <Ad id="wrapper-ad">
    <Wrapper>
      <AdSystem>Wrapper Exchange</AdSystem>
      <VASTAdTagURI><![CDATA[{next_uri}]]></VASTAdTagURI>
      <Impression><![CDATA[{impression}]]></Impression>
    </Wrapper>
  </Ad>
</VAST>"#
    )
}

fn sequential_strategy() -> FetchStrategy {
    FetchStrategy {
        mode: FetchMode::Sequential,
        retries: 0,
        backoff_base_secs: 0.01,
        ..Default::default()
    }
}

// ── Scenario A: single source success ─────────────────────────────────────────

#[tokio::test]
async fn single_source_success_fires_one_impression() {
    let (tracking_base, log) = tracking_server().await;
    let vast = inline_vast(&tracking_base, "00:00:30", 2000);
    let (source, ad_hits) = ad_server(200, &vast, 0).await;

    let client = VastClient::builder()
        .source(&source)
        .strategy(sequential_strategy())
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(result.is_success());
    let ad = result.ad.as_ref().unwrap();
    assert_eq!(ad.duration_secs, 30);
    assert_eq!(result.source_url.as_deref(), Some(source.as_str()));
    assert!(result.errors.is_empty());
    assert!(!result.used_fallback);
    assert!(result.impression_tracked);

    assert_eq!(ad_hits.load(Ordering::SeqCst), 1);
    assert_eq!(hit_count(&log, "/i"), 1);
    // Quartile URLs are not fired by a fetch
    assert_eq!(hit_count(&log, "/q1"), 0);
}

// ── Scenario B: parallel race with one failing source ─────────────────────────

#[tokio::test]
async fn parallel_returns_first_valid_and_records_failure() {
    let (tracking_base, _log) = tracking_server().await;
    let vast = inline_vast(&tracking_base, "00:00:15", 2000);

    let (source_a, _) = ad_server(200, &vast, 200).await;
    let (source_b, _) = ad_server(500, "server error", 100).await;
    let (source_c, _) = ad_server(200, &vast, 400).await;

    let strategy = FetchStrategy {
        mode: FetchMode::Parallel,
        per_source_timeout_secs: 0.5,
        retries: 0,
        ..Default::default()
    };
    let client = VastClient::builder()
        .source(&source_a)
        .source(&source_b)
        .source(&source_c)
        .strategy(strategy)
        .auto_track(false)
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(result.is_success());
    // A is the first valid response; C is still in flight and gets cancelled
    assert_eq!(result.source_url.as_deref(), Some(source_a.as_str()));

    // B completed before the winner and left exactly one http-status entry
    assert_eq!(result.errors.len(), 1);
    let err = &result.errors[0];
    assert_eq!(err.kind, ErrorKind::HttpStatus);
    assert_eq!(err.status_code, Some(500));
    assert_eq!(err.source_url.as_deref(), Some(source_b.as_str()));
}

// ── Scenario C: fallback cascade ──────────────────────────────────────────────

#[tokio::test]
async fn fallback_cascade_recovers_from_transport_and_parse_errors() {
    let (tracking_base, log) = tracking_server().await;

    // P: connection refused (nothing listens on the port after drop)
    let refused = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/vast")
    };
    let (bad_xml, _) = ad_server(200, "<<<definitely not xml>>>", 0).await;
    let (good, _) = ad_server(200, &inline_vast(&tracking_base, "00:00:20", 2000), 0).await;

    let client = VastClient::builder()
        .source(&refused)
        .fallback(&bad_xml)
        .fallback(&good)
        .strategy(sequential_strategy())
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(result.is_success());
    assert!(result.used_fallback);
    assert_eq!(result.source_url.as_deref(), Some(good.as_str()));

    let kinds: Vec<ErrorKind> = result.errors.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&ErrorKind::Transport));
    assert!(kinds.contains(&ErrorKind::InvalidXml));
    assert!(!kinds.iter().any(|k| *k == ErrorKind::FilterRejected));
    assert!(result
        .errors
        .iter()
        .all(|e| e.source_url.as_deref() != Some(good.as_str())));

    assert_eq!(hit_count(&log, "/i"), 1);
}

// ── Scenario D: wrapper resolution ────────────────────────────────────────────

#[tokio::test]
async fn wrapper_chain_merges_impressions_outermost_first() {
    let (tracking_base, _log) = tracking_server().await;

    let inline_body = inline_vast(&tracking_base, "00:00:30", 2000);
    let (inline_url, inline_hits) = ad_server(200, &inline_body, 0).await;

    let w1_body = wrapper_vast(&inline_url, &format!("{tracking_base}/w1-imp"));
    let (w1_url, w1_hits) = ad_server(200, &w1_body, 0).await;

    let primary_body = wrapper_vast(&w1_url, &format!("{tracking_base}/wrapper-imp"));
    let (primary_url, primary_hits) = ad_server(200, &primary_body, 0).await;

    let client = VastClient::builder()
        .source(&primary_url)
        .strategy(sequential_strategy())
        .auto_track(false)
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(result.is_success());
    let ad = result.ad.unwrap();
    assert!(!ad.wrapper_resolution_failed);
    assert!(!ad.is_wrapper());
    assert_eq!(
        ad.impressions,
        vec![
            format!("{tracking_base}/wrapper-imp"),
            format!("{tracking_base}/w1-imp"),
            format!("{tracking_base}/i"),
        ]
    );
    assert_eq!(ad.duration_secs, 30);

    // Two intermediate fetches beyond the primary
    assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
    assert_eq!(w1_hits.load(Ordering::SeqCst), 1);
    assert_eq!(inline_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wrapper_cycle_sets_resolution_failed() {
    // A wrapper that points at itself
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = Arc::clone(&hits);
    let self_url: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let handler_url = Arc::clone(&self_url);
    let router = Router::new().route(
        "/vast",
        get(move || {
            let hits = Arc::clone(&handler_hits);
            let url = Arc::clone(&handler_url);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let me = url.lock().unwrap().clone();
                wrapper_vast(&me, "https://t.example/never")
            }
        }),
    );
    let base = start(router).await;
    let source = format!("{base}/vast");
    *self_url.lock().unwrap() = source.clone();

    let client = VastClient::builder()
        .source(&source)
        .strategy(sequential_strategy())
        .auto_track(false)
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    // The deepest parse is returned with the failure flag set
    let ad = result.ad.unwrap();
    assert!(ad.wrapper_resolution_failed);
    assert!(result
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::WrapperDepthExceeded));
}

// ── Scenario E: parse filter rejection ────────────────────────────────────────

#[tokio::test]
async fn filter_rejects_low_bitrate_without_tracking() {
    let (tracking_base, log) = tracking_server().await;
    let vast = inline_vast(&tracking_base, "00:00:30", 500);
    let (source, _) = ad_server(200, &vast, 0).await;

    let client = VastClient::builder()
        .source(&source)
        .strategy(sequential_strategy())
        .build()
        .unwrap();
    let fetch = FetchConfig::single(&source)
        .with_strategy(sequential_strategy())
        .with_filter(ParseFilter {
            min_bitrate: Some(1000),
            ..Default::default()
        });
    let result = client.request_with(fetch).await.unwrap();

    assert!(!result.is_success());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::FilterRejected);
    assert_eq!(result.errors[0].phase, Phase::Select);
    assert_eq!(hit_count(&log, "/i"), 0);
}

// ── Boundary: 204 everywhere ──────────────────────────────────────────────────

#[tokio::test]
async fn all_sources_204_is_no_content_not_error() {
    let (source_a, hits_a) = ad_server(204, "", 0).await;
    let (source_b, _) = ad_server(204, "", 0).await;

    let client = VastClient::builder()
        .source(&source_a)
        .source(&source_b)
        .strategy(sequential_strategy())
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(!result.is_success());
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|e| e.kind == ErrorKind::NoContent));
    // 204 is never retried
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
}

// ── Sequential error prefix invariant ─────────────────────────────────────────

#[tokio::test]
async fn sequential_errors_are_a_prefix_of_the_source_list() {
    let (tracking_base, _log) = tracking_server().await;
    let (bad1, _) = ad_server(503, "", 0).await;
    let (bad2, _) = ad_server(404, "", 0).await;
    let (good, _) = ad_server(200, &inline_vast(&tracking_base, "00:00:10", 2000), 0).await;
    let (never, never_hits) = ad_server(200, &inline_vast(&tracking_base, "00:00:10", 2000), 0).await;

    let client = VastClient::builder()
        .source(&bad1)
        .source(&bad2)
        .source(&good)
        .source(&never)
        .strategy(sequential_strategy())
        .auto_track(false)
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.source_url.as_deref(), Some(good.as_str()));
    let failed: Vec<&str> = result
        .errors
        .iter()
        .filter_map(|e| e.source_url.as_deref())
        .collect();
    assert_eq!(failed, vec![bad1.as_str(), bad2.as_str()]);
    // Sources after the first success are never attempted
    assert_eq!(never_hits.load(Ordering::SeqCst), 0);
}

// ── Per-source retries and overall timeout ────────────────────────────────────

#[tokio::test]
async fn http_errors_are_retried_per_config() {
    let (source, hits) = ad_server(500, "", 0).await;
    let strategy = FetchStrategy {
        mode: FetchMode::Sequential,
        retries: 2,
        backoff_base_secs: 0.01,
        backoff_multiplier: 1.0,
        ..Default::default()
    };
    let client = VastClient::builder()
        .source(&source)
        .strategy(strategy)
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(!result.is_success());
    // 1 initial + 2 retries
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::HttpStatus);
}

#[tokio::test]
async fn overall_timeout_caps_slow_sources() {
    let (tracking_base, _log) = tracking_server().await;
    let vast = inline_vast(&tracking_base, "00:00:10", 2000);
    let (slow, _) = ad_server(200, &vast, 5_000).await;

    let strategy = FetchStrategy {
        mode: FetchMode::Parallel,
        per_source_timeout_secs: 10.0,
        overall_timeout_secs: Some(0.3),
        retries: 0,
        ..Default::default()
    };
    let client = VastClient::builder()
        .source(&slow)
        .strategy(strategy)
        .build()
        .unwrap();
    let result = client.request().await.unwrap();

    assert!(!result.is_success());
    assert!(result
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::TimeoutOverall));
    assert!(result.elapsed < Duration::from_secs(2));
}

// ── Tracker behavior over the wire ────────────────────────────────────────────

#[tokio::test]
async fn tracker_is_idempotent_across_track_calls() {
    let (tracking_base, log) = tracking_server().await;
    let vast = inline_vast(&tracking_base, "00:00:30", 2000);
    let (source, _) = ad_server(200, &vast, 0).await;

    let client = VastClient::builder()
        .source(&source)
        .strategy(sequential_strategy())
        .auto_track(false)
        .build()
        .unwrap();
    let result = client.request().await.unwrap();
    let ad = result.ad.unwrap();

    let mut tracker = client.tracker_for(&ad).unwrap();
    let first = tracker.track("impression", None).await;
    assert_eq!(first.successful, 1);
    let second = tracker.track("impression", None).await;
    // Already tracked: no-op success, no second request
    assert_eq!(second.successful, 1);
    assert_eq!(hit_count(&log, "/i"), 1);
}

#[tokio::test]
async fn tracking_retries_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler_attempts = Arc::clone(&attempts);
    let router = Router::new().route(
        "/pixel",
        get(move || {
            let attempts = Arc::clone(&handler_attempts);
            async move {
                // Fail twice, then succeed
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let base = start(router).await;

    let mut config = vastkit::config::TrackerConfig::default();
    config.max_retries = 3;
    config.retry_delay_secs = 0.01;
    let mut tracker = vastkit::Tracker::new(reqwest::Client::new(), config);
    tracker.register("impression", format!("{base}/pixel"));

    let result = tracker.track("impression", None).await;
    assert_eq!(result.successful, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn tracking_macros_expand_on_the_wire() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = Arc::clone(&seen);
    let router = Router::new().route(
        "/pixel",
        get(move |uri: Uri| {
            let seen = Arc::clone(&handler_seen);
            async move {
                seen.lock().unwrap().push(uri.to_string());
                StatusCode::OK
            }
        }),
    );
    let base = start(router).await;

    let mut tracker = vastkit::Tracker::new(
        reqwest::Client::new(),
        vastkit::config::TrackerConfig::default(),
    )
    .with_creative_id("cr-42");
    tracker.register(
        "start",
        format!("{base}/pixel?cr=[CREATIVE_ID]&cb=${{CACHEBUSTER}}&keep=[UNKNOWN]"),
    );

    let result = tracker.track("start", None).await;
    assert_eq!(result.successful, 1);

    let requests = seen.lock().unwrap();
    let query = &requests[0];
    assert!(query.contains("cr=cr-42"));
    assert!(!query.contains("CACHEBUSTER"));
    // Unknown macros pass through untouched (URL-encoded brackets included)
    assert!(query.contains("UNKNOWN"));
}
