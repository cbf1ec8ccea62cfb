//! Multi-source VAST fetching.
//!
//! Executes a fetch strategy over a source list: sequential walks the list in
//! order, parallel and race launch one subtask per source and keep the first
//! success, cancelling the rest through a shared token. Each source attempt
//! carries its own timeout and retry budget.

use crate::config::{FetchMode, FetchStrategy};
use crate::error::{AttemptError, ErrorKind};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Raw XML retrieved from one source.
#[derive(Debug, Clone)]
pub struct FetchedXml {
    pub body: String,
    pub source_url: String,
    pub status: u16,
}

/// Result of one multi-source fetch: the winning body (if any) plus every
/// per-source error accumulated along the way.
#[derive(Debug)]
pub struct FetchOutcome {
    pub xml: Option<FetchedXml>,
    pub errors: Vec<AttemptError>,
    pub elapsed: Duration,
}

/// Multi-source VAST fetcher with parallel, sequential and race strategies.
#[derive(Debug, Clone, Default)]
pub struct MultiSourceFetcher;

impl MultiSourceFetcher {
    pub fn new() -> Self {
        Self
    }

    /// Fetch from `sources` according to `strategy`.
    ///
    /// `token` is the caller's cancellation scope; a child token fans out to
    /// the per-source subtasks so an early winner can cancel the rest without
    /// cancelling the caller.
    pub async fn fetch(
        &self,
        sources: &[String],
        strategy: &FetchStrategy,
        client: &Client,
        params: &BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> FetchOutcome {
        let started = Instant::now();
        // Accumulated outside the strategy future so an overall timeout
        // still surfaces every per-source error gathered before it fired.
        let errors = Mutex::new(Vec::new());

        if sources.is_empty() {
            errors.lock().unwrap().push(AttemptError {
                source_url: None,
                phase: crate::error::Phase::Fetch,
                kind: ErrorKind::Transport,
                message: "no sources provided".into(),
                status_code: None,
            });
            return FetchOutcome {
                xml: None,
                errors: errors.into_inner().unwrap(),
                elapsed: started.elapsed(),
            };
        }

        debug!(
            source_count = sources.len(),
            mode = ?strategy.mode,
            per_source_timeout = strategy.per_source_timeout_secs,
            "fetch started"
        );

        let run = async {
            match strategy.mode {
                FetchMode::Sequential => {
                    self.fetch_sequential(sources, strategy, client, params, headers, token, &errors)
                        .await
                }
                FetchMode::Parallel | FetchMode::Race => {
                    self.fetch_concurrent(sources, strategy, client, params, headers, token, &errors)
                        .await
                }
            }
        };

        let xml = match strategy.overall_timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs_f64(secs), run).await {
                    Ok(xml) => xml,
                    Err(_) => {
                        errors.lock().unwrap().push(AttemptError {
                            source_url: None,
                            phase: crate::error::Phase::Fetch,
                            kind: ErrorKind::TimeoutOverall,
                            message: format!("overall deadline of {secs}s exceeded"),
                            status_code: None,
                        });
                        None
                    }
                }
            }
            None => run.await,
        };

        let errors = errors.into_inner().unwrap();
        let elapsed = started.elapsed();
        debug!(
            success = xml.is_some(),
            source_url = xml.as_ref().map(|x| x.source_url.as_str()),
            error_count = errors.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "fetch completed"
        );
        FetchOutcome { xml, errors, elapsed }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_sequential(
        &self,
        sources: &[String],
        strategy: &FetchStrategy,
        client: &Client,
        params: &BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
        token: &CancellationToken,
        errors: &Mutex<Vec<AttemptError>>,
    ) -> Option<FetchedXml> {
        for source in sources {
            if token.is_cancelled() {
                errors.lock().unwrap().push(AttemptError::fetch(
                    source.clone(),
                    ErrorKind::Cancelled,
                    "fetch cancelled before attempt",
                ));
                return None;
            }
            match self
                .fetch_single(source, strategy, client, params, headers, token)
                .await
            {
                Ok(xml) => return Some(xml),
                Err(err) => errors.lock().unwrap().push(err),
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_concurrent(
        &self,
        sources: &[String],
        strategy: &FetchStrategy,
        client: &Client,
        params: &BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
        token: &CancellationToken,
        errors: &Mutex<Vec<AttemptError>>,
    ) -> Option<FetchedXml> {
        let child = token.child_token();
        let mut pending: FuturesUnordered<_> = sources
            .iter()
            .map(|source| {
                let child = child.clone();
                async move {
                    self.fetch_single(source, strategy, client, params, headers, &child)
                        .await
                }
            })
            .collect();

        // First success wins; losers that already completed keep their error
        // entries, the rest are cancelled and dropped.
        while let Some(result) = pending.next().await {
            match result {
                Ok(xml) => {
                    child.cancel();
                    return Some(xml);
                }
                Err(err) => errors.lock().unwrap().push(err),
            }
        }
        None
    }

    /// Fetch one source with the per-source timeout and retry budget.
    /// Returns a single terminal error record after retries are exhausted.
    async fn fetch_single(
        &self,
        source: &str,
        strategy: &FetchStrategy,
        client: &Client,
        params: &BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> Result<FetchedXml, AttemptError> {
        let url = compose_url(source, params)
            .map_err(|e| AttemptError::fetch(source, ErrorKind::Transport, e))?;
        let header_map = build_headers(headers);
        let per_source = Duration::from_secs_f64(strategy.per_source_timeout_secs);

        let mut last: Option<AttemptError> = None;

        for attempt in 1..=strategy.retries + 1 {
            if token.is_cancelled() {
                // A cancelled subtask does not spend its remaining retries
                return Err(AttemptError::fetch(
                    source,
                    ErrorKind::Cancelled,
                    "fetch cancelled",
                ));
            }

            debug!(source, attempt, max = strategy.retries + 1, "fetching VAST");
            let request = client.get(url.clone()).headers(header_map.clone()).send();

            let response = tokio::select! {
                _ = token.cancelled() => {
                    return Err(AttemptError::fetch(source, ErrorKind::Cancelled, "fetch cancelled"));
                }
                outcome = tokio::time::timeout(per_source, request) => outcome,
            };

            let err = match response {
                Err(_) => AttemptError::fetch(
                    source,
                    ErrorKind::TimeoutPerSource,
                    format!("source timed out after {}s", strategy.per_source_timeout_secs),
                ),
                Ok(Err(e)) => {
                    AttemptError::fetch(source, ErrorKind::Transport, e.to_string())
                }
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    if status.as_u16() == 204 {
                        // "No ad available" — never retried
                        return Err(AttemptError::fetch(
                            source,
                            ErrorKind::NoContent,
                            "no ad available (204)",
                        )
                        .with_status(204));
                    }
                    if status.is_success() {
                        match resp.text().await {
                            Ok(body) if !body.trim().is_empty() => {
                                return Ok(FetchedXml {
                                    body,
                                    source_url: source.to_string(),
                                    status: status.as_u16(),
                                });
                            }
                            Ok(_) => AttemptError::fetch(
                                source,
                                ErrorKind::HttpStatus,
                                format!("HTTP {status} with empty body"),
                            )
                            .with_status(status.as_u16()),
                            Err(e) => {
                                AttemptError::fetch(source, ErrorKind::Transport, e.to_string())
                            }
                        }
                    } else {
                        AttemptError::fetch(source, ErrorKind::HttpStatus, format!("HTTP {status}"))
                            .with_status(status.as_u16())
                    }
                }
            };

            let retryable = err.kind.is_retryable();
            warn!(source, attempt, kind = %err.kind, error = %err.message, "fetch attempt failed");
            last = Some(err);
            if !retryable {
                break;
            }

            if attempt <= strategy.retries {
                let delay = strategy.backoff_delay(attempt);
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(AttemptError::fetch(source, ErrorKind::Cancelled, "fetch cancelled"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(last.unwrap_or_else(|| {
            AttemptError::fetch(source, ErrorKind::Transport, "no attempt made")
        }))
    }
}

/// Compose the final request URL, merging extra query params onto whatever
/// the source URL already carries.
fn compose_url(source: &str, params: &BTreeMap<String, String>) -> Result<Url, String> {
    let mut url = Url::parse(source).map_err(|e| format!("invalid source URL {source}: {e}"))?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn build_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_str(value).ok());
        match parsed {
            Some((name, value)) => {
                map.insert(name, value);
            }
            None => warn!(header = %name, "skipping invalid header"),
        }
    }
    map
}
