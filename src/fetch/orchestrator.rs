//! Pipeline coordinator: FETCH → PARSE → SELECT → TRACK.
//!
//! The orchestrator is the single entry point for ad requests; a
//! single-source request is just `sources = [url]`. It drives the fetcher
//! over the primary group, resolves wrapper chains, applies the parse
//! filter, walks the fallback list on failure, and auto-fires the impression
//! once a candidate fully succeeds.

use crate::config::{FetchConfig, FetchMode, FetchStrategy, TrackerConfig};
use crate::error::{AttemptError, ErrorKind, Result};
use crate::fetch::fetcher::MultiSourceFetcher;
use crate::http_pool::{HttpPool, TlsMode};
use crate::metrics;
use crate::track::tracker::Tracker;
use crate::vast::model::ParsedAd;
use crate::vast::parser::VastParser;
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one orchestrated request.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub ad: Option<ParsedAd>,
    /// URL of the source that produced the winning ad
    pub source_url: Option<String>,
    /// Every failed attempt across sources, wrappers, and fallbacks
    pub errors: Vec<AttemptError>,
    pub elapsed: Duration,
    pub impression_tracked: bool,
    pub used_fallback: bool,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.ad.is_some()
    }
}

/// Main coordinator for multi-source VAST operations.
pub struct Orchestrator {
    parser: VastParser,
    fetcher: MultiSourceFetcher,
    pool: Arc<HttpPool>,
    tls: TlsMode,
    tracker_config: TrackerConfig,
}

impl Orchestrator {
    pub fn new(
        parser: VastParser,
        pool: Arc<HttpPool>,
        tls: TlsMode,
        tracker_config: TrackerConfig,
    ) -> Self {
        Self {
            parser,
            fetcher: MultiSourceFetcher::new(),
            pool,
            tls,
            tracker_config,
        }
    }

    /// Execute the full pipeline for one fetch config.
    pub async fn execute(&self, config: &FetchConfig) -> Result<FetchResult> {
        let token = CancellationToken::new();
        self.execute_with_token(config, &token).await
    }

    /// Execute with an externally controlled cancellation scope.
    pub async fn execute_with_token(
        &self,
        config: &FetchConfig,
        token: &CancellationToken,
    ) -> Result<FetchResult> {
        config.validate()?;
        let started = Instant::now();
        let client = self.pool.main_client(&self.tls)?;

        info!(
            source_count = config.sources.len(),
            fallback_count = config.fallbacks.len(),
            mode = ?config.strategy.mode,
            auto_track = config.auto_track,
            "ad request started"
        );

        let mut errors = Vec::new();
        let mut winner: Option<(ParsedAd, String)> = None;
        let mut used_fallback = false;

        // Candidate groups: the primary source list, then each fallback as a
        // single-entry group. Fallbacks stop as soon as a group succeeds.
        let fallback_groups = config.fallbacks.iter().map(std::slice::from_ref);
        let groups = std::iter::once(config.sources.as_slice()).chain(fallback_groups);

        for (index, group) in groups.enumerate() {
            if index > 0 {
                metrics::record_fallback();
                debug!(fallback = %group[0], "trying fallback source");
            }

            match self
                .try_group(group, config, &client, token, &mut errors)
                .await
            {
                Some((ad, source_url)) => {
                    used_fallback = index > 0;
                    winner = Some((ad, source_url));
                    break;
                }
                None => continue,
            }
        }

        let mut impression_tracked = false;
        if let Some((ad, _)) = &winner {
            if config.auto_track {
                impression_tracked = self.fire_impression(ad).await;
            }
        }

        metrics::record_fetch(match &winner {
            Some(_) => "success",
            None if errors.iter().all(|e| e.kind == ErrorKind::NoContent) => "no_content",
            None => "error",
        });
        metrics::record_pipeline_duration(started);

        let (ad, source_url) = match winner {
            Some((ad, source)) => (Some(ad), Some(source)),
            None => (None, None),
        };

        if ad.is_some() {
            info!(
                source_url = source_url.as_deref().unwrap_or(""),
                used_fallback,
                impression_tracked,
                error_count = errors.len(),
                "ad request succeeded"
            );
        } else {
            warn!(error_count = errors.len(), "ad request failed on every source");
        }

        Ok(FetchResult {
            ad,
            source_url,
            errors,
            elapsed: started.elapsed(),
            impression_tracked,
            used_fallback,
        })
    }

    /// Run FETCH → PARSE → wrapper resolution → SELECT for one source group.
    async fn try_group(
        &self,
        group: &[String],
        config: &FetchConfig,
        client: &Client,
        token: &CancellationToken,
        errors: &mut Vec<AttemptError>,
    ) -> Option<(ParsedAd, String)> {
        // FETCH
        let outcome = self
            .fetcher
            .fetch(
                group,
                &config.strategy,
                client,
                &config.params,
                &config.headers,
                token,
            )
            .await;
        errors.extend(outcome.errors);
        let xml = outcome.xml?;

        // PARSE
        let ad = match self.parser.parse(&xml.body) {
            Ok(ad) => {
                metrics::record_parse("success");
                ad
            }
            Err(e) => {
                metrics::record_parse("error");
                errors.push(AttemptError::parse(
                    xml.source_url.clone(),
                    e.parse_kind(),
                    e.to_string(),
                ));
                return None;
            }
        };

        let ad = self
            .resolve_wrappers(ad, &xml.source_url, config, client, token, errors)
            .await;

        // SELECT
        if let Some(filter) = &config.parse_filter {
            if !filter.accepts(&ad) {
                errors.push(AttemptError::select(
                    xml.source_url.clone(),
                    ErrorKind::FilterRejected,
                    "no media file satisfied the parse filter",
                ));
                return None;
            }
        }

        Some((ad, xml.source_url))
    }

    /// Follow a wrapper chain up to the depth limit, folding each level's
    /// impression and tracking URLs into the ad below it. On failure the
    /// deepest parse is kept with `wrapper_resolution_failed` set.
    async fn resolve_wrappers(
        &self,
        ad: ParsedAd,
        origin: &str,
        config: &FetchConfig,
        client: &Client,
        token: &CancellationToken,
        errors: &mut Vec<AttemptError>,
    ) -> ParsedAd {
        let mut current = ad;
        let mut visited: HashSet<String> = HashSet::from([origin.to_string()]);
        let mut depth = 0u32;

        // Wrapper hops degrade to sequential: one URI at a time
        let nested_strategy = FetchStrategy {
            mode: FetchMode::Sequential,
            ..config.strategy.clone()
        };

        while current.is_wrapper() {
            let uri = current.wrapper_uri.clone().unwrap_or_default();

            if depth >= config.wrapper_depth_limit {
                warn!(depth, limit = config.wrapper_depth_limit, "wrapper depth limit reached");
                errors.push(AttemptError::fetch(
                    uri,
                    ErrorKind::WrapperDepthExceeded,
                    format!("wrapper depth limit {} reached", config.wrapper_depth_limit),
                ));
                current.wrapper_resolution_failed = true;
                break;
            }
            if !visited.insert(uri.clone()) {
                warn!(uri = %uri, "wrapper chain cycle detected");
                errors.push(AttemptError::fetch(
                    uri,
                    ErrorKind::WrapperDepthExceeded,
                    "wrapper chain cycle detected",
                ));
                current.wrapper_resolution_failed = true;
                break;
            }

            depth += 1;
            metrics::record_wrapper_hop();
            debug!(uri = %uri, depth, "following wrapper");

            let outcome = self
                .fetcher
                .fetch(
                    std::slice::from_ref(&uri),
                    &nested_strategy,
                    client,
                    &config.params,
                    &config.headers,
                    token,
                )
                .await;
            errors.extend(outcome.errors);

            let Some(xml) = outcome.xml else {
                current.wrapper_resolution_failed = true;
                break;
            };

            match self.parser.parse(&xml.body) {
                Ok(mut next) => {
                    metrics::record_parse("success");
                    next.absorb_outer(&current);
                    current = next;
                }
                Err(e) => {
                    metrics::record_parse("error");
                    errors.push(AttemptError::parse(uri, e.parse_kind(), e.to_string()));
                    current.wrapper_resolution_failed = true;
                    break;
                }
            }
        }

        current
    }

    /// TRACK phase: fire the impression once. Tracking failures never fail
    /// the pipeline — they surface through the returned flag and logs.
    async fn fire_impression(&self, ad: &ParsedAd) -> bool {
        if ad.impressions.is_empty() {
            return false;
        }
        let tracking_client = match self.pool.tracking_client(&self.tls) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "tracking client unavailable, impression skipped");
                return false;
            }
        };
        let mut tracker = Tracker::from_ad(ad, tracking_client, self.tracker_config.clone());
        let result = tracker.track("impression", None).await;
        result.successful > 0
    }

    /// Build a tracker for the resolved ad using this orchestrator's
    /// tracking client and config.
    pub fn tracker_for(&self, ad: &ParsedAd) -> Result<Tracker> {
        let client = self.pool.tracking_client(&self.tls)?;
        Ok(Tracker::from_ad(ad, client, self.tracker_config.clone()))
    }
}
