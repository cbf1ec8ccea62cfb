//! Client facade: construction paths and request entry points.

use crate::config::{ClientConfig, FetchConfig, FetchStrategy, PlaybackConfig, TrackerConfig};
use crate::error::Result;
use crate::fetch::orchestrator::{FetchResult, Orchestrator};
use crate::http_pool::{HttpPool, TlsMode};
use crate::playback::engine::PlaybackEngine;
use crate::time::TimeSource;
use crate::track::tracker::Tracker;
use crate::vast::model::ParsedAd;
use crate::vast::parser::VastParser;
use std::sync::Arc;

/// VAST ad client.
///
/// Owns its transport pool and orchestrator. Safe to share across tasks for
/// `request()`; per-call state lives in the returned [`FetchResult`].
pub struct VastClient {
    config: ClientConfig,
    pool: Arc<HttpPool>,
    orchestrator: Orchestrator,
}

impl VastClient {
    /// Minimal construction: a single source URL with default settings.
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::from_config(ClientConfig::from_url(url))
    }

    /// Full construction from a resolved configuration.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(HttpPool::new(
            config.http_main.to_settings(),
            config.http_tracking.to_settings(),
        ));
        let orchestrator = Orchestrator::new(
            VastParser::new(config.parser.clone()),
            Arc::clone(&pool),
            config.tls.clone(),
            config.tracker.clone(),
        );
        Ok(Self {
            config,
            pool,
            orchestrator,
        })
    }

    /// Composition-style construction with default params and headers.
    pub fn builder() -> VastClientBuilder {
        VastClientBuilder::default()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Direct orchestrator access for advanced callers.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Execute the configured request (single- or multi-source).
    pub async fn request(&self) -> Result<FetchResult> {
        self.orchestrator.execute(&self.config.fetch_config()).await
    }

    /// Execute an explicit fetch config, inheriting this client's default
    /// params and headers where the call does not set its own.
    pub async fn request_with(&self, mut fetch: FetchConfig) -> Result<FetchResult> {
        for (key, value) in &self.config.params {
            fetch.params.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, value) in &self.config.headers {
            fetch
                .headers
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.orchestrator.execute(&fetch).await
    }

    /// Try `primary` sources, then each fallback in order.
    pub async fn request_with_fallback(
        &self,
        primary: Vec<String>,
        fallbacks: Vec<String>,
    ) -> Result<FetchResult> {
        let mut fetch = self.config.fetch_config();
        fetch.sources = primary;
        fetch.fallbacks = fallbacks;
        self.orchestrator.execute(&fetch).await
    }

    /// Build a tracker for a resolved ad using this client's tracking stack.
    pub fn tracker_for(&self, ad: &ParsedAd) -> Result<Tracker> {
        self.orchestrator.tracker_for(ad)
    }

    /// Build a playback engine for a resolved ad. The engine borrows the
    /// tracker and is single-owner; drive it with `run()`.
    pub fn playback_engine<'t>(
        &self,
        tracker: &'t mut Tracker,
        time: Arc<dyn TimeSource>,
        ad: &ParsedAd,
    ) -> PlaybackEngine<'t> {
        PlaybackEngine::new(tracker, time, self.config.playback.clone(), ad)
    }

    /// Release the transport pool entries this client created.
    pub fn close(&self) {
        self.pool.shutdown();
    }
}

/// Builder composing a client from a base URL plus default params/headers.
#[derive(Default)]
pub struct VastClientBuilder {
    config: ClientConfig,
}

impl VastClientBuilder {
    pub fn source(mut self, url: impl Into<String>) -> Self {
        self.config.sources.push(url.into());
        self
    }

    pub fn fallback(mut self, url: impl Into<String>) -> Self {
        self.config.fallbacks.push(url.into());
        self
    }

    /// Default query parameter appended to every ad request.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.params.insert(key.into(), value.into());
        self
    }

    /// Default header sent with every ad request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    pub fn strategy(mut self, strategy: FetchStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn tls(mut self, tls: TlsMode) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn auto_track(mut self, enabled: bool) -> Self {
        self.config.auto_track = enabled;
        self
    }

    pub fn wrapper_depth_limit(mut self, limit: u32) -> Self {
        self.config.wrapper_depth_limit = limit;
        self
    }

    pub fn tracker_config(mut self, tracker: TrackerConfig) -> Self {
        self.config.tracker = tracker;
        self
    }

    pub fn playback_config(mut self, playback: PlaybackConfig) -> Self {
        self.config.playback = playback;
        self
    }

    pub fn build(self) -> Result<VastClient> {
        VastClient::from_config(self.config)
    }
}
