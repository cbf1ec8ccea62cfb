//! Typed configuration for every subsystem.
//!
//! All structs deserialize from partial JSON (every field has a default) so
//! the resolver can merge untyped override layers and produce a
//! [`ClientConfig`] in one step.

use crate::error::{Result, VastError};
use crate::http_pool::{HttpSettings, TlsMode};
use crate::macros::{default_formats, MacroFormat, MacroMap};
use crate::vast::filter::ParseFilter;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// Fetch execution mode across a source list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Fetch all sources concurrently, first success wins
    #[default]
    Parallel,
    /// Try sources one by one in list order
    Sequential,
    /// First completion wins, the rest are cancelled
    Race,
}

/// Strategy settings for a multi-source fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchStrategy {
    pub mode: FetchMode,
    pub per_source_timeout_secs: f64,
    /// Hard deadline across all sources; `None` disables it.
    pub overall_timeout_secs: Option<f64>,
    /// Retry attempts per source after the first try.
    pub retries: u32,
    pub backoff_base_secs: f64,
    pub backoff_multiplier: f64,
}

impl Default for FetchStrategy {
    fn default() -> Self {
        Self {
            mode: FetchMode::Parallel,
            per_source_timeout_secs: 10.0,
            overall_timeout_secs: Some(30.0),
            retries: 2,
            backoff_base_secs: 1.0,
            backoff_multiplier: 2.0,
        }
    }
}

impl FetchStrategy {
    /// Delay before retry number `attempt` (1-based): base · multiplier^(attempt-1).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let secs = self.backoff_base_secs * self.backoff_multiplier.powi(exp as i32);
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_source_timeout_secs <= 0.0 {
            return Err(VastError::Config(format!(
                "per_source_timeout_secs must be positive, got {}",
                self.per_source_timeout_secs
            )));
        }
        if let Some(overall) = self.overall_timeout_secs {
            if overall <= 0.0 {
                return Err(VastError::Config(format!(
                    "overall_timeout_secs must be positive, got {overall}"
                )));
            }
        }
        if self.backoff_multiplier < 1.0 {
            return Err(VastError::Config(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.backoff_base_secs < 0.0 {
            return Err(VastError::Config(format!(
                "backoff_base_secs must be >= 0, got {}",
                self.backoff_base_secs
            )));
        }
        Ok(())
    }
}

/// One multi-source fetch operation: sources, fallbacks, strategy, and
/// request composition. Single-source requests are `sources = [url]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub sources: Vec<String>,
    pub fallbacks: Vec<String>,
    pub strategy: FetchStrategy,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub parse_filter: Option<ParseFilter>,
    pub auto_track: bool,
    pub wrapper_depth_limit: u32,
}

impl FetchConfig {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            auto_track: true,
            wrapper_depth_limit: 5,
            ..Default::default()
        }
    }

    pub fn single(url: impl Into<String>) -> Self {
        Self::new(vec![url.into()])
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_filter(mut self, filter: ParseFilter) -> Self {
        self.parse_filter = Some(filter);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(VastError::Config("sources list must not be empty".into()));
        }
        self.strategy.validate()
    }
}

/// Media-file ordering requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Bitrate,
    Width,
    Height,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSort {
    pub sort_by: SortBy,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Parser behavior toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Fail fast on any XML syntax error or missing required field.
    pub strict: bool,
    /// In tolerant mode, salvage whatever parsed before a mid-document error.
    pub recover_on_error: bool,
    /// Extra element names to capture into `ParsedAd::extensions`,
    /// keyed by the extension name to store them under.
    pub custom_paths: BTreeMap<String, String>,
    /// Optional re-ordering/truncation of the media file list.
    pub media_sort: Option<MediaSort>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            strict: false,
            recover_on_error: true,
            custom_paths: BTreeMap::new(),
            media_sort: None,
        }
    }
}

/// Tracker behavior: macro formats, retry policy, firing mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Substitution patterns in application order.
    pub macro_formats: Vec<MacroFormat>,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub backoff_multiplier: f64,
    /// Fire all URLs of an event concurrently instead of in registry order.
    pub parallel_tracking: bool,
    pub timeout_secs: f64,
    /// Macros fixed for the tracker's lifetime (lowest precedence).
    pub static_macros: MacroMap,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            macro_formats: default_formats(),
            max_retries: 3,
            retry_delay_secs: 1.0,
            backoff_multiplier: 2.0,
            parallel_tracking: false,
            timeout_secs: 5.0,
            static_macros: MacroMap::new(),
        }
    }
}

impl TrackerConfig {
    /// Delay before retry number `k` (0-based): delay · multiplier^k.
    pub fn retry_backoff(&self, k: u32) -> Duration {
        let secs = self.retry_delay_secs * self.backoff_multiplier.powi(k as i32);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Playback scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Wall-clock playback
    Real,
    /// Virtual-time playback
    Headless,
    /// Pick from the supplied time source
    #[default]
    Auto,
}

/// Stochastic interruption rule for one event type (virtual playback only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionRule {
    /// Probability in [0, 1] that the due event is replaced by an interruption.
    pub probability: f64,
    /// Offset jitter `[lo, hi]` added to the event boundary, in seconds.
    #[serde(default)]
    pub jitter: (f64, f64),
}

/// Playback engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub mode: PlaybackMode,
    /// Tick interval for wall-clock playback.
    pub tick_interval_secs: f64,
    /// Tick interval for virtual playback.
    pub headless_tick_interval_secs: f64,
    /// Abort sessions running longer than this; `None` disables the cap.
    pub max_session_duration_secs: Option<f64>,
    /// Slack when matching quartile boundaries to tick offsets.
    pub quartile_tolerance_secs: f64,
    /// Event type → interruption rule, consulted each tick in virtual mode.
    pub interruption_rules: BTreeMap<String, InterruptionRule>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mode: PlaybackMode::Auto,
            tick_interval_secs: 1.0,
            headless_tick_interval_secs: 0.1,
            max_session_duration_secs: None,
            quartile_tolerance_secs: 0.0,
            interruption_rules: BTreeMap::new(),
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs <= 0.0 || self.headless_tick_interval_secs <= 0.0 {
            return Err(VastError::Config("tick intervals must be positive".into()));
        }
        if let Some(max) = self.max_session_duration_secs {
            if max <= 0.0 {
                return Err(VastError::Config(format!(
                    "max_session_duration_secs must be positive, got {max}"
                )));
            }
        }
        if self.quartile_tolerance_secs < 0.0 {
            return Err(VastError::Config("quartile_tolerance_secs must be >= 0".into()));
        }
        for (event, rule) in &self.interruption_rules {
            if !(0.0..=1.0).contains(&rule.probability) {
                return Err(VastError::Config(format!(
                    "interruption probability for '{event}' must be in [0, 1], got {}",
                    rule.probability
                )));
            }
            if rule.jitter.1 < rule.jitter.0 {
                return Err(VastError::Config(format!(
                    "interruption jitter for '{event}' must have lo <= hi"
                )));
            }
        }
        Ok(())
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub sources: Vec<String>,
    pub fallbacks: Vec<String>,
    pub strategy: FetchStrategy,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub auto_track: bool,
    pub wrapper_depth_limit: u32,
    #[serde(
        serialize_with = "serialize_tls",
        deserialize_with = "deserialize_tls"
    )]
    pub tls: TlsMode,
    pub http_main: HttpSettingsConfig,
    pub http_tracking: HttpSettingsConfig,
    pub parser: ParserConfig,
    pub tracker: TrackerConfig,
    pub playback: PlaybackConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            fallbacks: Vec::new(),
            strategy: FetchStrategy::default(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            auto_track: true,
            wrapper_depth_limit: 5,
            tls: TlsMode::Verify,
            http_main: HttpSettingsConfig::default(),
            http_tracking: HttpSettingsConfig::tracking_default(),
            parser: ParserConfig::default(),
            tracker: TrackerConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            sources: vec![url.into()],
            ..Default::default()
        }
    }

    /// Build the per-call fetch config from the resolved client settings.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            sources: self.sources.clone(),
            fallbacks: self.fallbacks.clone(),
            strategy: self.strategy.clone(),
            params: self.params.clone(),
            headers: self.headers.clone(),
            parse_filter: None,
            auto_track: self.auto_track,
            wrapper_depth_limit: self.wrapper_depth_limit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.sources.is_empty() {
            self.strategy.validate()?;
        }
        if self.tracker.backoff_multiplier < 1.0 {
            return Err(VastError::Config(format!(
                "tracker backoff_multiplier must be >= 1, got {}",
                self.tracker.backoff_multiplier
            )));
        }
        if self.tracker.timeout_secs <= 0.0 {
            return Err(VastError::Config("tracker timeout_secs must be positive".into()));
        }
        if self.http_main.timeout_secs <= 0.0 || self.http_tracking.timeout_secs <= 0.0 {
            return Err(VastError::Config("HTTP timeouts must be positive".into()));
        }
        self.playback.validate()
    }
}

/// Serializable mirror of [`HttpSettings`] with its own defaults per profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettingsConfig {
    pub timeout_secs: f64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: f64,
}

impl Default for HttpSettingsConfig {
    fn default() -> Self {
        let s = HttpSettings::main_default();
        Self {
            timeout_secs: s.timeout_secs,
            pool_max_idle_per_host: s.pool_max_idle_per_host,
            pool_idle_timeout_secs: s.pool_idle_timeout_secs,
        }
    }
}

impl HttpSettingsConfig {
    pub fn tracking_default() -> Self {
        let s = HttpSettings::tracking_default();
        Self {
            timeout_secs: s.timeout_secs,
            pool_max_idle_per_host: s.pool_max_idle_per_host,
            pool_idle_timeout_secs: s.pool_idle_timeout_secs,
        }
    }

    pub fn to_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout_secs: self.timeout_secs,
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            pool_idle_timeout_secs: self.pool_idle_timeout_secs,
        }
    }
}

// TLS mode reads as `true` (verify), `false` (disable), or a CA-bundle path.
fn serialize_tls<S: Serializer>(tls: &TlsMode, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match tls {
        TlsMode::Verify => serializer.serialize_bool(true),
        TlsMode::NoVerify => serializer.serialize_bool(false),
        TlsMode::CaBundle(path) => serializer.serialize_str(path),
    }
}

fn deserialize_tls<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<TlsMode, D::Error> {
    use serde::de::Error;
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Bool(true) => Ok(TlsMode::Verify),
        serde_json::Value::Bool(false) => Ok(TlsMode::NoVerify),
        serde_json::Value::String(path) => Ok(TlsMode::CaBundle(path)),
        other => Err(D::Error::custom(format!(
            "TLS mode must be a bool or a CA bundle path, got {other}"
        ))),
    }
}
