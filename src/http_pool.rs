//! Shared HTTP transport pool, keyed by TLS verification mode.
//!
//! Each distinct TLS-verify value needs a distinct TLS stack, so clients are
//! cached per `(profile, TlsMode)` key and reused for the pool's lifetime.
//! Ad requests and tracking pixels use separate profiles: tracking traffic
//! keeps connections alive much longer to survive inter-quartile gaps.

use crate::error::{Result, VastError};
use dashmap::DashMap;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// TLS verification mode for outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TlsMode {
    /// Verify against system roots (default)
    Verify,
    /// Skip certificate verification
    NoVerify,
    /// Verify against the CA bundle at this path
    CaBundle(String),
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::Verify
    }
}

/// Which traffic class a pooled client serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientProfile {
    /// VAST ad requests
    Main,
    /// Tracking pixel requests
    Tracking,
}

/// Connection-pool settings for one client profile.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    pub timeout_secs: f64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: f64,
}

impl HttpSettings {
    pub fn main_default() -> Self {
        Self {
            timeout_secs: 30.0,
            pool_max_idle_per_host: 10,
            pool_idle_timeout_secs: 90.0,
        }
    }

    /// Tracking keepalive is long enough to span quartile gaps of a typical
    /// creative, so each pixel does not pay a fresh handshake.
    pub fn tracking_default() -> Self {
        Self {
            timeout_secs: 5.0,
            pool_max_idle_per_host: 20,
            pool_idle_timeout_secs: 300.0,
        }
    }
}

/// Pool of reqwest clients keyed by `(profile, TlsMode)`.
///
/// Owned by the client facade; a process-wide [`default_pool`] exists for
/// callers that do not manage their own.
pub struct HttpPool {
    main: HttpSettings,
    tracking: HttpSettings,
    clients: DashMap<(ClientProfile, TlsMode), Client>,
}

impl HttpPool {
    pub fn new(main: HttpSettings, tracking: HttpSettings) -> Self {
        Self {
            main,
            tracking,
            clients: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HttpSettings::main_default(), HttpSettings::tracking_default())
    }

    /// Client for VAST ad requests under the given TLS mode.
    pub fn main_client(&self, tls: &TlsMode) -> Result<Client> {
        self.client_for(ClientProfile::Main, tls)
    }

    /// Client for tracking pixels under the given TLS mode.
    pub fn tracking_client(&self, tls: &TlsMode) -> Result<Client> {
        self.client_for(ClientProfile::Tracking, tls)
    }

    fn client_for(&self, profile: ClientProfile, tls: &TlsMode) -> Result<Client> {
        let key = (profile, tls.clone());
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let settings = match profile {
            ClientProfile::Main => &self.main,
            ClientProfile::Tracking => &self.tracking,
        };
        let client = build_client(settings, tls)?;
        debug!(?profile, ?tls, "HTTP client created");

        // A concurrent caller may have built the same client; the first
        // insert wins and the duplicate is dropped.
        Ok(self.clients.entry(key).or_insert(client).clone())
    }

    /// Number of distinct pooled clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop all pooled clients. Existing clones keep working until released;
    /// the next lookup builds fresh clients.
    pub fn shutdown(&self) {
        self.clients.clear();
    }
}

fn build_client(settings: &HttpSettings, tls: &TlsMode) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs_f64(settings.timeout_secs))
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs_f64(settings.pool_idle_timeout_secs));

    match tls {
        TlsMode::Verify => {}
        TlsMode::NoVerify => {
            builder = builder.danger_accept_invalid_certs(true);
        }
        TlsMode::CaBundle(path) => {
            let pem = std::fs::read(path)
                .map_err(|e| VastError::Tls(format!("failed to read CA bundle {path}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| VastError::Tls(format!("invalid CA bundle {path}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    builder.build().map_err(VastError::Http)
}

static DEFAULT_POOL: OnceLock<HttpPool> = OnceLock::new();

/// Process-wide pool for callers without an owning facade.
pub fn default_pool() -> &'static HttpPool {
    DEFAULT_POOL.get_or_init(HttpPool::with_defaults)
}
