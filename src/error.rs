use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure kinds carried in per-attempt error records.
///
/// Every failed step of the fetch/parse/select/track pipeline is tagged with
/// one of these, so callers can distinguish a dead ad server from an empty
/// one without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, TLS handshake, socket reset
    Transport,
    /// A single source exceeded its per-source budget
    TimeoutPerSource,
    /// The deadline across all sources was exceeded
    TimeoutOverall,
    /// Non-2xx response (204 excluded)
    HttpStatus,
    /// 204 No Content — "no ad available", not retried
    NoContent,
    /// The parser rejected the body
    InvalidXml,
    /// Inline ad without impression or duration
    MissingRequiredField,
    /// VAST version outside the accepted set (strict mode only)
    UnsupportedVersion,
    /// Wrapper chain hit the depth limit
    WrapperDepthExceeded,
    /// The parse filter excluded the ad
    FilterRejected,
    /// Trackable URL template is empty
    EmptyUrl,
    /// Cooperative cancellation
    Cancelled,
}

impl ErrorKind {
    /// Whether the fetcher should retry an attempt that failed this way.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::TimeoutPerSource | ErrorKind::HttpStatus
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::TimeoutPerSource => "timeout-per-source",
            ErrorKind::TimeoutOverall => "timeout-overall",
            ErrorKind::HttpStatus => "http-status",
            ErrorKind::NoContent => "no-content",
            ErrorKind::InvalidXml => "invalid-xml",
            ErrorKind::MissingRequiredField => "missing-required-field",
            ErrorKind::UnsupportedVersion => "unsupported-version",
            ErrorKind::WrapperDepthExceeded => "wrapper-depth-exceeded",
            ErrorKind::FilterRejected => "filter-rejected",
            ErrorKind::EmptyUrl => "empty-url",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase in which an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetch,
    Parse,
    Select,
    Track,
}

/// One failed attempt against one source, as surfaced in a fetch result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptError {
    pub source_url: Option<String>,
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl AttemptError {
    pub fn fetch(source: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            source_url: Some(source.into()),
            phase: Phase::Fetch,
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn parse(source: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            source_url: Some(source.into()),
            phase: Phase::Parse,
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn select(source: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            source_url: Some(source.into()),
            phase: Phase::Select,
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

/// Domain-specific error type for vastkit
#[derive(Error, Debug)]
pub enum VastError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid VAST XML: {0}")]
    InvalidXml(String),

    #[error("missing required VAST field: {0}")]
    MissingRequiredField(String),

    #[error("unsupported VAST version: {0}")]
    UnsupportedVersion(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid playback state transition: {0}")]
    PlaybackState(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VastError {
    /// Map a parse-layer error to its attempt-record kind.
    pub fn parse_kind(&self) -> ErrorKind {
        match self {
            VastError::MissingRequiredField(_) => ErrorKind::MissingRequiredField,
            VastError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            _ => ErrorKind::InvalidXml,
        }
    }
}

// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, VastError>;
