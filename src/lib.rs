//! vastkit — async VAST ad client.
//!
//! Fetches VAST XML from one or more ad servers under a configurable
//! strategy (parallel, sequential, race) with fallback cascades, parses it
//! tolerantly across VAST 2.0–4.2, resolves wrapper chains, filters
//! candidates by media quality, fires tracking pixels with macro
//! substitution, and can drive playback sessions against real or virtual
//! time.

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http_pool;
pub mod macros;
pub mod metrics;
pub mod playback;
pub mod resolver;
pub mod time;
pub mod track;
pub mod vast;

pub use client::{VastClient, VastClientBuilder};
pub use config::{ClientConfig, FetchConfig, FetchMode, FetchStrategy};
pub use error::{AttemptError, ErrorKind, Phase, Result, VastError};
pub use fetch::{FetchResult, Orchestrator};
pub use http_pool::{HttpPool, TlsMode};
pub use playback::{PlaybackControl, PlaybackEngine, PlaybackSession, PlaybackState};
pub use resolver::ConfigResolver;
pub use time::{RealTimeSource, TimeSource, VirtualTimeSource};
pub use track::{TrackResult, Tracker};
pub use vast::{MediaFile, ParseFilter, ParsedAd, VastParser};
