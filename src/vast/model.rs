use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single media file for an ad creative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub url: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: Option<u32>,
    pub codec: Option<String>,
    pub delivery: String,
}

/// One resolved ad from a VAST response.
///
/// A wrapper parse carries `wrapper_uri` and its impression/tracking lists;
/// the orchestrator folds those into the eventual inline ad while resolving
/// the chain. Media files keep document order, which the filter uses as its
/// tie-break.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedAd {
    pub version: String,
    pub ad_system: String,
    pub ad_title: String,
    pub creative_id: String,
    /// Declared linear duration in whole seconds (half-to-even rounded)
    pub duration_secs: u32,
    pub media_files: Vec<MediaFile>,
    pub impressions: Vec<String>,
    pub error_urls: Vec<String>,
    /// Event key (lowercased; `progress-N` for offset events) → URLs in
    /// document order
    pub tracking_events: BTreeMap<String, Vec<String>>,
    pub extensions: BTreeMap<String, String>,
    pub wrapper_uri: Option<String>,
    /// Set when a wrapper chain could not be resolved to an inline ad
    pub wrapper_resolution_failed: bool,
}

impl ParsedAd {
    pub fn is_wrapper(&self) -> bool {
        self.wrapper_uri.as_deref().is_some_and(|uri| !uri.is_empty())
    }

    /// Prepend another ad's impression and tracking URLs (used when folding
    /// a wrapper level into the ad below it, outermost first).
    pub fn absorb_outer(&mut self, outer: &ParsedAd) {
        let mut impressions = outer.impressions.clone();
        impressions.extend(std::mem::take(&mut self.impressions));
        self.impressions = impressions;

        for (event, urls) in &outer.tracking_events {
            let inner = self.tracking_events.remove(event).unwrap_or_default();
            let mut merged = urls.clone();
            merged.extend(inner);
            self.tracking_events.insert(event.clone(), merged);
        }

        let mut errors = outer.error_urls.clone();
        errors.extend(std::mem::take(&mut self.error_urls));
        self.error_urls = errors;
    }
}
