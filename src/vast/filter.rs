//! Declarative media-quality filtering of parsed ads.

use crate::vast::model::{MediaFile, ParsedAd};
use serde::{Deserialize, Serialize};

/// Predicate over a parsed ad.
///
/// Every set field must be satisfied by one and the same media file
/// (duration bounds apply to the ad itself). An absent filter accepts
/// everything; an ad with no matching media file is rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseFilter {
    /// Acceptable media types: full mimes (`video/mp4`) or top-level
    /// prefixes (`video`). Empty list = any type.
    pub media_types: Vec<String>,
    pub min_duration_secs: Option<u32>,
    pub max_duration_secs: Option<u32>,
    pub min_bitrate: Option<u32>,
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
    /// Substring required in the media file's codec attribute.
    pub codec_contains: Option<String>,
    pub delivery: Option<String>,
}

impl ParseFilter {
    pub fn accepts(&self, ad: &ParsedAd) -> bool {
        if let Some(min) = self.min_duration_secs {
            if ad.duration_secs < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration_secs {
            if ad.duration_secs > max {
                return false;
            }
        }

        if !self.has_media_constraints() {
            return true;
        }
        ad.media_files.iter().any(|file| self.media_matches(file))
    }

    fn has_media_constraints(&self) -> bool {
        !self.media_types.is_empty()
            || self.min_bitrate.is_some()
            || self.min_width.is_some()
            || self.min_height.is_some()
            || self.codec_contains.is_some()
            || self.delivery.is_some()
    }

    fn media_matches(&self, file: &MediaFile) -> bool {
        if !self.media_types.is_empty() {
            let matched = self.media_types.iter().any(|allowed| {
                file.mime_type == *allowed
                    || file
                        .mime_type
                        .strip_prefix(allowed.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            });
            if !matched {
                return false;
            }
        }
        if let Some(min) = self.min_bitrate {
            if file.bitrate.unwrap_or(0) < min {
                return false;
            }
        }
        if let Some(min) = self.min_width {
            if file.width < min {
                return false;
            }
        }
        if let Some(min) = self.min_height {
            if file.height < min {
                return false;
            }
        }
        if let Some(needle) = &self.codec_contains {
            let matched = file
                .codec
                .as_deref()
                .is_some_and(|codec| codec.contains(needle.as_str()));
            if !matched {
                return false;
            }
        }
        if let Some(delivery) = &self.delivery {
            if file.delivery != *delivery {
                return false;
            }
        }
        true
    }
}
