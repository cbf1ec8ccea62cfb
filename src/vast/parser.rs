//! Streaming VAST XML parser.
//!
//! Accepts VAST 2.0 through 4.2. Tolerant mode (the default) salvages
//! whatever parsed before a syntax error and defaults missing optional
//! fields; strict mode fails fast on any syntax error, unsupported version,
//! or an inline ad lacking both an impression and a parseable duration.

use crate::config::{ParserConfig, SortBy, SortOrder};
use crate::error::{Result, VastError};
use crate::vast::model::{MediaFile, ParsedAd};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const SUPPORTED_VERSIONS: [&str; 5] = ["2.0", "3.0", "4.0", "4.1", "4.2"];

/// Parser for VAST XML responses.
#[derive(Debug, Clone, Default)]
pub struct VastParser {
    config: ParserConfig,
}

/// Working state while walking one document.
#[derive(Default)]
struct AdBuilder {
    ad: ParsedAd,
    duration: Option<u32>,
    saw_vast: bool,
    saw_ad: bool,
}

impl VastParser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse a VAST document into a single resolved ad record.
    ///
    /// Only the first `<Ad>` is extracted; VAST pods are out of scope.
    pub fn parse(&self, xml: &str) -> Result<ParsedAd> {
        let mut reader = Reader::from_str(xml);
        let mut builder = AdBuilder::default();

        let outcome = self.walk_document(&mut reader, &mut builder);
        if let Err(e) = outcome {
            if self.config.strict || !self.config.recover_on_error {
                return Err(e);
            }
            warn!(error = %e, "VAST parse error, keeping salvaged fields");
        }

        if !builder.saw_vast {
            return Err(VastError::InvalidXml("no VAST root element".into()));
        }
        if !builder.saw_ad {
            return Err(VastError::MissingRequiredField(
                "document contains no Ad element".into(),
            ));
        }

        if self.config.strict && !builder.ad.is_wrapper() {
            if builder.ad.impressions.is_empty() {
                return Err(VastError::MissingRequiredField("Impression".into()));
            }
            if builder.duration.is_none() {
                return Err(VastError::MissingRequiredField("Linear/Duration".into()));
            }
        }

        let mut ad = builder.ad;
        ad.duration_secs = builder.duration.unwrap_or(0);
        self.apply_media_sort(&mut ad.media_files);
        self.capture_custom_paths(xml, &mut ad.extensions);

        debug!(
            version = %ad.version,
            ad_system = %ad.ad_system,
            impressions = ad.impressions.len(),
            media_files = ad.media_files.len(),
            tracking_events = ad.tracking_events.len(),
            duration = ad.duration_secs,
            wrapper = ad.is_wrapper(),
            "VAST parsed"
        );
        Ok(ad)
    }

    fn walk_document(&self, reader: &mut Reader<&[u8]>, builder: &mut AdBuilder) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"VAST" => {
                    builder.saw_vast = true;
                    builder.ad.version = get_attr(e, "version").unwrap_or_default();
                    self.check_version(&builder.ad.version)?;
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Ad" => {
                    if builder.saw_ad {
                        // Only the first ad of a pod is resolved
                        skip_element(reader, "Ad")?;
                        continue;
                    }
                    if builder.ad.creative_id.is_empty() {
                        builder.ad.creative_id = get_attr(e, "id").unwrap_or_default();
                    }
                    self.parse_ad(reader, builder)?;
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML syntax error: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_version(&self, version: &str) -> Result<()> {
        if version.is_empty() || SUPPORTED_VERSIONS.contains(&version) {
            return Ok(());
        }
        if self.config.strict {
            return Err(VastError::UnsupportedVersion(version.to_string()));
        }
        warn!(version, "VAST version outside supported set, parsing anyway");
        Ok(())
    }

    /// Parse a single `<Ad>` element (InLine or Wrapper)
    fn parse_ad(&self, reader: &mut Reader<&[u8]>, builder: &mut AdBuilder) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"InLine" => {
                    builder.saw_ad = true;
                    self.parse_inline(reader, builder)?;
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Wrapper" => {
                    builder.saw_ad = true;
                    self.parse_wrapper(reader, builder)?;
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Ad" => return Ok(()),
                Ok(Event::Eof) => return Ok(()),
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in Ad: {e}")));
                }
                _ => {}
            }
        }
    }

    /// Parse `<InLine>` content into the builder
    fn parse_inline(&self, reader: &mut Reader<&[u8]>, builder: &mut AdBuilder) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"AdSystem" => {
                    builder.ad.ad_system = read_text(reader, "AdSystem")?;
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"AdTitle" => {
                    builder.ad.ad_title = read_text(reader, "AdTitle")?;
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Impression" => {
                    let url = read_text(reader, "Impression")?;
                    if !url.is_empty() {
                        builder.ad.impressions.push(url);
                    }
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Error" => {
                    let url = read_text(reader, "Error")?;
                    if !url.is_empty() {
                        builder.ad.error_urls.push(url);
                    }
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Creatives" => {
                    self.parse_creatives(reader, builder)?;
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Extensions" => {
                    self.parse_extensions(reader, &mut builder.ad.extensions)?;
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"InLine" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in InLine: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parse `<Wrapper>` content into the builder
    fn parse_wrapper(&self, reader: &mut Reader<&[u8]>, builder: &mut AdBuilder) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"VASTAdTagURI" => {
                    let uri = read_text(reader, "VASTAdTagURI")?;
                    if !uri.is_empty() {
                        builder.ad.wrapper_uri = Some(uri);
                    }
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"AdSystem" => {
                    builder.ad.ad_system = read_text(reader, "AdSystem")?;
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Impression" => {
                    let url = read_text(reader, "Impression")?;
                    if !url.is_empty() {
                        builder.ad.impressions.push(url);
                    }
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Error" => {
                    let url = read_text(reader, "Error")?;
                    if !url.is_empty() {
                        builder.ad.error_urls.push(url);
                    }
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"TrackingEvents" => {
                    self.parse_tracking_events(reader, &mut builder.ad.tracking_events)?;
                }
                // Wrapper tracking often nests under Creatives/Creative/Linear
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Creatives" => {
                    self.parse_creatives(reader, builder)?;
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Wrapper" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in Wrapper: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parse `<Creatives>`, taking the first creative that has a Linear
    fn parse_creatives(&self, reader: &mut Reader<&[u8]>, builder: &mut AdBuilder) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Creative" => {
                    let id = get_attr(e, "id")
                        .or_else(|| get_attr(e, "adId"))
                        .unwrap_or_default();
                    let had_linear = builder.duration.is_some() || !builder.ad.media_files.is_empty();
                    self.parse_creative(reader, builder)?;
                    let has_linear = builder.duration.is_some() || !builder.ad.media_files.is_empty();
                    if !had_linear && has_linear && !id.is_empty() {
                        builder.ad.creative_id = id;
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Creatives" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in Creatives: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_creative(&self, reader: &mut Reader<&[u8]>, builder: &mut AdBuilder) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Linear" => {
                    if builder.duration.is_some() || !builder.ad.media_files.is_empty() {
                        // At most one linear creative per resolved ad
                        skip_element(reader, "Linear")?;
                    } else {
                        self.parse_linear(reader, builder)?;
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Creative" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in Creative: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_linear(&self, reader: &mut Reader<&[u8]>, builder: &mut AdBuilder) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Duration" => {
                    let text = read_text(reader, "Duration")?;
                    match parse_duration(&text) {
                        Some(secs) => builder.duration = Some(secs),
                        None => warn!(duration = %text, "unparseable VAST duration"),
                    }
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"MediaFiles" => {
                    self.parse_media_files(reader, &mut builder.ad.media_files)?;
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"TrackingEvents" => {
                    self.parse_tracking_events(reader, &mut builder.ad.tracking_events)?;
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Linear" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in Linear: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_media_files(
        &self,
        reader: &mut Reader<&[u8]>,
        files: &mut Vec<MediaFile>,
    ) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"MediaFile" => {
                    let delivery = get_attr(e, "delivery").unwrap_or_default();
                    let mime_type = get_attr(e, "type").unwrap_or_default();
                    let width = get_attr(e, "width")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let height = get_attr(e, "height")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let bitrate = get_attr(e, "bitrate").and_then(|s| s.parse().ok());
                    let codec = get_attr(e, "codec");

                    let url = read_text(reader, "MediaFile")?;
                    if !url.is_empty() {
                        files.push(MediaFile {
                            url,
                            mime_type,
                            width,
                            height,
                            bitrate,
                            codec,
                            delivery,
                        });
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"MediaFiles" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in MediaFiles: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_tracking_events(
        &self,
        reader: &mut Reader<&[u8]>,
        events: &mut BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Tracking" => {
                    let event = get_attr(e, "event").unwrap_or_default();
                    let offset = get_attr(e, "offset");
                    let url = read_text(reader, "Tracking")?;
                    if event.is_empty() || url.is_empty() {
                        continue;
                    }
                    let key = tracking_key(&event, offset.as_deref());
                    match key {
                        Some(key) => events.entry(key).or_default().push(url),
                        None => warn!(event, ?offset, "skipping tracking event with bad offset"),
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"TrackingEvents" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!(
                        "XML error in TrackingEvents: {e}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parse `<Extensions>`: each `<Extension type="x">` is captured as its
    /// flattened text content under its type attribute.
    fn parse_extensions(
        &self,
        reader: &mut Reader<&[u8]>,
        extensions: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let mut current: Option<String> = None;
        let mut text = String::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"Extension" => {
                    current = get_attr(e, "type");
                    text.clear();
                }
                Ok(Event::Text(e)) => {
                    if current.is_some() {
                        text.push_str(e.unescape().unwrap_or_default().trim());
                    }
                }
                Ok(Event::CData(e)) => {
                    if current.is_some() {
                        text.push_str(std::str::from_utf8(&e).unwrap_or_default().trim());
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Extension" => {
                    if let Some(name) = current.take() {
                        extensions.insert(name, std::mem::take(&mut text));
                    }
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"Extensions" => break,
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(VastError::InvalidXml(format!("XML error in Extensions: {e}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_media_sort(&self, files: &mut Vec<MediaFile>) {
        let Some(sort) = &self.config.media_sort else {
            return;
        };
        let key = |file: &MediaFile| -> u64 {
            match sort.sort_by {
                SortBy::Bitrate => file.bitrate.unwrap_or(0) as u64,
                SortBy::Width => file.width as u64,
                SortBy::Height => file.height as u64,
            }
        };
        // Stable sort keeps document order for ties
        match sort.order {
            SortOrder::Ascending => files.sort_by_key(key),
            SortOrder::Descending => files.sort_by_key(|f| std::cmp::Reverse(key(f))),
        }
        if let Some(limit) = sort.limit {
            files.truncate(limit);
        }
    }

    /// Second pass collecting caller-supplied element names into extensions.
    fn capture_custom_paths(&self, xml: &str, extensions: &mut BTreeMap<String, String>) {
        if self.config.custom_paths.is_empty() {
            return;
        }
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let matched: Vec<String> = self
                        .config
                        .custom_paths
                        .iter()
                        .filter(|(_, element)| **element == tag)
                        .map(|(name, _)| name.clone())
                        .collect();
                    if matched.is_empty() {
                        continue;
                    }
                    if let Ok(text) = read_text(&mut reader, &tag) {
                        for name in matched {
                            extensions.entry(name).or_insert_with(|| text.clone());
                        }
                    }
                }
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
        }
    }
}

/// Build the registry key for a tracking event: lowercased name, with
/// `progress` events keyed by their signed offset in seconds.
fn tracking_key(event: &str, offset: Option<&str>) -> Option<String> {
    let name = event.to_ascii_lowercase();
    if name != "progress" {
        return Some(name);
    }
    let offset = offset?;
    let secs = parse_offset(offset)?;
    Some(format!("progress-{secs}"))
}

/// Parse VAST duration `HH:MM:SS` or `HH:MM:SS.mmm` into whole seconds,
/// rounding half to even.
pub fn parse_duration(text: &str) -> Option<u32> {
    let secs = parse_clock(text.trim())?;
    if secs < 0.0 {
        return None;
    }
    Some(secs.round_ties_even() as u32)
}

/// Parse a tracking offset: clock format or plain signed seconds.
fn parse_offset(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let secs = if body.contains(':') {
        parse_clock(body)?
    } else {
        body.parse::<f64>().ok()?
    };
    let rounded = secs.round_ties_even() as i64;
    Some(if negative { -rounded } else { rounded })
}

fn parse_clock(text: &str) -> Option<f64> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Read text content from the current element, handling CDATA
fn read_text(reader: &mut Reader<&[u8]>, end_tag: &str) -> Result<String> {
    let mut text = String::new();
    let end_tag_bytes = end_tag.as_bytes();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                text.push_str(&e.unescape().unwrap_or_default());
            }
            Ok(Event::CData(e)) => {
                text.push_str(std::str::from_utf8(&e).unwrap_or_default());
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == end_tag_bytes => break,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(VastError::InvalidXml(format!("XML read error: {e}")));
            }
            _ => {}
        }
    }

    Ok(text.trim().to_string())
}

/// Skip the remainder of the current element
fn skip_element(reader: &mut Reader<&[u8]>, end_tag: &str) -> Result<()> {
    let end_tag_bytes = end_tag.as_bytes();
    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == end_tag_bytes => depth += 1,
            Ok(Event::End(ref e)) if e.name().as_ref() == end_tag_bytes => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            Ok(Event::Eof) => return Ok(()),
            Err(e) => {
                return Err(VastError::InvalidXml(format!("XML error skipping {end_tag}: {e}")));
            }
            _ => {}
        }
    }
}

/// Get attribute value from an XML element
fn get_attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| String::from_utf8(a.value.to_vec()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaSort;

    const VAST_INLINE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="4.0">
  <Ad id="ad-001">
    <InLine>
      <AdSystem>Test Adserver</AdSystem>
      <AdTitle>Test Ad</AdTitle>
      <Impression>https://t.example/i</Impression>
      <Error><![CDATA[https://t.example/error?code=[ERRORCODE]]]></Error>
      <Creatives>
        <Creative id="creative-001">
          <Linear>
            <Duration>00:00:30</Duration>
            <TrackingEvents>
              <Tracking event="start">https://t.example/start</Tracking>
              <Tracking event="firstQuartile">https://t.example/q1</Tracking>
              <Tracking event="midpoint">https://t.example/mid</Tracking>
              <Tracking event="thirdQuartile">https://t.example/q3</Tracking>
              <Tracking event="complete">https://t.example/complete</Tracking>
              <Tracking event="progress" offset="00:00:05">https://t.example/p5</Tracking>
              <Tracking event="progress" offset="-5">https://t.example/pm5</Tracking>
            </TrackingEvents>
            <MediaFiles>
              <MediaFile delivery="progressive" type="video/mp4" width="1280" height="720" bitrate="2000" codec="H.264">
                https://cdn.example/ad-720.mp4
              </MediaFile>
              <MediaFile delivery="progressive" type="video/mp4" width="640" height="360" bitrate="800">
                <![CDATA[https://cdn.example/ad-360.mp4]]>
              </MediaFile>
            </MediaFiles>
          </Linear>
        </Creative>
      </Creatives>
    </InLine>
  </Ad>
</VAST>"#;

    const VAST_WRAPPER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<VAST version="3.0">
  <Ad id="wrapper-001">
    <Wrapper>
      <AdSystem>Wrapper Exchange</AdSystem>
      <VASTAdTagURI><![CDATA[https://exchange.example/vast?auction=1]]></VASTAdTagURI>
      <Impression>https://t.example/wrapper-imp</Impression>
      <TrackingEvents>
        <Tracking event="start">https://t.example/wrapper-start</Tracking>
      </TrackingEvents>
    </Wrapper>
  </Ad>
</VAST>"#;

    fn parser() -> VastParser {
        VastParser::new(ParserConfig::default())
    }

    fn strict_parser() -> VastParser {
        VastParser::new(ParserConfig {
            strict: true,
            ..Default::default()
        })
    }

    #[test]
    fn parses_inline_ad() {
        let ad = parser().parse(VAST_INLINE).unwrap();
        assert_eq!(ad.version, "4.0");
        assert_eq!(ad.ad_system, "Test Adserver");
        assert_eq!(ad.ad_title, "Test Ad");
        assert_eq!(ad.creative_id, "creative-001");
        assert_eq!(ad.duration_secs, 30);
        assert_eq!(ad.impressions, vec!["https://t.example/i"]);
        assert_eq!(ad.error_urls.len(), 1);
        assert!(!ad.is_wrapper());

        assert_eq!(ad.media_files.len(), 2);
        assert_eq!(ad.media_files[0].url, "https://cdn.example/ad-720.mp4");
        assert_eq!(ad.media_files[0].bitrate, Some(2000));
        assert_eq!(ad.media_files[0].codec.as_deref(), Some("H.264"));
        assert_eq!(ad.media_files[1].width, 640);
    }

    #[test]
    fn tracking_keys_are_lowercased_with_progress_offsets() {
        let ad = parser().parse(VAST_INLINE).unwrap();
        assert!(ad.tracking_events.contains_key("firstquartile"));
        assert!(ad.tracking_events.contains_key("thirdquartile"));
        assert_eq!(ad.tracking_events["progress-5"], vec!["https://t.example/p5"]);
        assert_eq!(ad.tracking_events["progress--5"], vec!["https://t.example/pm5"]);
    }

    #[test]
    fn parses_wrapper_ad() {
        let ad = parser().parse(VAST_WRAPPER).unwrap();
        assert!(ad.is_wrapper());
        assert_eq!(
            ad.wrapper_uri.as_deref(),
            Some("https://exchange.example/vast?auction=1")
        );
        assert_eq!(ad.impressions, vec!["https://t.example/wrapper-imp"]);
        assert_eq!(ad.tracking_events["start"], vec!["https://t.example/wrapper-start"]);
    }

    #[test]
    fn garbage_body_is_invalid_xml() {
        let err = parser().parse("not xml at all").unwrap_err();
        assert!(matches!(err, VastError::InvalidXml(_)));
    }

    #[test]
    fn empty_vast_is_missing_ad() {
        let err = parser().parse("<VAST version=\"3.0\"></VAST>").unwrap_err();
        assert!(matches!(err, VastError::MissingRequiredField(_)));
    }

    #[test]
    fn strict_requires_impression_and_duration() {
        let xml = r#"<VAST version="3.0"><Ad><InLine>
            <AdSystem>x</AdSystem>
            <Creatives><Creative><Linear>
              <Duration>00:00:10</Duration>
            </Linear></Creative></Creatives>
        </InLine></Ad></VAST>"#;
        let err = strict_parser().parse(xml).unwrap_err();
        assert!(matches!(err, VastError::MissingRequiredField(_)));
        // Tolerant mode accepts it
        let ad = parser().parse(xml).unwrap();
        assert_eq!(ad.duration_secs, 10);
    }

    #[test]
    fn strict_rejects_unsupported_version() {
        let xml = r#"<VAST version="1.0"><Ad><Wrapper><VASTAdTagURI>https://x/v</VASTAdTagURI></Wrapper></Ad></VAST>"#;
        let err = strict_parser().parse(xml).unwrap_err();
        assert!(matches!(err, VastError::UnsupportedVersion(_)));
        assert!(parser().parse(xml).is_ok());
    }

    #[test]
    fn tolerant_salvages_truncated_document() {
        let truncated = &VAST_INLINE[..VAST_INLINE.find("<MediaFiles>").unwrap()];
        let ad = parser().parse(truncated).unwrap();
        assert_eq!(ad.impressions, vec!["https://t.example/i"]);
        assert_eq!(ad.duration_secs, 30);
        assert!(ad.media_files.is_empty());
    }

    #[test]
    fn duration_rounds_half_to_even() {
        assert_eq!(parse_duration("00:00:15"), Some(15));
        assert_eq!(parse_duration("00:00:10.500"), Some(10));
        assert_eq!(parse_duration("00:00:11.500"), Some(12));
        assert_eq!(parse_duration("00:00:10.501"), Some(11));
        assert_eq!(parse_duration("01:02:03"), Some(3723));
        assert_eq!(parse_duration("bogus"), None);
        assert_eq!(parse_duration("00:15"), None);
    }

    #[test]
    fn second_creative_is_ignored() {
        let xml = r#"<VAST version="3.0"><Ad><InLine>
          <Impression>https://t/i</Impression>
          <Creatives>
            <Creative id="a"><Linear><Duration>00:00:10</Duration></Linear></Creative>
            <Creative id="b"><Linear><Duration>00:00:20</Duration></Linear></Creative>
          </Creatives>
        </InLine></Ad></VAST>"#;
        let ad = parser().parse(xml).unwrap();
        assert_eq!(ad.creative_id, "a");
        assert_eq!(ad.duration_secs, 10);
    }

    #[test]
    fn media_sort_descending_bitrate_with_limit() {
        let parser = VastParser::new(ParserConfig {
            media_sort: Some(MediaSort {
                sort_by: SortBy::Bitrate,
                order: SortOrder::Descending,
                limit: Some(1),
            }),
            ..Default::default()
        });
        let ad = parser.parse(VAST_INLINE).unwrap();
        assert_eq!(ad.media_files.len(), 1);
        assert_eq!(ad.media_files[0].bitrate, Some(2000));
    }

    #[test]
    fn custom_paths_land_in_extensions() {
        let parser = VastParser::new(ParserConfig {
            custom_paths: [("title".to_string(), "AdTitle".to_string())].into(),
            ..Default::default()
        });
        let ad = parser.parse(VAST_INLINE).unwrap();
        assert_eq!(ad.extensions.get("title").map(String::as_str), Some("Test Ad"));
    }

    #[test]
    fn extensions_element_is_captured() {
        let xml = r#"<VAST version="3.0"><Ad><InLine>
          <Impression>https://t/i</Impression>
          <Extensions>
            <Extension type="waterfall"><![CDATA[tier-2]]></Extension>
          </Extensions>
          <Creatives><Creative><Linear><Duration>00:00:10</Duration></Linear></Creative></Creatives>
        </InLine></Ad></VAST>"#;
        let ad = parser().parse(xml).unwrap();
        assert_eq!(ad.extensions.get("waterfall").map(String::as_str), Some("tier-2"));
    }
}
