//! Tolerant parser for the disaster alert Atom/RSS feed.
//!
//! The upstream document is not reliably schema-conformant. The parser
//! streams through it with `quick-xml`, collects the fields it cares about
//! for each entry independently, and drops only the entries that lack a
//! title or an id.

use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use super::error::{ParseError, PartialRecordError};
use super::policy::SeverityPolicy;
use super::types::{AlertRecord, ParsedField, Severity, DEFAULT_AREA};
use super::util::{clean_text, cleanup_xml, decode_entities, parse_date, truncate_chars};
use crate::TARGET_FEED;

/// Most recent entries kept from a single document.
pub const MAX_XML_RECORDS: usize = 10;
const MAX_SUMMARY_CHARS: usize = 200;

/// Which tag vocabulary the document uses. Chosen once per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedShape {
    Atom,
    Rss,
}

impl FeedShape {
    fn from_root(name: &[u8]) -> Option<Self> {
        if name.eq_ignore_ascii_case(b"feed") {
            Some(FeedShape::Atom)
        } else if name.eq_ignore_ascii_case(b"rss")
            || name.eq_ignore_ascii_case(b"rdf")
            || name.eq_ignore_ascii_case(b"channel")
        {
            Some(FeedShape::Rss)
        } else {
            None
        }
    }

    fn record_tag(&self) -> &'static [u8] {
        match self {
            FeedShape::Atom => b"entry",
            FeedShape::Rss => b"item",
        }
    }

    fn field_for(&self, name: &[u8]) -> Option<Field> {
        let is = |tag: &str| name.eq_ignore_ascii_case(tag.as_bytes());

        // CAP extension elements appear in either shape.
        if is("severity") {
            return Some(Field::Severity);
        }
        if is("areaDesc") {
            return Some(Field::Area);
        }
        if is("effective") || is("onset") {
            return Some(Field::ValidFrom);
        }
        if is("title") {
            return Some(Field::Title);
        }

        match self {
            FeedShape::Atom => {
                if is("summary") || is("content") {
                    Some(Field::Summary)
                } else if is("id") {
                    Some(Field::Id)
                } else if is("published") || is("updated") || is("sent") {
                    Some(Field::Published)
                } else {
                    None
                }
            }
            FeedShape::Rss => {
                if is("description") {
                    Some(Field::Summary)
                } else if is("guid") {
                    Some(Field::Id)
                } else if is("link") {
                    Some(Field::Link)
                } else if is("pubDate") || is("date") || is("sent") {
                    Some(Field::Published)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Summary,
    Id,
    Link,
    Severity,
    Area,
    Published,
    ValidFrom,
}

impl Field {
    /// CAP fields are collected wherever they sit inside an entry, even
    /// nested within another field such as an embedded `<content>` alert.
    fn is_cap(&self) -> bool {
        matches!(self, Field::Severity | Field::Area | Field::ValidFrom)
    }
}

#[derive(Debug, Default)]
struct RawEntry {
    title: Option<String>,
    summary: Option<String>,
    id: Option<String>,
    link: Option<String>,
    severity: Option<String>,
    area: Option<String>,
    published: Option<String>,
    valid_from: Option<String>,
}

impl RawEntry {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Title => &mut self.title,
            Field::Summary => &mut self.summary,
            Field::Id => &mut self.id,
            Field::Link => &mut self.link,
            Field::Severity => &mut self.severity,
            Field::Area => &mut self.area,
            Field::Published => &mut self.published,
            Field::ValidFrom => &mut self.valid_from,
        }
    }
}

/// Text being collected for one field of the current entry.
struct Capture {
    field: Field,
    depth: usize,
    text: String,
}

/// Result of parsing one document.
#[derive(Debug)]
pub struct ParsedFeed {
    pub shape: FeedShape,
    pub records: Vec<AlertRecord>,
    pub skipped: Vec<PartialRecordError>,
}

/// Parse an Atom or RSS alert document.
pub fn parse_alert_xml(
    body: &str,
    source_label: &str,
    severity: &SeverityPolicy,
) -> Result<ParsedFeed, ParseError> {
    let cleaned = cleanup_xml(body);
    let mut reader = Reader::from_str(&cleaned);
    reader.trim_text(true);
    reader.check_end_names(false);

    let fetched_at = Utc::now();
    let mut shape: Option<FeedShape> = None;
    let mut depth = 0usize;
    let mut entry: Option<(usize, RawEntry)> = None;
    let mut captures: Vec<Capture> = Vec::new();
    let mut records = Vec::new();
    let mut skipped = Vec::new();
    let mut seen = 0usize;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(err) => {
                if shape.is_some() && (!records.is_empty() || !skipped.is_empty()) {
                    warn!(
                        target: TARGET_FEED,
                        "XML error at byte {} in {}, keeping {} records: {}",
                        reader.buffer_position(),
                        source_label,
                        records.len(),
                        err
                    );
                    break;
                }
                return Err(ParseError::Xml(err.to_string()));
            }
        };

        match event {
            Event::Start(e) => {
                depth += 1;
                let name = e.local_name();
                let name = name.as_ref();

                let Some(current_shape) = shape else {
                    shape = Some(FeedShape::from_root(name).ok_or_else(|| {
                        ParseError::NotAFeed(format!(
                            "unexpected root element <{}>",
                            String::from_utf8_lossy(name)
                        ))
                    })?);
                    continue;
                };

                if entry.is_none() {
                    if name.eq_ignore_ascii_case(current_shape.record_tag()) {
                        entry = Some((depth, RawEntry::default()));
                    }
                } else if let Some((_, raw)) = entry.as_mut() {
                    let nested = !captures.is_empty();
                    if !nested && current_shape == FeedShape::Atom && name.eq_ignore_ascii_case(b"link") {
                        fill_link(raw, &e);
                    }
                    let field = current_shape
                        .field_for(name)
                        .filter(|field| !nested || field.is_cap())
                        .filter(|field| *field != Field::Summary || !is_embedded_xml(&e));
                    if let Some(field) = field {
                        if raw.slot(field).is_none() {
                            captures.push(Capture {
                                field,
                                depth,
                                text: String::new(),
                            });
                        }
                    }
                }
            }
            Event::Empty(e) => {
                let name = e.local_name();
                if shape.is_none() {
                    // A self-closing root is a feed with no entries.
                    shape = Some(FeedShape::from_root(name.as_ref()).ok_or_else(|| {
                        ParseError::NotAFeed(format!(
                            "unexpected root element <{}>",
                            String::from_utf8_lossy(name.as_ref())
                        ))
                    })?);
                    continue;
                }
                if let Some((_, raw)) = entry.as_mut() {
                    if captures.is_empty() && name.as_ref().eq_ignore_ascii_case(b"link") {
                        fill_link(raw, &e);
                    }
                }
            }
            Event::Text(t) => {
                if let Some(cap) = captures.last_mut() {
                    let text = match t.unescape() {
                        Ok(text) => text.into_owned(),
                        Err(_) => decode_entities(&String::from_utf8_lossy(&t)),
                    };
                    push_text(&mut cap.text, &text);
                }
            }
            Event::CData(c) => {
                if let Some(cap) = captures.last_mut() {
                    push_text(&mut cap.text, &String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                if captures.last().is_some_and(|cap| cap.depth == depth) {
                    if let (Some(cap), Some((_, raw))) = (captures.pop(), entry.as_mut()) {
                        let text = cap.text.trim();
                        if !text.is_empty() {
                            *raw.slot(cap.field) = Some(text.to_string());
                        }
                    }
                }

                if matches!(entry, Some((entry_depth, _)) if entry_depth == depth) {
                    if let Some((_, raw)) = entry.take() {
                        match build_record(raw, seen, source_label, severity, fetched_at) {
                            Ok(record) => records.push(record),
                            Err(reason) => {
                                debug!(target: TARGET_FEED, "Skipping entry from {}: {}", source_label, reason);
                                skipped.push(reason);
                            }
                        }
                        seen += 1;
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let shape = shape.ok_or_else(|| ParseError::NotAFeed("document has no elements".to_string()))?;

    // Keep the newest entries; stable so undated entries keep document order.
    records.sort_by_key(|r| std::cmp::Reverse(r.effective_timestamp()));
    records.truncate(MAX_XML_RECORDS);

    debug!(
        target: TARGET_FEED,
        "Parsed {:?} feed from {}: {} records kept, {} skipped",
        shape,
        source_label,
        records.len(),
        skipped.len()
    );

    Ok(ParsedFeed {
        shape,
        records,
        skipped,
    })
}

fn push_text(buffer: &mut String, text: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(text);
}

/// Atom `<content>` carrying an XML document (such as a full CAP alert)
/// is structure, not prose.
fn is_embedded_xml(element: &BytesStart) -> bool {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"type")
        .and_then(|attr| attr.unescape_value().ok())
        .map(|kind| {
            let kind = kind.trim().to_ascii_lowercase();
            kind.ends_with("xml") && !kind.ends_with("xhtml")
        })
        .unwrap_or(false)
}

fn fill_link(raw: &mut RawEntry, element: &BytesStart) {
    if raw.link.is_some() {
        return;
    }
    raw.link = element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"href")
        .and_then(|attr| attr.unescape_value().ok())
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty());
}

fn build_record(
    raw: RawEntry,
    index: usize,
    source_label: &str,
    severity: &SeverityPolicy,
    fetched_at: chrono::DateTime<Utc>,
) -> Result<AlertRecord, PartialRecordError> {
    let title = raw
        .title
        .map(|t| clean_text(&t))
        .filter(|t| !t.is_empty())
        .ok_or(PartialRecordError::MissingTitle { index })?;
    let id = raw
        .id
        .or(raw.link)
        .ok_or(PartialRecordError::MissingId { index })?;

    let summary = ParsedField::from_option(
        raw.summary.map(|s| truncate_chars(&clean_text(&s), MAX_SUMMARY_CHARS)),
        String::new(),
    );
    let severity = ParsedField::from_option(
        raw.severity.map(|s| severity.normalize(&s)),
        Severity::Info,
    );
    let area = ParsedField::from_option(raw.area.map(|a| clean_text(&a)), DEFAULT_AREA.to_string());

    Ok(AlertRecord {
        id,
        title,
        summary: summary.into_inner(),
        severity: severity.into_inner(),
        area: area.into_inner(),
        source: source_label.to_string(),
        published_at: raw.published.as_deref().and_then(parse_date),
        valid_from: raw.valid_from.as_deref().and_then(parse_date),
        fetched_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::NDMA_SOURCE;

    fn parse(body: &str) -> Result<ParsedFeed, ParseError> {
        parse_alert_xml(body, NDMA_SOURCE, &SeverityPolicy::default())
    }

    const CAP_ATOM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2">
  <title>NDMA SACHET</title>
  <entry>
    <id>e1</id>
    <title>Flood Watch &amp; Warning</title>
    <updated>2024-07-02T09:00:00+05:30</updated>
    <summary>River levels rising along the Sutlej</summary>
    <cap:severity>Severe</cap:severity>
    <cap:areaDesc>Punjab</cap:areaDesc>
  </entry>
  <entry>
    <id>e2</id>
    <summary>No headline here</summary>
  </entry>
  <entry>
    <title>Cyclone Alert</title>
    <link href="https://sachet.ndma.gov.in/cap/e3"/>
    <updated>2024-07-01T09:00:00Z</updated>
  </entry>
</feed>"#;

    #[test]
    fn test_atom_cap_fields() {
        let feed = parse(CAP_ATOM).unwrap();
        assert_eq!(feed.shape, FeedShape::Atom);
        assert_eq!(feed.records.len(), 2);

        let flood = &feed.records[0];
        assert_eq!(flood.id, "e1");
        assert_eq!(flood.title, "Flood Watch & Warning");
        assert_eq!(flood.summary, "River levels rising along the Sutlej");
        assert_eq!(flood.severity, Severity::Severe);
        assert_eq!(flood.area, "Punjab");
        assert_eq!(flood.source, NDMA_SOURCE);
    }

    #[test]
    fn test_entry_without_title_is_skipped() {
        let feed = parse(CAP_ATOM).unwrap();
        assert_eq!(feed.skipped, vec![PartialRecordError::MissingTitle { index: 1 }]);
        assert!(feed.records.iter().all(|r| r.id != "e2"));
    }

    #[test]
    fn test_optional_fields_default() {
        let feed = parse(CAP_ATOM).unwrap();
        let cyclone = feed.records.iter().find(|r| r.title == "Cyclone Alert").unwrap();
        assert_eq!(cyclone.id, "https://sachet.ndma.gov.in/cap/e3");
        assert_eq!(cyclone.severity, Severity::Info);
        assert_eq!(cyclone.area, DEFAULT_AREA);
        assert_eq!(cyclone.summary, "");
    }

    #[test]
    fn test_entry_without_id_is_skipped() {
        let feed = parse(
            "<feed><entry><title>Orphan</title></entry><entry><id>k</id><title>Kept</title></entry></feed>",
        )
        .unwrap();
        assert_eq!(feed.records.len(), 1);
        assert_eq!(feed.records[0].title, "Kept");
        assert_eq!(feed.skipped, vec![PartialRecordError::MissingId { index: 0 }]);
    }

    #[test]
    fn test_rss_items() {
        let body = r#"<rss version="2.0" xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2"><channel>
            <title>Alerts</title>
            <item>
              <title>Heat Wave</title>
              <description><![CDATA[<p>Temperatures above <b>45°C</b> expected</p>]]></description>
              <guid>rss-1</guid>
              <pubDate>Mon, 01 Jul 2024 10:30:00 GMT</pubDate>
              <cap:severity>moderate</cap:severity>
            </item>
          </channel></rss>"#;
        let feed = parse(body).unwrap();
        assert_eq!(feed.shape, FeedShape::Rss);
        let r = &feed.records[0];
        assert_eq!(r.id, "rss-1");
        assert_eq!(r.summary, "Temperatures above 45°C expected");
        assert_eq!(r.severity, Severity::Moderate);
        assert!(r.published_at.is_some());
    }

    #[test]
    fn test_summary_is_capped() {
        let long = "x".repeat(500);
        let body = format!("<feed><entry><id>1</id><title>T</title><summary>{}</summary></entry></feed>", long);
        let feed = parse(&body).unwrap();
        assert_eq!(feed.records[0].summary.chars().count(), 200);
    }

    #[test]
    fn test_keeps_ten_most_recent() {
        let mut body = String::from("<feed>");
        for day in 1..=14 {
            body.push_str(&format!(
                "<entry><id>d{day}</id><title>Day {day}</title><updated>2024-07-{day:02}T00:00:00Z</updated></entry>"
            ));
        }
        body.push_str("</feed>");
        let feed = parse(&body).unwrap();
        assert_eq!(feed.records.len(), MAX_XML_RECORDS);
        assert_eq!(feed.records[0].id, "d14");
        assert_eq!(feed.records[9].id, "d5");
    }

    #[test]
    fn test_truncated_document_keeps_complete_entries() {
        let body = "<feed><entry><id>a</id><title>A</title></entry><entry><id>b</id><title>B</tit";
        let feed = parse(body).unwrap();
        assert_eq!(feed.records.len(), 1);
        assert_eq!(feed.records[0].id, "a");
    }

    #[test]
    fn test_cap_fields_inside_embedded_content() {
        let body = r#"<feed xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2">
          <entry>
            <id>1</id>
            <title>Flood</title>
            <content type="text/xml">
              <cap:alert><cap:info>
                <cap:severity>Severe</cap:severity>
                <cap:area><cap:areaDesc>Punjab</cap:areaDesc></cap:area>
              </cap:info></cap:alert>
            </content>
          </entry>
        </feed>"#;
        let feed = parse(body).unwrap();
        let flood = &feed.records[0];
        assert_eq!(flood.severity, Severity::Severe);
        assert_eq!(flood.area, "Punjab");
        assert!(!flood.summary.contains("Severe Punjab"));
    }

    #[test]
    fn test_cap_fields_nested_in_summary() {
        let body = r#"<feed xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2">
          <entry>
            <id>2</id>
            <title>Landslide</title>
            <summary>Slopes unstable <cap:areaDesc>Kerala</cap:areaDesc> after rain</summary>
          </entry>
        </feed>"#;
        let feed = parse(body).unwrap();
        let slide = &feed.records[0];
        assert_eq!(slide.area, "Kerala");
        assert_eq!(slide.summary, "Slopes unstable after rain");
    }

    #[test]
    fn test_rss_link_is_fallback_id() {
        let body = r#"<rss version="2.0"><channel>
            <item>
              <title>Cold Wave</title>
              <link>https://mausam.imd.gov.in/alerts/cw-7</link>
            </item>
          </channel></rss>"#;
        let feed = parse(body).unwrap();
        assert_eq!(feed.records.len(), 1);
        assert_eq!(feed.records[0].id, "https://mausam.imd.gov.in/alerts/cw-7");
    }

    #[test]
    fn test_read_error_before_any_record() {
        let result = parse("<feed><entry><id>a</id><title>A</title");
        assert!(matches!(result, Err(ParseError::Xml(_))));
    }

    #[test]
    fn test_not_a_feed() {
        assert!(matches!(parse("<html><body>502</body></html>"), Err(ParseError::NotAFeed(_))));
        assert!(parse("").is_err());
    }
}
