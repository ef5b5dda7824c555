//! Type definitions for the feed module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Duration;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

/// Area used when a source does not say where an alert applies.
pub const DEFAULT_AREA: &str = "Multiple Regions";
pub const SYSTEM_SOURCE: &str = "System";
pub const IMD_SOURCE: &str = "India Meteorological Department";
pub const NDMA_SOURCE: &str = "National Disaster Management Authority";

/// Normalized alert severity. Never carries the raw source string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Severe,
    Moderate,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Severe => "Severe",
            Severity::Moderate => "Moderate",
            Severity::Info => "Info",
        };
        f.write_str(label)
    }
}

/// A field pulled out of a loosely structured record.
///
/// `Missing` carries the documented default that stands in for the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedField<T> {
    Present(T),
    Missing(T),
}

impl<T> ParsedField<T> {
    pub fn from_option(value: Option<T>, default: T) -> Self {
        match value {
            Some(v) => ParsedField::Present(v),
            None => ParsedField::Missing(default),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, ParsedField::Present(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            ParsedField::Present(v) | ParsedField::Missing(v) => v,
        }
    }
}

/// One alert, immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub severity: Severity,
    pub area: String,
    pub source: String,
    pub published_at: Option<DateTime<Utc>>,
    pub valid_from: Option<DateTime<Utc>>,
    /// When the record was parsed; last resort for ordering.
    pub fetched_at: DateTime<Utc>,
}

impl AlertRecord {
    /// Best available timestamp: published, then valid-from, then fetch time.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.published_at
            .or(self.valid_from)
            .unwrap_or(self.fetched_at)
    }

    /// The record handed out when every source failed.
    pub fn unavailable_placeholder() -> Self {
        AlertRecord {
            id: "system-unavailable".to_string(),
            title: "Alerts Currently Unavailable".to_string(),
            summary: "Could not fetch live alerts at this time. Please check your internet connection or try again later.".to_string(),
            severity: Severity::Moderate,
            area: "All Regions".to_string(),
            source: SYSTEM_SOURCE.to_string(),
            published_at: None,
            valid_from: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.source == SYSTEM_SOURCE
    }
}

/// Payload shape a source serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Json,
    Xml,
}

impl SourceKind {
    pub fn default_label(&self) -> &'static str {
        match self {
            SourceKind::Json => IMD_SOURCE,
            SourceKind::Xml => NDMA_SOURCE,
        }
    }

    pub(crate) fn accept_header(&self) -> &'static str {
        match self {
            SourceKind::Json => "application/json, text/plain;q=0.9, */*;q=0.8",
            SourceKind::Xml => "application/atom+xml, application/rss+xml, application/xml, text/xml, */*;q=0.8",
        }
    }
}

/// Where to fetch one feed from and how to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub url: String,
    pub kind: SourceKind,
    pub timeout: Duration,
    pub label: String,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>, kind: SourceKind) -> Self {
        SourceDescriptor {
            url: url.into(),
            kind,
            timeout: REQUEST_TIMEOUT,
            label: kind.default_label().to_string(),
        }
    }

    pub fn json(url: impl Into<String>) -> Self {
        Self::new(url, SourceKind::Json)
    }

    pub fn xml(url: impl Into<String>) -> Self {
        Self::new(url, SourceKind::Xml)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Route the request through a raw pass-through proxy that takes the
    /// target in its `url` query parameter.
    pub fn via_proxy(mut self, proxy: &str) -> Result<Self, url::ParseError> {
        let mut proxied = url::Url::parse(proxy)?;
        proxied.query_pairs_mut().append_pair("url", &self.url);
        self.url = proxied.to_string();
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(published: Option<i64>, valid: Option<i64>) -> AlertRecord {
        AlertRecord {
            id: "a".to_string(),
            title: "t".to_string(),
            summary: String::new(),
            severity: Severity::Info,
            area: DEFAULT_AREA.to_string(),
            source: NDMA_SOURCE.to_string(),
            published_at: published.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            valid_from: valid.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            fetched_at: Utc.timestamp_opt(10, 0).unwrap(),
        }
    }

    #[test]
    fn test_effective_timestamp_fallbacks() {
        assert_eq!(record(Some(30), Some(20)).effective_timestamp().timestamp(), 30);
        assert_eq!(record(None, Some(20)).effective_timestamp().timestamp(), 20);
        assert_eq!(record(None, None).effective_timestamp().timestamp(), 10);
    }

    #[test]
    fn test_proxy_wrapping_encodes_target() {
        let source = SourceDescriptor::xml("https://cap-feeds.s3.amazonaws.com/in.xml")
            .via_proxy("https://api.allorigins.win/raw")
            .unwrap();
        assert_eq!(
            source.url,
            "https://api.allorigins.win/raw?url=https%3A%2F%2Fcap-feeds.s3.amazonaws.com%2Fin.xml"
        );
        assert_eq!(source.label, NDMA_SOURCE);
    }

    #[test]
    fn test_parsed_field() {
        let present = ParsedField::from_option(Some("Punjab".to_string()), DEFAULT_AREA.to_string());
        assert!(present.is_present());
        let missing = ParsedField::from_option(None, DEFAULT_AREA.to_string());
        assert!(!missing.is_present());
        assert_eq!(missing.into_inner(), DEFAULT_AREA);
    }
}
