//! Utility functions for feed processing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Read;
use tracing::debug;

use crate::TARGET_WEB_REQUEST;

static MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid markup regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Helper function to validate a URL
pub fn is_valid_url(url: &str) -> bool {
    if let Ok(parsed) = url::Url::parse(url) {
        parsed.scheme() == "http" || parsed.scheme() == "https"
    } else {
        false
    }
}

/// Parse a date string in various formats
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let date_str = date_str.trim();
    if date_str.is_empty() {
        return None;
    }

    // Try RFC3339
    if let Ok(date) = DateTime::parse_from_rfc3339(date_str) {
        return Some(date.with_timezone(&Utc));
    }

    // Try RFC2822
    if let Ok(date) = DateTime::parse_from_rfc2822(date_str) {
        return Some(date.with_timezone(&Utc));
    }

    // Try ISO 8601 with a numeric offset
    if let Ok(date) = DateTime::parse_from_str(date_str, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(date.with_timezone(&Utc));
    }

    // Naive timestamps are taken as UTC
    for format in &[
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d-%m-%Y %H:%M",
    ] {
        if let Ok(date) = NaiveDateTime::parse_from_str(date_str, format) {
            return Some(date.and_utc());
        }
    }

    for format in &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_str, format) {
            return date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
        }
    }

    None
}

/// Clean up malformed XML
pub fn cleanup_xml(xml: &str) -> String {
    let mut cleaned = xml.trim().trim_start_matches('\u{FEFF}').to_string();

    // Remove any leading whitespace or invalid characters before <?xml or <rss
    if let Some(xml_start) = cleaned.find("<?xml") {
        cleaned = cleaned[xml_start..].to_string();
    } else if let Some(rss_start) = cleaned.find("<rss") {
        cleaned = cleaned[rss_start..].to_string();
    } else if let Some(feed_start) = cleaned.find("<feed") {
        cleaned = cleaned[feed_start..].to_string();
    }

    // Replace common problematic entities
    cleaned = cleaned
        .replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&rsquo;", "&#8217;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rdquo;", "&#8221;")
        .replace("&ldquo;", "&#8220;")
        .replace("&amp;amp;", "&amp;");

    // Remove any invalid XML characters
    cleaned
        .chars()
        .filter(|&c| {
            matches!(c,
                '\u{0009}' | // tab
                '\u{000A}' | // newline
                '\u{000D}' | // carriage return
                '\u{0020}'..='\u{D7FF}' |
                '\u{E000}'..='\u{FFFD}' |
                '\u{10000}'..='\u{10FFFF}'
            )
        })
        .collect()
}

/// Decode the handful of entities that survive into feed text.
pub fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Strip embedded markup and collapse runs of whitespace.
pub fn clean_text(text: &str) -> String {
    let without_markup = MARKUP.replace_all(text, " ");
    WHITESPACE.replace_all(without_markup.trim(), " ").into_owned()
}

/// Cap `text` at `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Stable id for records that arrive without one.
pub fn synthesize_id(prefix: &str, title: &str, timestamp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", prefix, hex)
}

/// Turn a response body into text, undoing compression and odd charsets.
pub fn decode_body(
    bytes: &[u8],
    content_encoding: Option<&str>,
    content_type: Option<&str>,
    url: &str,
) -> String {
    let decompressed = if content_encoding == Some("br") {
        let mut decoded = Vec::new();
        let mut reader = brotli::Decompressor::new(bytes, 4096);
        if reader.read_to_end(&mut decoded).is_ok() && !decoded.is_empty() {
            debug!(target: TARGET_WEB_REQUEST, "Decompressed brotli content from {}", url);
            decoded
        } else {
            try_decompressions(bytes, url)
        }
    } else {
        try_decompressions(bytes, url)
    };

    match String::from_utf8(decompressed) {
        Ok(text) => text,
        Err(err) => {
            let raw = err.into_bytes();
            let charset = content_type.and_then(|ct| {
                ct.split(';')
                    .find(|part| part.trim().to_lowercase().starts_with("charset="))
                    .and_then(|part| part.split('=').nth(1))
                    .map(|c| c.trim().to_string())
            });
            let encoding = charset
                .as_deref()
                .and_then(|c| encoding_rs::Encoding::for_label(c.as_bytes()))
                .unwrap_or(encoding_rs::WINDOWS_1252);
            debug!(target: TARGET_WEB_REQUEST, "Body from {} is not UTF-8, decoding as {}", url, encoding.name());
            let (decoded, _, _) = encoding.decode(&raw);
            decoded.into_owned()
        }
    }
}

/// Try various decompression methods for a byte array
fn try_decompressions(bytes: &[u8], url: &str) -> Vec<u8> {
    let mut decoded = Vec::new();
    if flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .is_ok()
        && !decoded.is_empty()
    {
        debug!(target: TARGET_WEB_REQUEST, "Decompressed gzip content from {}", url);
        return decoded;
    }

    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .is_ok()
        && !decoded.is_empty()
    {
        debug!(target: TARGET_WEB_REQUEST, "Decompressed zlib content from {}", url);
        return decoded;
    }

    bytes.to_vec()
}
