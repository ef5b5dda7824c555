//! Parser for the meteorological warning JSON payload.
//!
//! The upstream schema is loose and has changed names over time, so every
//! field is looked up against a list of candidate keys.

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::ParseError;
use super::policy::SeverityPolicy;
use super::types::{AlertRecord, Severity, DEFAULT_AREA};
use super::util::{clean_text, decode_entities, parse_date, synthesize_id};
use crate::TARGET_FEED;

const ID_KEYS: &[&str] = &["id", "warning_id", "alert_id", "obj_id", "identifier"];
const TITLE_KEYS: &[&str] = &["warning_type", "type", "event", "title", "headline", "warning"];
const MESSAGE_KEYS: &[&str] = &["message", "description", "desc", "summary", "details", "text"];
const SEVERITY_KEYS: &[&str] = &["severity", "level", "warning_level", "intensity"];
const AREA_KEYS: &[&str] = &["district", "district_name", "area", "area_name", "areadesc", "region", "state", "location"];
const PUBLISHED_KEYS: &[&str] = &["published_at", "issued_at", "issue_time", "issued", "sent", "date"];
const VALID_FROM_KEYS: &[&str] = &["valid_from", "validfrom", "effective", "onset", "start_time", "from"];
const WRAPPER_KEYS: &[&str] = &["warnings", "alerts", "data", "items", "features"];

const DEFAULT_MESSAGE: &str = "Weather alert";

/// Decode a warning payload into alert records.
///
/// An undecodable body is an error; missing optional fields never drop a
/// record.
pub fn parse_warnings_json(
    body: &str,
    source_label: &str,
    severity: &SeverityPolicy,
) -> Result<Vec<AlertRecord>, ParseError> {
    let value: Value = serde_json::from_str(body)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let wrapped = WRAPPER_KEYS
                .iter()
                .find_map(|key| match map.remove(*key) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                });
            match wrapped {
                Some(items) => items,
                None => {
                    return Err(ParseError::NotAFeed(
                        "JSON object without a warning list".to_string(),
                    ))
                }
            }
        }
        other => {
            return Err(ParseError::NotAFeed(format!(
                "expected a JSON array, got {}",
                json_type_name(&other)
            )))
        }
    };

    let fetched_at = Utc::now();
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(fields) = item else {
            warn!(target: TARGET_FEED, "Skipping non-object warning at index {}", index);
            continue;
        };

        let message = lookup(&fields, MESSAGE_KEYS)
            .map(|m| clean_text(&decode_entities(&m)))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_string());
        let title = lookup(&fields, TITLE_KEYS)
            .map(|t| clean_text(&decode_entities(&t)))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| message.clone());
        let published_raw = lookup(&fields, PUBLISHED_KEYS);
        let valid_from_raw = lookup(&fields, VALID_FROM_KEYS);
        let id = lookup(&fields, ID_KEYS).unwrap_or_else(|| {
            let stamp = published_raw
                .as_deref()
                .or(valid_from_raw.as_deref())
                .unwrap_or_default();
            synthesize_id("imd", &title, stamp)
        });
        let severity = lookup(&fields, SEVERITY_KEYS)
            .map(|s| severity.normalize(&s))
            .unwrap_or(Severity::Moderate);
        let area = lookup(&fields, AREA_KEYS)
            .map(|a| decode_entities(&a))
            .unwrap_or_else(|| DEFAULT_AREA.to_string());

        records.push(AlertRecord {
            id,
            title,
            summary: message,
            severity,
            area,
            source: source_label.to_string(),
            published_at: published_raw.as_deref().and_then(parse_date),
            valid_from: valid_from_raw.as_deref().and_then(parse_date),
            fetched_at,
        });
    }

    debug!(target: TARGET_FEED, "Parsed {} warnings from {}", records.len(), source_label);
    Ok(records)
}

/// First non-empty value under any of `keys`, compared case-insensitively.
fn lookup(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| scalar_to_string(v))
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::IMD_SOURCE;

    fn parse(body: &str) -> Result<Vec<AlertRecord>, ParseError> {
        parse_warnings_json(body, IMD_SOURCE, &SeverityPolicy::default())
    }

    #[test]
    fn test_full_warning() {
        let records = parse(
            r#"[{"id":"w1","warning_type":"Heavy Rainfall","message":"Very heavy rain likely",
                "severity":"High","district":"Punjab","valid_from":"2024-07-01T06:00:00Z"}]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id, "w1");
        assert_eq!(r.title, "Heavy Rainfall");
        assert_eq!(r.summary, "Very heavy rain likely");
        assert_eq!(r.severity, Severity::Severe);
        assert_eq!(r.area, "Punjab");
        assert_eq!(r.source, IMD_SOURCE);
        assert!(r.valid_from.is_some());
        assert!(r.published_at.is_none());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let records = parse(r#"[{"issued_at":"2024-07-01 10:00"}]"#).unwrap();
        let r = &records[0];
        assert_eq!(r.summary, "Weather alert");
        assert_eq!(r.severity, Severity::Moderate);
        assert_eq!(r.area, DEFAULT_AREA);
        assert!(r.id.starts_with("imd-"));

        // Same content on the next poll produces the same id.
        let again = parse(r#"[{"issued_at":"2024-07-01 10:00"}]"#).unwrap();
        assert_eq!(again[0].id, r.id);
    }

    #[test]
    fn test_loose_keys_and_numbers() {
        let records = parse(
            r#"{"data":[{"Obj_id":42,"District":"Thrissur","Level":"medium","Description":"Thunderstorm &amp; lightning"}]}"#,
        )
        .unwrap();
        let r = &records[0];
        assert_eq!(r.id, "42");
        assert_eq!(r.area, "Thrissur");
        assert_eq!(r.severity, Severity::Moderate);
        assert_eq!(r.summary, "Thunderstorm & lightning");
    }

    #[test]
    fn test_unparsable_date_keeps_record() {
        let records = parse(r#"[{"id":"x","published_at":"sometime soon"}]"#).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].published_at.is_none());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(parse("[{\"id\": "), Err(ParseError::Json(_))));
        assert!(matches!(parse("\"hello\""), Err(ParseError::NotAFeed(_))));
        assert!(matches!(parse("{\"status\":\"ok\"}"), Err(ParseError::NotAFeed(_))));
    }

    #[test]
    fn test_non_object_items_skipped() {
        let records = parse(r#"[1, {"id":"ok"}, "text"]"#).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "ok");
    }
}
