//! Hazard feed handling for hazardwatch.
//!
//! This module fetches the upstream alert feeds and turns their payloads
//! into normalized `AlertRecord`s.

mod client;
mod error;
mod json;
mod policy;
mod types;
mod util;
mod xml;

pub use self::types::*;

pub use self::client::{create_http_client, fetch_source};
pub use self::error::*;
pub use self::json::parse_warnings_json;
pub use self::policy::*;
pub use self::util::{cleanup_xml, decode_entities, is_valid_url, parse_date};
pub use self::xml::{parse_alert_xml, FeedShape, ParsedFeed, MAX_XML_RECORDS};
