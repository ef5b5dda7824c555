//! Error taxonomy for fetching and parsing feeds.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    Network,
    HttpStatus,
    EmptyBody,
    /// The poller shut down while the request was in flight.
    Cancelled,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FetchErrorKind::Timeout => "timed out",
            FetchErrorKind::Network => "network error",
            FetchErrorKind::HttpStatus => "HTTP error",
            FetchErrorKind::EmptyBody => "empty body",
            FetchErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// A failed GET against one source. Always a value, never a panic.
#[derive(Debug, Clone, Error)]
#[error("fetch from {url} failed ({kind}){}", .status.map(|s| format!(": status {}", s)).unwrap_or_default())]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub status: Option<u16>,
    pub url: String,
    pub message: Option<String>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: &str) -> Self {
        FetchError {
            kind,
            status: None,
            url: url.to_string(),
            message: None,
        }
    }

    pub fn http_status(url: &str, status: u16) -> Self {
        FetchError {
            status: Some(status),
            ..Self::new(FetchErrorKind::HttpStatus, url)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed XML payload: {0}")]
    Xml(String),
    #[error("payload is not an alert feed: {0}")]
    NotAFeed(String),
}

/// Why a single XML record was dropped. Logged, not surfaced to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartialRecordError {
    #[error("record {index} has no title")]
    MissingTitle { index: usize },
    #[error("record {index} has no id or link")]
    MissingId { index: usize },
}

/// Everything that can go wrong for one source during a cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SourceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Fetch(e) if e.kind == FetchErrorKind::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no alert sources configured")]
    NoSources,
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),
}
