//! HTTP client creation and the single-GET source fetcher.

use anyhow::Result;
use reqwest::header;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{FetchError, FetchErrorKind};
use super::types::SourceDescriptor;
use super::util::decode_body;
use crate::TARGET_WEB_REQUEST;

const USER_AGENT: &str = concat!("hazardwatch/", env!("CARGO_PKG_VERSION"));

/// Create the client shared by every source fetch.
pub fn create_http_client() -> Result<reqwest::Client> {
    debug!(target: TARGET_WEB_REQUEST, "Creating HTTP client");
    reqwest::Client::builder()
        .gzip(true)
        .redirect(reqwest::redirect::Policy::default())
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))
}

/// Perform one bounded GET against `source`.
///
/// Every failure comes back as a `FetchError`; there are no retries here.
/// Cancelling `cancel` abandons the request immediately.
pub async fn fetch_source(
    client: &reqwest::Client,
    source: &SourceDescriptor,
    cancel: &CancellationToken,
) -> Result<String, FetchError> {
    let url = source.url.as_str();
    debug!(target: TARGET_WEB_REQUEST, "Fetching {:?} feed from {}", source.kind, url);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(target: TARGET_WEB_REQUEST, "Fetch from {} cancelled", url);
            Err(FetchError::new(FetchErrorKind::Cancelled, url))
        }
        result = timeout(source.timeout, fetch_body(client, source)) => match result {
            Ok(result) => result,
            Err(_) => {
                warn!(target: TARGET_WEB_REQUEST, "Request to {} timed out after {:?}", url, source.timeout);
                Err(FetchError::new(FetchErrorKind::Timeout, url))
            }
        }
    }
}

async fn fetch_body(client: &reqwest::Client, source: &SourceDescriptor) -> Result<String, FetchError> {
    let url = source.url.as_str();
    let response = client
        .get(url)
        .header(header::ACCEPT, source.kind.accept_header())
        .send()
        .await
        .map_err(|err| {
            warn!(target: TARGET_WEB_REQUEST, "Request to {} failed: {}", url, err);
            classify(err, url)
        })?;

    let status = response.status();
    if !status.is_success() {
        warn!(target: TARGET_WEB_REQUEST, "Non-success status {} from {}", status, url);
        return Err(FetchError::http_status(url, status.as_u16()));
    }

    let content_encoding = header_value(&response, header::CONTENT_ENCODING);
    let content_type = header_value(&response, header::CONTENT_TYPE);

    let bytes = response.bytes().await.map_err(|err| {
        warn!(target: TARGET_WEB_REQUEST, "Failed to read response body from {}: {}", url, err);
        classify(err, url)
    })?;

    let body = decode_body(&bytes, content_encoding.as_deref(), content_type.as_deref(), url);
    if body.trim().is_empty() {
        warn!(target: TARGET_WEB_REQUEST, "Empty body from {}", url);
        return Err(FetchError::new(FetchErrorKind::EmptyBody, url).with_message(format!("status {}", status)));
    }

    debug!(
        target: TARGET_WEB_REQUEST,
        "Received {} bytes from {}, starting: {}",
        body.len(),
        url,
        body.chars().take(200).collect::<String>()
    );
    Ok(body)
}

fn header_value(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.to_lowercase())
}

fn classify(err: reqwest::Error, url: &str) -> FetchError {
    let kind = if err.is_timeout() {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::Network
    };
    let mut fetch_error = FetchError::new(kind, url).with_message(err.to_string());
    fetch_error.status = err.status().map(|s| s.as_u16());
    fetch_error
}
