//! Fan-out fetch, merge and filtering of every configured alert source.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::feed::{
    create_http_client, fetch_source, is_valid_url, parse_alert_xml, parse_warnings_json,
    AlertPolicy, AlertRecord, ConfigError, SourceDescriptor, SourceError, SourceKind,
};
use crate::TARGET_FEED;

/// Largest result a single aggregation returns.
pub const MAX_AGGREGATED_RECORDS: usize = 15;

/// Anything that can produce one poll cycle's worth of alerts.
#[async_trait]
pub trait AlertProvider: Send + Sync {
    /// Never fails: errors are folded into the returned list.
    async fn aggregate(&self, region: &str, cancel: &CancellationToken) -> Vec<AlertRecord>;
}

/// Outcome of one source during a cycle, in configuration order.
pub type SourceOutcome = Result<Vec<AlertRecord>, SourceError>;

pub struct Aggregator {
    sources: Vec<SourceDescriptor>,
    client: reqwest::Client,
    policy: AlertPolicy,
}

impl Aggregator {
    /// An empty source list is a configuration fault.
    pub fn new(sources: Vec<SourceDescriptor>, policy: AlertPolicy) -> anyhow::Result<Self> {
        if sources.is_empty() {
            return Err(ConfigError::NoSources.into());
        }
        if let Some(bad) = sources.iter().find(|s| !is_valid_url(&s.url)) {
            return Err(ConfigError::InvalidUrl(bad.url.clone()).into());
        }
        Ok(Aggregator {
            sources,
            client: create_http_client()?,
            policy,
        })
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Fetch and parse every source concurrently.
    pub async fn fetch_all(&self, cancel: &CancellationToken) -> Vec<SourceOutcome> {
        let fetches = self
            .sources
            .iter()
            .map(|source| self.fetch_one(source, cancel));
        join_all(fetches).await
    }

    async fn fetch_one(&self, source: &SourceDescriptor, cancel: &CancellationToken) -> SourceOutcome {
        let body = fetch_source(&self.client, source, cancel).await?;
        let records = match source.kind {
            SourceKind::Json => parse_warnings_json(&body, &source.label, &self.policy.severity)?,
            SourceKind::Xml => parse_alert_xml(&body, &source.label, &self.policy.severity)?.records,
        };
        debug!(target: TARGET_FEED, "{} returned {} records", source.label, records.len());
        Ok(records)
    }
}

#[async_trait]
impl AlertProvider for Aggregator {
    async fn aggregate(&self, region: &str, cancel: &CancellationToken) -> Vec<AlertRecord> {
        let outcomes = self.fetch_all(cancel).await;
        merge_outcomes(&self.sources, outcomes, region, &self.policy)
    }
}

/// Merge per-source outcomes into the final list.
///
/// Partial failure keeps whatever succeeded. Only when every source failed
/// does the caller get the single "unavailable" placeholder.
pub fn merge_outcomes(
    sources: &[SourceDescriptor],
    outcomes: Vec<SourceOutcome>,
    region: &str,
    policy: &AlertPolicy,
) -> Vec<AlertRecord> {
    let mut merged = Vec::new();
    let mut failures = 0usize;
    let total = outcomes.len();

    for (index, outcome) in outcomes.into_iter().enumerate() {
        let label = sources
            .get(index)
            .map(|s| s.label.as_str())
            .unwrap_or("unknown source");
        match outcome {
            Ok(records) => merged.extend(records),
            Err(err) if err.is_cancelled() => {
                debug!(target: TARGET_FEED, "{} cancelled", label);
                failures += 1;
            }
            Err(err) => {
                warn!(target: TARGET_FEED, "{} failed: {}", label, err);
                failures += 1;
            }
        }
    }

    if total > 0 && failures == total {
        error!(target: TARGET_FEED, "All {} alert sources failed, returning placeholder", total);
        return vec![AlertRecord::unavailable_placeholder()];
    }

    let mut alerts = dedupe(merged);
    sort_by_recency(&mut alerts);
    alerts.truncate(MAX_AGGREGATED_RECORDS);
    let alerts = filter_region(alerts, region, policy);

    info!(
        target: TARGET_FEED,
        "Aggregated {} alerts for region {:?} ({} of {} sources ok)",
        alerts.len(),
        region,
        total - failures,
        total
    );
    alerts
}

/// Collapse records sharing an id, keeping the first one seen.
pub fn dedupe(records: Vec<AlertRecord>) -> Vec<AlertRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}

/// Newest first. Stable, so equal timestamps keep fetch order.
pub fn sort_by_recency(records: &mut [AlertRecord]) {
    records.sort_by(|a, b| b.effective_timestamp().cmp(&a.effective_timestamp()));
}

pub fn filter_region(records: Vec<AlertRecord>, region: &str, policy: &AlertPolicy) -> Vec<AlertRecord> {
    if policy.region.is_unfiltered(region) {
        return records;
    }
    records
        .into_iter()
        .filter(|r| policy.region.matches(region, &r.area))
        .collect()
}
