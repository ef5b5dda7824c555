use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::feed::{
    is_valid_url, AlertPolicy, ConfigError, RegionMatch, RegionPolicy, SeverityPolicy,
    SourceDescriptor, ALL_REGIONS, REQUEST_TIMEOUT,
};
use crate::poller::DEFAULT_POLL_MINUTES;

/// District-wise nowcast warnings published by the India Meteorological Department.
pub const DEFAULT_JSON_FEED: &str = "https://mausam.imd.gov.in/api/warnings_district_api.php";
/// CAP feed published by the National Disaster Management Authority.
pub const DEFAULT_XML_FEED: &str = "https://cap-feeds.s3.amazonaws.com/in.xml";

/// Retrieves an environment variable and splits it into a vector of strings based on a delimiter.
///
/// # Arguments
/// - `var`: The name of the environment variable.
/// - `delimiter`: The character to split the environment variable's value by.
///
/// # Returns
/// - `Vec<String>` with empty entries removed
pub fn get_env_var_as_vec(var: &str, delimiter: char) -> Vec<String> {
    env::var(var)
        .unwrap_or_default()
        .split(delimiter)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reads and parses an environment variable, falling back to `default` when unset.
pub fn get_env_var_or<T>(var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", var, e)),
        _ => Ok(default),
    }
}

/// Everything needed to build an `Aggregator` and a `Poller`.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub sources: Vec<SourceDescriptor>,
    pub poll_minutes: u64,
    pub region: String,
    pub policy: AlertPolicy,
}

impl WatchConfig {
    pub fn from_env() -> Result<Self> {
        let timeout = Duration::from_secs(get_env_var_or(
            "HAZARD_TIMEOUT_SECS",
            REQUEST_TIMEOUT.as_secs(),
        )?);
        let proxy = env::var("HAZARD_PROXY_URL").ok().filter(|p| !p.trim().is_empty());

        let mut json_urls = get_env_var_as_vec("HAZARD_JSON_URLS", ';');
        if env::var("HAZARD_JSON_URLS").is_err() {
            json_urls.push(DEFAULT_JSON_FEED.to_string());
        }
        let mut xml_urls = get_env_var_as_vec("HAZARD_XML_URLS", ';');
        if env::var("HAZARD_XML_URLS").is_err() {
            xml_urls.push(DEFAULT_XML_FEED.to_string());
        }

        let mut sources = Vec::new();
        for url in json_urls {
            sources.push(SourceDescriptor::json(url).with_timeout(timeout));
        }
        for url in xml_urls {
            sources.push(SourceDescriptor::xml(url).with_timeout(timeout));
        }
        for source in sources.iter() {
            if !is_valid_url(&source.url) {
                return Err(ConfigError::InvalidUrl(source.url.clone()).into());
            }
        }
        if let Some(proxy) = proxy {
            sources = sources
                .into_iter()
                .map(|s| s.via_proxy(&proxy))
                .collect::<Result<_, _>>()
                .with_context(|| format!("Invalid HAZARD_PROXY_URL: {}", proxy))?;
        }
        if sources.is_empty() {
            return Err(ConfigError::NoSources.into());
        }

        let mut severity = SeverityPolicy::default();
        let severe = get_env_var_as_vec("HAZARD_SEVERE_TERMS", ';');
        if !severe.is_empty() {
            severity.severe_terms = severe;
        }
        let moderate = get_env_var_as_vec("HAZARD_MODERATE_TERMS", ';');
        if !moderate.is_empty() {
            severity.moderate_terms = moderate;
        }

        let matching = match env::var("HAZARD_REGION_MATCH")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "" | "substring" => RegionMatch::Substring,
            "token" => RegionMatch::Token,
            other => bail!("Invalid HAZARD_REGION_MATCH: {}", other),
        };

        Ok(WatchConfig {
            sources,
            poll_minutes: get_env_var_or("HAZARD_POLL_MINUTES", DEFAULT_POLL_MINUTES)?,
            region: env::var("HAZARD_REGION").unwrap_or_else(|_| ALL_REGIONS.to_string()),
            policy: AlertPolicy {
                severity,
                region: RegionPolicy {
                    matching,
                    ..RegionPolicy::default()
                },
            },
        })
    }
}
