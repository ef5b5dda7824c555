//! Severity normalization and region matching rules.
//!
//! Upstream feeds use free-form severity words and locality strings, so both
//! rules are data rather than code and can be tuned per deployment.

use super::types::Severity;

/// Region value meaning "show everything".
pub const ALL_REGIONS: &str = "All India";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeverityPolicy {
    pub severe_terms: Vec<String>,
    pub moderate_terms: Vec<String>,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        SeverityPolicy {
            severe_terms: vec!["high".to_string(), "severe".to_string()],
            moderate_terms: vec!["moderate".to_string(), "medium".to_string()],
        }
    }
}

impl SeverityPolicy {
    /// Case-insensitive lookup; anything unrecognized is `Info`.
    pub fn normalize(&self, raw: &str) -> Severity {
        let raw = raw.trim();
        if self.severe_terms.iter().any(|t| t.eq_ignore_ascii_case(raw)) {
            Severity::Severe
        } else if self.moderate_terms.iter().any(|t| t.eq_ignore_ascii_case(raw)) {
            Severity::Moderate
        } else {
            Severity::Info
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMatch {
    /// Region appears anywhere in the area text.
    Substring,
    /// Region equals one of the `,`/`;`/`and` separated parts of the area text.
    Token,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPolicy {
    pub no_filter: Vec<String>,
    pub matching: RegionMatch,
}

impl Default for RegionPolicy {
    fn default() -> Self {
        RegionPolicy {
            no_filter: vec![ALL_REGIONS.to_string(), String::new()],
            matching: RegionMatch::Substring,
        }
    }
}

impl RegionPolicy {
    pub fn is_unfiltered(&self, region: &str) -> bool {
        let region = region.trim();
        self.no_filter.iter().any(|r| r.trim().eq_ignore_ascii_case(region))
    }

    pub fn matches(&self, region: &str, area: &str) -> bool {
        if self.is_unfiltered(region) {
            return true;
        }
        let region = region.trim().to_lowercase();
        let area = area.to_lowercase();
        match self.matching {
            RegionMatch::Substring => area.contains(&region),
            RegionMatch::Token => area
                .split([',', ';'])
                .flat_map(|part| part.split(" and "))
                .any(|part| part.trim() == region),
        }
    }
}

/// Rules applied while normalizing and filtering alerts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertPolicy {
    pub severity: SeverityPolicy,
    pub region: RegionPolicy,
}
