//! Billing API adapters, one per provider.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod sigv4;

use crate::config::Config;
use crate::dates::coerce_date;
use crate::error::{CostError, Result};
use crate::types::{CostSource, Provider, RawRecord};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::debug;

/// Builds the adapter for a provider.
pub trait SourceFactory: Send + Sync {
    fn build(&self, provider: Provider) -> Result<Arc<dyn CostSource>>;
}

/// Factory backed by the process configuration.
pub struct ConfigSourceFactory {
    config: Config,
}

impl ConfigSourceFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl SourceFactory for ConfigSourceFactory {
    fn build(&self, provider: Provider) -> Result<Arc<dyn CostSource>> {
        build_source(provider, &self.config)
    }
}

/// Construct a provider adapter, failing with `Validation` when its
/// credentials or identifiers are not configured.
pub fn build_source(provider: Provider, config: &Config) -> Result<Arc<dyn CostSource>> {
    let source: Arc<dyn CostSource> = match provider {
        Provider::Aws => Arc::new(aws::AwsCostSource::new(&config.aws, &config.ingestion)?),
        Provider::Azure => Arc::new(azure::AzureCostSource::new(&config.azure, &config.ingestion)?),
        Provider::Gcp => Arc::new(gcp::GcpCostSource::new(&config.gcp, &config.ingestion)?),
    };
    Ok(source)
}

/// Drop rows whose date falls outside `[start, end]`.
///
/// Rows with an unrecognized date are kept so the normalizer can reject them
/// with the offending value.
pub(crate) fn retain_in_range(records: Vec<RawRecord>, start: NaiveDate, end: NaiveDate) -> Vec<RawRecord> {
    let before = records.len();
    let kept: Vec<RawRecord> = records
        .into_iter()
        .filter(|r| coerce_date(&r.date).map_or(true, |d| d >= start && d <= end))
        .collect();
    if kept.len() != before {
        debug!(dropped = before - kept.len(), "dropped rows outside requested range");
    }
    kept
}

/// `host[:port]` of an endpoint URL, as sent in the `Host` header.
pub(crate) fn host_of(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| CostError::Config(format!("invalid endpoint '{endpoint}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| CostError::Config(format!("endpoint '{endpoint}' has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawDate;

    fn raw(date: RawDate) -> RawRecord {
        RawRecord { date, service: Some("svc".into()), cost_usd: Some(1.0) }
    }

    #[test]
    fn range_filter_is_inclusive_on_both_ends() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 3).unwrap();
        let records = vec![
            raw(RawDate::Text("2024-12-31".into())),
            raw(RawDate::Text("2025-01-01".into())),
            raw(RawDate::Numeric(20250103)),
            raw(RawDate::Text("2025-01-04".into())),
            raw(RawDate::Text("garbage".into())),
        ];
        let kept = retain_in_range(records, start, end);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].date, RawDate::Text("2025-01-01".into()));
        assert_eq!(kept[2].date, RawDate::Text("garbage".into()));
    }

    #[test]
    fn host_includes_non_default_port() {
        assert_eq!(host_of("https://ce.us-east-1.amazonaws.com").unwrap(), "ce.us-east-1.amazonaws.com");
        assert_eq!(host_of("http://127.0.0.1:9000").unwrap(), "127.0.0.1:9000");
        assert!(host_of("not a url").is_err());
    }

    #[test]
    fn unconfigured_providers_fail_validation() {
        let config = Config::default();
        for provider in Provider::ALL {
            assert!(
                matches!(build_source(provider, &config), Err(CostError::Validation(_))),
                "{provider}"
            );
        }
    }
}
