use crate::constants::{AWS_API, AWS_NAME, AZURE_API, AZURE_NAME, GCP_API, GCP_NAME};
use crate::error::ProviderError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The cloud providers whose billing data is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "AWS", alias = "aws")]
    Aws,
    #[serde(rename = "Azure", alias = "azure")]
    Azure,
    #[serde(rename = "GCP", alias = "gcp")]
    Gcp,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Azure, Provider::Gcp];

    /// Lowercase identifier used on the CLI and in URL paths.
    pub fn api_name(self) -> &'static str {
        match self {
            Provider::Aws => AWS_API,
            Provider::Azure => AZURE_API,
            Provider::Gcp => GCP_API,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Aws => AWS_NAME,
            Provider::Azure => AZURE_NAME,
            Provider::Gcp => GCP_NAME,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Provider::ALL
            .into_iter()
            .find(|p| p.api_name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown provider '{wanted}'"))
    }
}

/// A date as the provider reported it, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDate {
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
    /// Compact `YYYYMMDD` number, e.g. Azure's `UsageDate` column.
    Numeric(i64),
    Missing,
}

/// One provider row as returned by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub date: RawDate,
    pub service: Option<String>,
    pub cost_usd: Option<f64>,
}

/// Provider-agnostic billing row. Dates serialize as `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub date: NaiveDate,
    pub service: Option<String>,
    pub cost_usd: Option<f64>,
}

impl CanonicalRecord {
    pub fn new(date: NaiveDate, service: impl Into<String>, cost_usd: f64) -> Self {
        Self {
            date,
            service: Some(service.into()),
            cost_usd: Some(cost_usd),
        }
    }
}

impl From<CanonicalRecord> for RawRecord {
    fn from(record: CanonicalRecord) -> Self {
        RawRecord {
            date: RawDate::Date(record.date),
            service: record.service,
            cost_usd: record.cost_usd,
        }
    }
}

/// Raw rows fetched from one provider in one ingestion run.
#[derive(Debug, Clone)]
pub struct ProviderBatch {
    pub provider: Provider,
    pub records: Vec<RawRecord>,
}

/// Core trait that every billing data source implements
#[async_trait::async_trait]
pub trait CostSource: Send + Sync {
    fn provider(&self) -> Provider;

    /// Fetch daily per-service cost rows with `start` and `end` both inclusive.
    async fn fetch(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<RawRecord>, ProviderError>;
}
