//! Query layer: filters, tags and merges the per-provider stores.

use crate::config::StoreNames;
use crate::error::{CostError, Result};
use crate::storage::CsvStore;
use crate::table::CostRow;
use crate::types::Provider;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Optional, conjunctive filters for cost queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CostFilter {
    pub service: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Restricts the unified query to one provider's store.
    pub provider: Option<Provider>,
}

impl CostFilter {
    fn matches(&self, row: &CostRow) -> bool {
        let service_ok = match self.service.as_deref().filter(|s| !s.is_empty()) {
            Some(wanted) => row.service.as_deref() == Some(wanted),
            None => true,
        };
        service_ok
            && self.start_date.map_or(true, |start| row.date >= start)
            && self.end_date.map_or(true, |end| row.date <= end)
    }
}

/// A store row tagged with the provider it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCost {
    pub provider: Provider,
    #[serde(flatten)]
    pub row: CostRow,
}

/// Outcome of reading one provider's store.
#[derive(Debug)]
pub enum StoreLookup {
    Found(Vec<ProviderCost>),
    Missing,
}

/// Aggregates over a unified query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub record_count: usize,
    pub service_count: usize,
    pub month_count: u32,
    pub avg_monthly_usd: f64,
    pub by_provider: BTreeMap<Provider, f64>,
    pub by_service: BTreeMap<String, f64>,
    pub by_month: BTreeMap<String, f64>,
}

pub struct CostQuery {
    store: Arc<CsvStore>,
    names: StoreNames,
}

impl CostQuery {
    pub fn new(store: Arc<CsvStore>, names: StoreNames) -> Self {
        Self { store, names }
    }

    /// Read and filter one provider's store.
    #[instrument(skip(self, filter), fields(provider = %provider))]
    pub fn lookup(&self, provider: Provider, filter: &CostFilter) -> Result<StoreLookup> {
        let store_name = self.names.for_provider(provider);
        let Some(table) = self.store.load(store_name)? else {
            debug!(store = store_name, "store missing");
            return Ok(StoreLookup::Missing);
        };
        let rows = table
            .rows
            .into_iter()
            .filter(|row| filter.matches(row))
            .map(|row| ProviderCost { provider, row })
            .collect();
        Ok(StoreLookup::Found(rows))
    }

    /// Rows from one provider in store order; a missing store is `NotFound`.
    pub fn fetch_costs(&self, provider: Provider, filter: &CostFilter) -> Result<Vec<ProviderCost>> {
        match self.lookup(provider, filter)? {
            StoreLookup::Found(rows) => Ok(rows),
            StoreLookup::Missing => Err(CostError::NotFound(format!(
                "{provider} cost store '{}' not found",
                self.names.for_provider(provider)
            ))),
        }
    }

    /// Rows from every available provider, sorted ascending by date.
    ///
    /// Missing stores are skipped. When nothing matches at all the result is
    /// `NotFound`. Corrupt stores still fail the query.
    pub fn fetch_all_costs(&self, filter: &CostFilter) -> Result<Vec<ProviderCost>> {
        let mut merged = Vec::new();
        for provider in Provider::ALL {
            if filter.provider.is_some_and(|p| p != provider) {
                continue;
            }
            match self.lookup(provider, filter)? {
                StoreLookup::Found(rows) => merged.extend(rows),
                StoreLookup::Missing => continue,
            }
        }

        if merged.is_empty() {
            return Err(CostError::NotFound(
                "No cost data found for the specified filters".to_string(),
            ));
        }

        merged.sort_by_key(|r| r.row.date);
        Ok(merged)
    }

    pub fn summarize(&self, filter: &CostFilter) -> Result<CostSummary> {
        let rows = self.fetch_all_costs(filter)?;
        Ok(summarize_rows(&rows, filter))
    }
}

/// `rows` must be date-sorted and non-empty.
fn summarize_rows(rows: &[ProviderCost], filter: &CostFilter) -> CostSummary {
    let mut by_provider = BTreeMap::new();
    let mut by_service = BTreeMap::new();
    let mut by_month = BTreeMap::new();
    let mut services = BTreeSet::new();
    let mut total = 0.0;

    for r in rows {
        total += r.row.cost_usd;
        *by_provider.entry(r.provider).or_insert(0.0) += r.row.cost_usd;
        *by_month.entry(r.row.month.clone()).or_insert(0.0) += r.row.cost_usd;
        let service = r.row.service.clone().unwrap_or_default();
        *by_service.entry(service.clone()).or_insert(0.0) += r.row.cost_usd;
        services.insert(service);
    }

    let first = rows.first().map(|r| r.row.date);
    let last = rows.last().map(|r| r.row.date);
    let month_count = match (filter.start_date.or(first), filter.end_date.or(last)) {
        (Some(s), Some(e)) => months_spanned(s, e),
        _ => 0,
    };
    let avg_monthly_usd = if month_count > 0 { total / f64::from(month_count) } else { 0.0 };

    CostSummary {
        total_cost_usd: total,
        record_count: rows.len(),
        service_count: services.len(),
        month_count,
        avg_monthly_usd,
        by_provider,
        by_service,
        by_month,
    }
}

/// Calendar months touched by `[start, end]`, counting both ends.
fn months_spanned(start: NaiveDate, end: NaiveDate) -> u32 {
    let months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32 + 1;
    months.max(0) as u32
}
