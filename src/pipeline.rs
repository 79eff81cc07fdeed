//! Ingestion runs: fetch from every requested provider, normalize, persist.

pub mod normalize;

use crate::apis::SourceFactory;
use crate::config::StoreNames;
use crate::error::{CostError, ProviderError, Result};
use crate::pipeline::normalize::normalize;
use crate::storage::CsvStore;
use crate::types::{CanonicalRecord, CostSource, Provider, ProviderBatch, RawRecord};
use chrono::NaiveDate;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, instrument, Instrument};
use uuid::Uuid;

/// Body of an ingestion trigger. Both bounds are inclusive.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Providers to ingest; all of them when absent.
    #[serde(default)]
    pub providers: Option<Vec<Provider>>,
}

impl IngestRequest {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end, providers: None }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(CostError::Validation(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        if matches!(&self.providers, Some(p) if p.is_empty()) {
            return Err(CostError::Validation("providers must not be empty".to_string()));
        }
        Ok(())
    }

    /// Requested providers in canonical order, without duplicates.
    pub fn providers(&self) -> Vec<Provider> {
        match &self.providers {
            None => Provider::ALL.to_vec(),
            Some(list) => Provider::ALL.into_iter().filter(|p| list.contains(p)).collect(),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub status: String,
    pub count: usize,
}

impl IngestSummary {
    fn ok(count: usize) -> Self {
        Self { status: "ok".to_string(), count }
    }
}

/// Validate the request, build its adapters, then run it.
///
/// Adapters are constructed before any fetch starts, so missing credentials
/// surface as a validation failure with nothing fetched.
pub async fn ingest(
    factory: &dyn SourceFactory,
    store: Arc<CsvStore>,
    names: &StoreNames,
    request: &IngestRequest,
    fetch_timeout: Duration,
) -> Result<IngestSummary> {
    request.validate()?;
    let sources = request
        .providers()
        .into_iter()
        .map(|p| factory.build(p))
        .collect::<Result<Vec<_>>>()?;
    run_ingestion(sources, store, names, request, fetch_timeout).await
}

/// Fetch every source concurrently, then normalize and persist each batch.
///
/// Any failed or timed-out fetch fails the whole run and nothing is written.
#[instrument(skip(sources, store, names), fields(run_id = %Uuid::new_v4(), start = %request.start, end = %request.end))]
pub async fn run_ingestion(
    sources: Vec<Arc<dyn CostSource>>,
    store: Arc<CsvStore>,
    names: &StoreNames,
    request: &IngestRequest,
    fetch_timeout: Duration,
) -> Result<IngestSummary> {
    request.validate()?;
    counter!("finops_ingestion_runs_total").increment(1);
    let started = Instant::now();

    let batches = match fetch_all(sources, request.start, request.end, fetch_timeout).await {
        Ok(batches) => batches,
        Err(e) => {
            counter!("finops_ingestion_failures_total").increment(1);
            error!(error = %e, "ingestion run failed, nothing persisted");
            return Err(e);
        }
    };

    // Normalize everything first so a bad row from any provider persists nothing.
    // The store then checks every target before appending to any of them.
    let mut normalized = Vec::with_capacity(batches.len());
    for batch in &batches {
        let records = normalize(std::slice::from_ref(batch)).map_err(|e| {
            counter!("finops_ingestion_failures_total").increment(1);
            e
        })?;
        normalized.push((batch.provider, records));
    }

    let providers = normalized.len();
    let count = persist(store, names, normalized).await?;

    histogram!("finops_ingestion_duration_seconds").record(started.elapsed().as_secs_f64());
    info!(count, providers, "ingestion run complete");
    Ok(IngestSummary::ok(count))
}

/// Append every provider's records in one store call on the blocking pool.
async fn persist(
    store: Arc<CsvStore>,
    names: &StoreNames,
    normalized: Vec<(Provider, Vec<CanonicalRecord>)>,
) -> Result<usize> {
    let targets: Vec<(String, Vec<CanonicalRecord>)> = normalized
        .into_iter()
        .map(|(provider, records)| (names.for_provider(provider).to_string(), records))
        .collect();
    tokio::task::spawn_blocking(move || {
        let batches: Vec<(&str, &[CanonicalRecord])> = targets
            .iter()
            .map(|(name, records)| (name.as_str(), records.as_slice()))
            .collect();
        store.save_all(&batches)
    })
    .await?
    .map_err(|e| {
        counter!("finops_ingestion_failures_total").increment(1);
        e
    })
}

async fn fetch_all(
    sources: Vec<Arc<dyn CostSource>>,
    start: NaiveDate,
    end: NaiveDate,
    fetch_timeout: Duration,
) -> Result<Vec<ProviderBatch>> {
    let handles: Vec<_> = sources
        .into_iter()
        .map(|source| {
            let provider = source.provider();
            let span = info_span!("fetch", provider = %provider);
            let handle = tokio::spawn(
                async move { fetch_one(source.as_ref(), start, end, fetch_timeout).await }.instrument(span),
            );
            (provider, handle)
        })
        .collect();

    // Join every task before reporting, so no fetch outlives the run.
    let mut outcomes = Vec::with_capacity(handles.len());
    for (provider, handle) in handles {
        let outcome = handle
            .await
            .unwrap_or_else(|e| Err(ProviderError::Task(e.to_string())));
        outcomes.push((provider, outcome));
    }

    outcomes
        .into_iter()
        .map(|(provider, outcome)| {
            outcome
                .map(|records| ProviderBatch { provider, records })
                .map_err(|e| CostError::ingestion(provider, e))
        })
        .collect()
}

async fn fetch_one(
    source: &dyn CostSource,
    start: NaiveDate,
    end: NaiveDate,
    fetch_timeout: Duration,
) -> std::result::Result<Vec<RawRecord>, ProviderError> {
    let provider = source.provider().api_name();
    let started = Instant::now();
    let outcome = match tokio::time::timeout(fetch_timeout, source.fetch(start, end)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(fetch_timeout)),
    };
    histogram!("finops_fetch_duration_seconds", "provider" => provider)
        .record(started.elapsed().as_secs_f64());

    match &outcome {
        Ok(records) => {
            histogram!("finops_fetched_records", "provider" => provider).record(records.len() as f64);
            info!(records = records.len(), "fetch complete");
        }
        Err(e) => error!(error = %e, "fetch failed"),
    }
    outcome
}
