//! Reconciles raw provider rows into canonical records.

use crate::dates::coerce_date;
use crate::error::{CostError, ProviderError, Result};
use crate::types::{CanonicalRecord, ProviderBatch, RawDate};
use tracing::debug;

/// Flatten raw batches into canonical records, preserving input order.
///
/// Records keep the order they arrived in: every row of the first batch,
/// then the second, and so on. Missing service or cost values stay `None`.
/// A date that cannot be resolved to a calendar date fails the batch's
/// provider instead of being written through.
pub fn normalize(batches: &[ProviderBatch]) -> Result<Vec<CanonicalRecord>> {
    let total = batches.iter().map(|b| b.records.len()).sum();
    let mut unified = Vec::with_capacity(total);

    for batch in batches {
        for raw in &batch.records {
            let date = coerce_date(&raw.date).ok_or_else(|| {
                CostError::ingestion(
                    batch.provider,
                    ProviderError::Decode(format!("unrecognized date {}", describe(&raw.date))),
                )
            })?;
            unified.push(CanonicalRecord {
                date,
                service: raw.service.clone(),
                cost_usd: raw.cost_usd,
            });
        }
        debug!(provider = %batch.provider, records = batch.records.len(), "normalized batch");
    }

    Ok(unified)
}

fn describe(raw: &RawDate) -> String {
    match raw {
        RawDate::Text(s) => format!("'{s}'"),
        RawDate::Numeric(n) => n.to_string(),
        RawDate::Missing => "<missing>".to_string(),
        other => format!("{other:?}"),
    }
}
