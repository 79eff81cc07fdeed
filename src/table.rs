//! Tabular loader: reads a store file into memory and derives calendar columns.

use crate::dates::parse_date_text;
use crate::error::{CostError, Result};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One loaded store row with its derived calendar fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostRow {
    pub date: NaiveDate,
    pub service: Option<String>,
    pub cost_usd: f64,
    pub region: Option<String>,
    /// `YYYY-MM`
    pub month: String,
    pub day: u32,
    pub weekday: String,
    pub year: i32,
}

impl CostRow {
    pub fn new(date: NaiveDate, service: Option<String>, cost_usd: f64, region: Option<String>) -> Self {
        Self {
            date,
            service,
            cost_usd,
            region,
            month: date.format("%Y-%m").to_string(),
            day: date.day(),
            weekday: date.format("%A").to_string(),
            year: date.year(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostTable {
    pub rows: Vec<CostRow>,
}

impl CostTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

struct Columns {
    date: usize,
    cost: usize,
    service: Option<usize>,
    region: Option<usize>,
}

pub fn load_table(path: &Path, store: &str) -> Result<CostTable> {
    let file = File::open(path)?;
    read_table(file, store)
}

/// A header cell with surrounding whitespace and any UTF-8 BOM removed.
pub(crate) fn header_field(raw: &str) -> &str {
    raw.trim_start_matches('\u{feff}').trim()
}

/// Parse a delimited table with a header row.
///
/// `date` and `cost_usd` columns are required; `service` and `region` are
/// optional and empty cells read as `None`. Costs that are not numeric load
/// as `0.0`. A row with the wrong number of fields or an unparseable date is
/// a data-integrity failure.
pub fn read_table<R: Read>(reader: R, store: &str) -> Result<CostTable> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| CostError::integrity(store, format!("unreadable header: {e}")))?
        .clone();

    let position = |name: &str| headers.iter().position(|h| header_field(h) == name);
    let cols = Columns {
        date: position("date").ok_or_else(|| CostError::integrity(store, "missing 'date' column"))?,
        cost: position("cost_usd")
            .ok_or_else(|| CostError::integrity(store, "missing 'cost_usd' column"))?,
        service: position("service"),
        region: position("region"),
    };

    let mut rows = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        // header is line 1
        let line = i + 2;
        let record = result.map_err(|e| CostError::integrity(store, format!("line {line}: {e}")))?;

        let raw_date = record.get(cols.date).unwrap_or_default();
        let date = parse_date_text(raw_date).ok_or_else(|| {
            CostError::integrity(store, format!("line {line}: unparseable date '{raw_date}'"))
        })?;
        let cost_usd = record
            .get(cols.cost)
            .and_then(|c| c.trim().parse::<f64>().ok())
            .filter(|c| c.is_finite())
            .unwrap_or(0.0);
        let text = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        rows.push(CostRow::new(date, text(cols.service), cost_usd, text(cols.region)));
    }

    Ok(CostTable { rows })
}
