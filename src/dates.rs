//! Date coercion shared by the normalizer and the tabular loader.

use crate::types::RawDate;
use chrono::{DateTime, NaiveDate, NaiveDateTime};

const DATE_TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse the textual date shapes providers and stores use.
///
/// Accepts `YYYY-MM-DD`, compact `YYYYMMDD`, RFC 3339 timestamps and naive
/// ISO date-times. Timestamps are truncated to their calendar date.
pub fn parse_date_text(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").ok();
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.date())
}

/// Resolve a provider date to a calendar date, `None` when the shape is not
/// recognized.
pub fn coerce_date(raw: &RawDate) -> Option<NaiveDate> {
    match raw {
        RawDate::Date(d) => Some(*d),
        RawDate::DateTime(dt) => Some(dt.date()),
        RawDate::Text(s) => parse_date_text(s),
        RawDate::Numeric(n) => parse_date_text(&n.to_string()),
        RawDate::Missing => None,
    }
}
