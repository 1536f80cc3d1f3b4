//! Timestamp parsing and the trailing recency window.
//!
//! SprintHub has no "updated since" filter, so recency is decided client-side
//! per page from each record's `updateDate`.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::crm::ExternalRecord;

/// Naive layouts accepted after RFC 3339 fails. Naive values are read as UTC.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d/%m/%Y, %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

/// Parse an ISO 8601 or day/month/year timestamp.
///
/// Returns `None` for anything unparseable; callers decide what "unknown"
/// means for them.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // PostgREST renders timestamptz as `2024-05-01 10:00:00+00`.
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    parse_date_only(s)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

fn parse_date_only(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Parse a calendar date, accepting a full timestamp and keeping its date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    parse_date_only(s).or_else(|| parse_timestamp(s).map(|dt| dt.date_naive()))
}

/// Trailing window, e.g. "updated within the last 48 hours".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecencyWindow {
    window: Duration,
}

impl RecencyWindow {
    pub fn hours(hours: u32) -> Self {
        Self {
            window: Duration::hours(i64::from(hours)),
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    /// A record with a missing or unparseable `updateDate` is never recent.
    pub fn is_recent(&self, record: &ExternalRecord, now: DateTime<Utc>) -> bool {
        record
            .update_date
            .as_deref()
            .and_then(parse_timestamp)
            .is_some_and(|ts| ts >= self.cutoff(now))
    }

    pub fn filter(&self, records: Vec<ExternalRecord>, now: DateTime<Utc>) -> Vec<ExternalRecord> {
        records
            .into_iter()
            .filter(|r| self.is_recent(r, now))
            .collect()
    }
}
