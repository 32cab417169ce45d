//! Hour arithmetic for partition-time bucketing.
//!
//! Verdict hours and statistics buckets are both keyed to UTC hour
//! boundaries; these helpers keep the truncation and index math in one
//! place.

use chrono::{DateTime, Utc};

pub const SECONDS_PER_HOUR: i64 = 3600;

/// Truncates a timestamp to the start of its UTC hour.
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_hour_index(hour_index(ts))
}

/// Hours since the Unix epoch (floor).
pub fn hour_index(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(SECONDS_PER_HOUR)
}

/// Timestamp at the start of the given hour index.
pub fn from_hour_index(hours: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(hours * SECONDS_PER_HOUR, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
