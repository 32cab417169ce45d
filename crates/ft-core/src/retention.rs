//! Retention enforcement for stored segments and statistics.
//!
//! Applied on every entry update, not as a separate sweep, so a branch
//! that keeps receiving verdicts also keeps shedding its oldest
//! finalized history.

use chrono::{DateTime, TimeDelta, Utc};

use crate::segment::Segment;
use crate::statistics::Statistics;
use ft_common::hour;

/// What one enforcement pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionStats {
    pub dropped_by_age: usize,
    pub dropped_by_count: usize,
}

impl RetentionStats {
    pub fn dropped(&self) -> usize {
        self.dropped_by_age + self.dropped_by_count
    }
}

/// Drops finalized segments past the retention horizon, caps the
/// survivors at `max_segments` newest, and prunes statistics buckets
/// past the same horizon.
///
/// `finalized` must be ordered oldest first; the finalizing segment is
/// never subject to retention and is not passed in.
pub fn apply(
    finalized: &mut Vec<Segment>,
    statistics: &mut Statistics,
    now: DateTime<Utc>,
    max_segments: usize,
    retention: TimeDelta,
) -> RetentionStats {
    let cutoff = now - retention;

    let before = finalized.len();
    // A segment ending exactly at the horizon is already too old.
    finalized.retain(|segment| match segment.end_hour {
        Some(end) => end > cutoff,
        None => true,
    });
    let dropped_by_age = before - finalized.len();

    let dropped_by_count = finalized.len().saturating_sub(max_segments);
    if dropped_by_count > 0 {
        finalized.drain(..dropped_by_count);
    }

    statistics.prune_before(hour::hour_index(cutoff));

    RetentionStats {
        dropped_by_age,
        dropped_by_count,
    }
}
