//! Per-branch eviction statistics.
//!
//! When verdicts leave the input buffer their per-hour totals are
//! folded into hourly buckets. The buckets answer "how much history
//! did this branch see around hour X" long after the verdicts
//! themselves are gone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::verdict::PositionVerdict;
use ft_common::hour;

/// Verdict total for one UTC hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HourBucket {
    /// Hours since the Unix epoch.
    pub hour: i64,
    pub total_verdicts: u64,
}

/// Hourly verdict totals, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Statistics {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hourly_buckets: Vec<HourBucket>,
}

impl Statistics {
    pub fn is_empty(&self) -> bool {
        self.hourly_buckets.is_empty()
    }

    pub fn total_verdicts(&self) -> u64 {
        self.hourly_buckets.iter().map(|b| b.total_verdicts).sum()
    }

    /// Total for one hour index, if a bucket exists.
    pub fn bucket(&self, hour: i64) -> Option<u64> {
        self.hourly_buckets
            .binary_search_by_key(&hour, |b| b.hour)
            .ok()
            .map(|idx| self.hourly_buckets[idx].total_verdicts)
    }

    /// Folds evicted verdicts into their hourly buckets.
    pub fn record_evicted(&mut self, verdicts: &[PositionVerdict]) {
        if verdicts.is_empty() {
            return;
        }
        let mut merged: BTreeMap<i64, u64> = self
            .hourly_buckets
            .iter()
            .map(|b| (b.hour, b.total_verdicts))
            .collect();
        for verdict in verdicts {
            *merged.entry(hour::hour_index(verdict.hour)).or_insert(0) += 1;
        }
        self.hourly_buckets = merged
            .into_iter()
            .map(|(hour, total_verdicts)| HourBucket {
                hour,
                total_verdicts,
            })
            .collect();
    }

    /// Drops buckets at or before `cutoff_hour`.
    pub fn prune_before(&mut self, cutoff_hour: i64) {
        self.hourly_buckets.retain(|b| b.hour > cutoff_hour);
    }
}
