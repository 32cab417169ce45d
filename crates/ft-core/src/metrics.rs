//! Ingestion counters.
//!
//! Every verdict offered to the pipeline ends up in exactly one
//! counter: `ingested` or one of the skip reasons. The sink trait
//! keeps the pipeline decoupled from whatever metrics system hosts
//! the counters.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counter for verdicts applied to branch state.
pub const INGESTED_COUNTER: &str = "ingested";

/// Why a verdict was skipped instead of ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No commit position, or the sources were marked dirty.
    NoCommitData,
    /// The verdict referenced no known sources entry.
    NoSource,
    /// Every result was a skip or belonged to a claimed invocation.
    AllSkippedOrDuplicate,
    /// Presubmit run whose change did not land.
    UnsubmittedCode,
}

impl DropReason {
    pub fn counter(self) -> &'static str {
        match self {
            DropReason::NoCommitData => "skipped_no_commit_data",
            DropReason::NoSource => "skipped_no_source",
            DropReason::AllSkippedOrDuplicate => "skipped_all_skipped_or_duplicate",
            DropReason::UnsubmittedCode => "skipped_unsubmitted_code",
        }
    }
}

/// Destination for ingestion counters, labeled by project.
pub trait MetricSink: Send + Sync {
    fn increment(&self, counter: &'static str, project: &str, delta: u64);
}

/// Discards every increment.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn increment(&self, _counter: &'static str, _project: &str, _delta: u64) {}
}

/// Accumulates counters in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<(String, String), u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        InMemoryMetrics::default()
    }

    /// Current value of `counter` for `project`.
    pub fn get(&self, counter: &str, project: &str) -> u64 {
        let counters = self.counters.lock().unwrap();
        counters
            .get(&(counter.to_string(), project.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl MetricSink for InMemoryMetrics {
    fn increment(&self, counter: &'static str, project: &str, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut counters = self.counters.lock().unwrap();
        *counters
            .entry((counter.to_string(), project.to_string()))
            .or_insert(0) += delta;
    }
}
