//! Batch admission filter.
//!
//! Decides which verdicts of a batch contribute to branch analysis.
//! Skipped results and results from invocations already claimed by
//! another ingested invocation are pruned first; then each verdict
//! must reference clean, position-bearing sources, and presubmit
//! verdicts must come from a run that landed its changes. Every
//! dropped verdict lands in exactly one skip counter.

use std::collections::BTreeSet;

use super::model::{invocation_from_result_name, IngestionTask, TaskVerdict, TestStatus};
use crate::metrics::{DropReason, MetricSink};

/// Filters one batch, returning the surviving verdicts with their
/// pruned result lists.
pub fn filter_batch(
    task: &IngestionTask,
    verdicts: &[TaskVerdict],
    duplicate_invocations: &BTreeSet<String>,
    metrics: &dyn MetricSink,
) -> ft_common::Result<Vec<TaskVerdict>> {
    let mut survivors = Vec::with_capacity(verdicts.len());
    for verdict in verdicts {
        let had_results = !verdict.results.is_empty();
        let mut kept_results = Vec::with_capacity(verdict.results.len());
        for result in &verdict.results {
            if result.status == TestStatus::Skip {
                continue;
            }
            let invocation = invocation_from_result_name(&result.name)?;
            if duplicate_invocations.contains(invocation) {
                continue;
            }
            kept_results.push(result.clone());
        }
        // A verdict that lost all its results carries no signal. One
        // that never had results still marks the test as present and
        // passes through to the source checks.
        if had_results && kept_results.is_empty() {
            metrics.increment(
                DropReason::AllSkippedOrDuplicate.counter(),
                &task.project,
                1,
            );
            continue;
        }

        let Some(sources) = task.sources.get(&verdict.sources_id) else {
            metrics.increment(DropReason::NoSource.counter(), &task.project, 1);
            continue;
        };
        if sources.commit_position().is_none() || sources.is_dirty {
            metrics.increment(DropReason::NoCommitData.counter(), &task.project, 1);
            continue;
        }
        if task.presubmit.as_ref().is_some_and(|p| !p.landed())
            && !sources.changelists.is_empty()
        {
            metrics.increment(DropReason::UnsubmittedCode.counter(), &task.project, 1);
            continue;
        }

        let mut kept = verdict.clone();
        kept.results = kept_results;
        survivors.push(kept);
    }
    Ok(survivors)
}
