//! Verdict ingestion pipeline.
//!
//! [`IngestionPipeline::analyze`] takes one task, splits its verdicts
//! into batches, and applies each batch exactly once: a batch commits
//! its branch mutations, its checkpoint, and its invocation claims in
//! one store transaction, then reports the updated branches. Version
//! conflicts with concurrent writers are retried with jittered
//! backoff; redelivered batches no-op against their checkpoint.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::branch::Entry;
use crate::config::AnalysisConfig;
use crate::detector::ChangepointDetector;
use crate::export::{branch_row, BranchRow, Exporter};
use crate::metrics::{MetricSink, INGESTED_COUNTER};
use crate::store::{
    AnalysisStore, BranchTransaction, BranchWrite, CheckpointKey, CommitOutcome, InvocationClaim,
    Version,
};
use crate::verdict::{PositionVerdict, ResultCounts, Run, VerdictDetails};
use ft_common::{hour::truncate_to_hour, BranchKey, Error, SourceRef, Variant};

pub mod filter;
pub mod model;

pub use filter::filter_batch;
pub use model::{
    invocation_from_result_name, Changelist, GitilesCommit, IngestionTask, PresubmitContext,
    PresubmitMode, PresubmitStatus, Sources, TaskResult, TaskVerdict, TestStatus,
};

/// A surviving verdict resolved to its branch.
struct PreparedVerdict {
    key: BranchKey,
    variant: Variant,
    source_ref: SourceRef,
    verdict: PositionVerdict,
}

/// Working state for one branch within a commit attempt.
struct BranchState {
    entry: Entry,
    expect: Option<Version>,
    applied: u64,
}

/// Drives verdict batches through filtering, branch analysis, commit,
/// and reporting.
pub struct IngestionPipeline {
    store: Arc<dyn AnalysisStore>,
    detector: Arc<dyn ChangepointDetector>,
    metrics: Arc<dyn MetricSink>,
    exporter: Exporter,
    config: AnalysisConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        detector: Arc<dyn ChangepointDetector>,
        metrics: Arc<dyn MetricSink>,
        exporter: Exporter,
        config: AnalysisConfig,
    ) -> ft_common::Result<Self> {
        config.validate()?;
        Ok(IngestionPipeline {
            store,
            detector,
            metrics,
            exporter,
            config,
        })
    }

    /// Analyzes every verdict of the task, in batches.
    pub fn analyze(&self, task: &IngestionTask) -> ft_common::Result<()> {
        self.analyze_at(task, Utc::now())
    }

    /// Like [`analyze`](Self::analyze) with an explicit retention
    /// reference time.
    pub fn analyze_at(&self, task: &IngestionTask, now: DateTime<Utc>) -> ft_common::Result<()> {
        for (batch_index, batch) in task.verdicts.chunks(self.config.batch_size).enumerate() {
            self.analyze_batch(task, batch, batch_index, now)?;
        }
        Ok(())
    }

    fn analyze_batch(
        &self,
        task: &IngestionTask,
        batch: &[TaskVerdict],
        batch_index: usize,
        now: DateTime<Utc>,
    ) -> ft_common::Result<()> {
        let checkpoint = CheckpointKey {
            project: task.project.clone(),
            ingested_invocation_id: task.ingested_invocation_id.clone(),
            batch_index,
        };
        if self.store.is_batch_applied(&checkpoint)? {
            debug!(
                project = %task.project,
                invocation = %task.ingested_invocation_id,
                batch = batch_index,
                "batch already applied, skipping"
            );
            return Ok(());
        }

        let duplicates = self.duplicate_invocations(task, batch)?;
        let survivors = filter_batch(task, batch, &duplicates, self.metrics.as_ref())?;
        if survivors.is_empty() {
            return Ok(());
        }

        let prepared = prepare_verdicts(task, &survivors)?;
        let claims = claims_for(&survivors, &task.ingested_invocation_id)?;

        for attempt in 1..=self.config.retry.max_attempts {
            if self.attempt_batch(task, &prepared, &claims, &checkpoint, now)? {
                return Ok(());
            }
            if attempt == self.config.retry.max_attempts {
                break;
            }
            let backoff = self.config.retry.backoff(attempt);
            warn!(
                project = %task.project,
                invocation = %task.ingested_invocation_id,
                batch = batch_index,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "branch commit conflicted, retrying"
            );
            std::thread::sleep(backoff);
        }
        Err(Error::RetryBudgetExhausted {
            attempts: self.config.retry.max_attempts,
        })
    }

    /// One read-analyze-commit attempt. Returns false on a version
    /// conflict, leaving the caller to retry.
    fn attempt_batch(
        &self,
        task: &IngestionTask,
        prepared: &[PreparedVerdict],
        claims: &[InvocationClaim],
        checkpoint: &CheckpointKey,
        now: DateTime<Utc>,
    ) -> ft_common::Result<bool> {
        let keys: Vec<BranchKey> = prepared
            .iter()
            .map(|p| p.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let read = self.store.read_branches(&keys)?;
        let stored: BTreeMap<&BranchKey, &(crate::branch::BranchRecord, Version)> = keys
            .iter()
            .zip(read.iter())
            .filter_map(|(key, slot)| slot.as_ref().map(|hit| (key, hit)))
            .collect();

        let mut branches: BTreeMap<BranchKey, BranchState> = BTreeMap::new();
        for p in prepared {
            let state = branches.entry(p.key.clone()).or_insert_with(|| {
                match stored.get(&p.key) {
                    Some((record, version)) => BranchState {
                        entry: Entry::from_record(record.clone()),
                        expect: Some(*version),
                        applied: 0,
                    },
                    None => BranchState {
                        entry: Entry::new(
                            p.key.clone(),
                            p.variant.clone(),
                            p.source_ref.clone(),
                            &self.config,
                        ),
                        expect: None,
                        applied: 0,
                    },
                }
            });
            if state
                .entry
                .should_discard_out_of_order(p.verdict.commit_position)
            {
                debug!(
                    branch = %p.key,
                    position = p.verdict.commit_position,
                    "discarding out-of-order verdict"
                );
                continue;
            }
            state.entry.ingest(
                vec![p.verdict.clone()],
                self.detector.as_ref(),
                &self.config,
                now,
            )?;
            state.applied += 1;
        }

        let applied_total: u64 = branches.values().map(|s| s.applied).sum();
        let writes: Vec<BranchWrite> = branches
            .values()
            .filter(|s| s.applied > 0)
            .map(|s| BranchWrite {
                key: s.entry.key.clone(),
                expect: s.expect,
                record: s.entry.to_record(),
            })
            .collect();

        let txn = BranchTransaction {
            project: task.project.clone(),
            checkpoint: checkpoint.clone(),
            writes,
            invocation_claims: claims.to_vec(),
        };
        let commit_time = match self.store.commit(txn) {
            Ok(CommitOutcome::Applied { commit_time }) => commit_time,
            // Another delivery of this batch won the race.
            Ok(CommitOutcome::AlreadyApplied) => return Ok(true),
            Err(Error::StoreConflict) => return Ok(false),
            Err(err) => return Err(err),
        };

        self.metrics
            .increment(INGESTED_COUNTER, &task.project, applied_total);
        let rows: Vec<BranchRow> = branches
            .values()
            .filter(|s| s.applied > 0)
            .map(|s| {
                branch_row(
                    &s.entry,
                    &s.entry.buffer_segments(self.detector.as_ref()),
                    commit_time,
                    self.config.recent_unexpected_window(),
                )
            })
            .collect();
        self.exporter.export(rows)?;
        Ok(true)
    }

    /// Invocations named by the batch that another ingested invocation
    /// already claimed. Results from those carry no new information.
    fn duplicate_invocations(
        &self,
        task: &IngestionTask,
        batch: &[TaskVerdict],
    ) -> ft_common::Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for verdict in batch {
            for result in &verdict.results {
                ids.insert(invocation_from_result_name(&result.name)?.to_string());
            }
        }
        let ids: Vec<String> = ids.into_iter().collect();
        let claimed = self.store.claimed_invocations(&task.project, &ids)?;
        Ok(claimed
            .into_iter()
            .filter(|(_, owner)| owner != &task.ingested_invocation_id)
            .map(|(id, _)| id)
            .collect())
    }
}

/// Resolves each surviving verdict to its branch key and position.
fn prepare_verdicts(
    task: &IngestionTask,
    survivors: &[TaskVerdict],
) -> ft_common::Result<Vec<PreparedVerdict>> {
    let hour = truncate_to_hour(task.partition_time);
    let mut out = Vec::with_capacity(survivors.len());
    for verdict in survivors {
        // The filter only passes verdicts with position-bearing sources.
        let Some(sources) = task.sources.get(&verdict.sources_id) else {
            continue;
        };
        let (Some(position), Some(source_ref)) =
            (sources.commit_position(), sources.source_ref())
        else {
            continue;
        };
        let key = BranchKey {
            project: task.project.clone(),
            test_id: verdict.test_id.clone(),
            variant_hash: verdict.variant_hash.clone(),
            ref_hash: source_ref.ref_hash(),
        };
        out.push(PreparedVerdict {
            key,
            variant: verdict.variant.clone(),
            source_ref,
            verdict: position_verdict(verdict, position, hour)?,
        });
    }
    Ok(out)
}

/// Folds a task verdict's results into runs, one per invocation.
fn position_verdict(
    verdict: &TaskVerdict,
    position: i64,
    hour: DateTime<Utc>,
) -> ft_common::Result<PositionVerdict> {
    let mut runs: BTreeMap<&str, Run> = BTreeMap::new();
    for result in &verdict.results {
        let invocation = invocation_from_result_name(&result.name)?;
        let run = runs.entry(invocation).or_default();
        let counts = if result.expected {
            &mut run.expected
        } else {
            &mut run.unexpected
        };
        match result.status {
            TestStatus::Pass => counts.pass_count += 1,
            TestStatus::Fail => counts.fail_count += 1,
            TestStatus::Crash => counts.crash_count += 1,
            TestStatus::Abort => counts.abort_count += 1,
            // The filter prunes skips before verdicts get here.
            TestStatus::Skip => {}
        }
    }

    let single_expected_pass = ResultCounts {
        pass_count: 1,
        ..Default::default()
    };
    let is_simple_pass = !verdict.is_exonerated
        && runs.len() == 1
        && runs
            .values()
            .all(|run| run.unexpected.is_empty() && run.expected == single_expected_pass);
    if is_simple_pass {
        return Ok(PositionVerdict::simple_pass(position, hour));
    }
    Ok(PositionVerdict::with_details(
        position,
        hour,
        VerdictDetails {
            is_exonerated: verdict.is_exonerated,
            runs: runs.into_values().collect(),
        },
    ))
}

/// Claims for every invocation contributing a surviving result.
fn claims_for(
    survivors: &[TaskVerdict],
    ingested_invocation_id: &str,
) -> ft_common::Result<Vec<InvocationClaim>> {
    let mut ids = BTreeSet::new();
    for verdict in survivors {
        for result in &verdict.results {
            ids.insert(invocation_from_result_name(&result.name)?.to_string());
        }
    }
    Ok(ids
        .into_iter()
        .map(|invocation_id| InvocationClaim {
            invocation_id,
            ingested_invocation_id: ingested_invocation_id.to_string(),
        })
        .collect())
}
