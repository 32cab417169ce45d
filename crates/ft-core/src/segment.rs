//! Segments and verdict count accumulation.
//!
//! A segment is a maximal run of history over which a test's failure
//! behavior was homogeneous. Closed (finalized) segments carry their
//! full counts; the open (finalizing) segment is a lightweight marker
//! whose counts only cover verdicts already evicted from the input
//! buffer under capacity pressure. The rest of the open segment still
//! lives in the buffer and is merged in at export time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::verdict::PositionVerdict;

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Verdict, run and result tallies for a segment.
///
/// Every field is additive, so two disjoint spans of history can be
/// combined with [`Counts::add`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Counts {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expected_passed_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expected_failed_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expected_crashed_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expected_aborted_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_passed_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_failed_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_crashed_results: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_aborted_results: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_runs: u64,
    /// Runs with only unexpected results and no retry.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_unretried_runs: u64,
    /// Runs whose retries all came back unexpected as well.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_after_retry_runs: u64,
    /// Runs with both expected and unexpected results.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flaky_runs: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_verdicts: u64,
    /// Verdicts with only unexpected results, exonerations excluded.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub unexpected_verdicts: u64,
    /// Verdicts with a mix of expected and unexpected results,
    /// exonerations excluded.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flaky_verdicts: u64,
}

impl Counts {
    pub fn is_empty(&self) -> bool {
        *self == Counts::default()
    }

    /// Field-wise sum.
    pub fn add(&mut self, other: &Counts) {
        self.total_results += other.total_results;
        self.unexpected_results += other.unexpected_results;
        self.expected_passed_results += other.expected_passed_results;
        self.expected_failed_results += other.expected_failed_results;
        self.expected_crashed_results += other.expected_crashed_results;
        self.expected_aborted_results += other.expected_aborted_results;
        self.unexpected_passed_results += other.unexpected_passed_results;
        self.unexpected_failed_results += other.unexpected_failed_results;
        self.unexpected_crashed_results += other.unexpected_crashed_results;
        self.unexpected_aborted_results += other.unexpected_aborted_results;
        self.total_runs += other.total_runs;
        self.unexpected_unretried_runs += other.unexpected_unretried_runs;
        self.unexpected_after_retry_runs += other.unexpected_after_retry_runs;
        self.flaky_runs += other.flaky_runs;
        self.total_verdicts += other.total_verdicts;
        self.unexpected_verdicts += other.unexpected_verdicts;
        self.flaky_verdicts += other.flaky_verdicts;
    }

    /// Folds one verdict into the tallies.
    pub fn record_verdict(&mut self, verdict: &PositionVerdict) {
        self.total_verdicts += 1;
        if verdict.is_simple_expected_pass {
            self.total_results += 1;
            self.total_runs += 1;
            self.expected_passed_results += 1;
            return;
        }

        let details = &verdict.details;
        let mut expected_total: u64 = 0;
        let mut unexpected_total: u64 = 0;
        for run in &details.runs {
            self.total_runs += 1;
            let expected = run.expected.total();
            let unexpected = run.unexpected.total();
            expected_total += expected;
            unexpected_total += unexpected;

            self.total_results += expected + unexpected;
            self.unexpected_results += unexpected;
            self.expected_passed_results += run.expected.pass_count;
            self.expected_failed_results += run.expected.fail_count;
            self.expected_crashed_results += run.expected.crash_count;
            self.expected_aborted_results += run.expected.abort_count;
            self.unexpected_passed_results += run.unexpected.pass_count;
            self.unexpected_failed_results += run.unexpected.fail_count;
            self.unexpected_crashed_results += run.unexpected.crash_count;
            self.unexpected_aborted_results += run.unexpected.abort_count;

            if unexpected > 0 {
                if expected > 0 {
                    self.flaky_runs += 1;
                } else if unexpected == 1 {
                    self.unexpected_unretried_runs += 1;
                } else {
                    self.unexpected_after_retry_runs += 1;
                }
            }
        }

        // Exonerated verdicts keep their result tallies but are not
        // classified as unexpected or flaky.
        if unexpected_total > 0 && !details.is_exonerated {
            if expected_total == 0 {
                self.unexpected_verdicts += 1;
            } else {
                self.flaky_verdicts += 1;
            }
        }
    }
}

/// Lifecycle state of a stored segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Open: the newest verdicts of this regime are still buffered.
    Finalizing,
    /// Closed: all verdicts of this regime left the buffer.
    Finalized,
}

/// A stored regime of test behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Segment {
    pub state: SegmentState,
    /// Whether the segment opens with a detected changepoint. The
    /// first segment of a branch has no starting changepoint.
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_start_changepoint: bool,
    /// Position of the first verdict in the segment.
    pub start_position: i64,
    /// Hour of the first verdict in the segment.
    pub start_hour: DateTime<Utc>,
    /// 99% credible bounds on the starting changepoint position, set
    /// only when `has_start_changepoint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position_lower_bound_99: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position_upper_bound_99: Option<i64>,
    /// Position of the last verdict, set once the segment closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_hour: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub most_recent_unexpected_result_hour: Option<DateTime<Utc>>,
    /// Counts over verdicts evicted from the input buffer. For a
    /// finalized segment this covers the whole regime; for a
    /// finalizing one only the part evicted under capacity pressure.
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub finalized_counts: Counts,
}

impl Segment {
    pub fn is_finalized(&self) -> bool {
        self.state == SegmentState::Finalized
    }

    /// Raises `most_recent_unexpected_result_hour` to `hour` if later.
    pub fn observe_unexpected_hour(&mut self, hour: Option<DateTime<Utc>>) {
        self.most_recent_unexpected_result_hour =
            merge_unexpected_hour(self.most_recent_unexpected_result_hour, hour);
    }
}

/// Max of two optional hours.
pub fn merge_unexpected_hour(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
