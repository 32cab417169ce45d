//! Position verdict model.
//!
//! A verdict summarizes every result a test produced at one source
//! position within one ingested root invocation. Verdicts are the unit
//! the input buffer stores and the changepoint detector consumes.
//!
//! The overwhelmingly common verdict is a single expected pass. Those
//! are stored with `is_simple_expected_pass` set and empty details so
//! they serialize to a handful of bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Result tallies by outcome kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResultCounts {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pass_count: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fail_count: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub crash_count: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub abort_count: u64,
}

impl ResultCounts {
    pub fn total(&self) -> u64 {
        self.pass_count + self.fail_count + self.crash_count + self.abort_count
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Results from a single test run (one invocation attempt).
///
/// A run groups the results that share an immediate invocation; retries
/// within the run land in the same bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Run {
    #[serde(default, skip_serializing_if = "ResultCounts::is_empty")]
    pub expected: ResultCounts,
    #[serde(default, skip_serializing_if = "ResultCounts::is_empty")]
    pub unexpected: ResultCounts,
}

impl Run {
    /// A run with both expected and unexpected results.
    pub fn is_flaky(&self) -> bool {
        self.expected.total() > 0 && self.unexpected.total() > 0
    }

    pub fn total_results(&self) -> u64 {
        self.expected.total() + self.unexpected.total()
    }
}

/// Everything a verdict records beyond the common all-pass case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VerdictDetails {
    /// The failure was exonerated, e.g. because it also occurs at tip of
    /// tree. Exonerated verdicts keep their result counts but do not
    /// count as failing observations.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_exonerated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<Run>,
}

impl VerdictDetails {
    pub fn is_empty(&self) -> bool {
        !self.is_exonerated && self.runs.is_empty()
    }
}

/// One test verdict at one source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PositionVerdict {
    pub commit_position: i64,
    /// Partition time of the ingested invocation, truncated to the hour.
    pub hour: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_simple_expected_pass: bool,
    #[serde(default, skip_serializing_if = "VerdictDetails::is_empty")]
    pub details: VerdictDetails,
}

impl PositionVerdict {
    /// The compact form of the common case: one run, one expected pass.
    pub fn simple_pass(commit_position: i64, hour: DateTime<Utc>) -> Self {
        PositionVerdict {
            commit_position,
            hour,
            is_simple_expected_pass: true,
            details: VerdictDetails::default(),
        }
    }

    pub fn with_details(commit_position: i64, hour: DateTime<Utc>, details: VerdictDetails) -> Self {
        PositionVerdict {
            commit_position,
            hour,
            is_simple_expected_pass: false,
            details,
        }
    }

    /// Whether any run carries an unexpected result.
    pub fn has_unexpected_results(&self) -> bool {
        !self.is_simple_expected_pass
            && self
                .details
                .runs
                .iter()
                .any(|run| run.unexpected.total() > 0)
    }

    /// Whether the detector should treat this verdict as failing.
    /// Exonerated failures read as passing so that a mass exoneration
    /// does not register as a regime change.
    pub fn is_failing_observation(&self) -> bool {
        self.has_unexpected_results() && !self.details.is_exonerated
    }

    /// Ordering key for buffer storage: position, then hour.
    pub fn sort_key(&self) -> (i64, DateTime<Utc>) {
        (self.commit_position, self.hour)
    }
}

/// Latest hour at which any of the given verdicts saw an unexpected
/// result. Exonerated verdicts participate.
pub fn latest_unexpected_hour(verdicts: &[PositionVerdict]) -> Option<DateTime<Utc>> {
    verdicts
        .iter()
        .filter(|v| v.has_unexpected_results())
        .map(|v| v.hour)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(h * 3600, 0).unwrap()
    }

    fn failing_details() -> VerdictDetails {
        VerdictDetails {
            is_exonerated: false,
            runs: vec![Run {
                expected: ResultCounts::default(),
                unexpected: ResultCounts {
                    fail_count: 1,
                    ..Default::default()
                },
            }],
        }
    }

    #[test]
    fn simple_pass_has_no_unexpected_results() {
        let v = PositionVerdict::simple_pass(10, hour(1));
        assert!(v.is_simple_expected_pass);
        assert!(!v.has_unexpected_results());
        assert!(!v.is_failing_observation());
    }

    #[test]
    fn failing_verdict_is_a_failing_observation() {
        let v = PositionVerdict::with_details(10, hour(1), failing_details());
        assert!(v.has_unexpected_results());
        assert!(v.is_failing_observation());
    }

    #[test]
    fn exoneration_neutralizes_the_observation_but_not_the_results() {
        let mut details = failing_details();
        details.is_exonerated = true;
        let v = PositionVerdict::with_details(10, hour(1), details);
        assert!(v.has_unexpected_results());
        assert!(!v.is_failing_observation());
    }

    #[test]
    fn flaky_run_detection() {
        let run = Run {
            expected: ResultCounts {
                pass_count: 1,
                ..Default::default()
            },
            unexpected: ResultCounts {
                fail_count: 2,
                ..Default::default()
            },
        };
        assert!(run.is_flaky());
        assert_eq!(run.total_results(), 3);
    }

    #[test]
    fn simple_pass_serializes_compactly() {
        let v = PositionVerdict::simple_pass(42, hour(0));
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"commit_position\":42"));
        assert!(!json.contains("details"));
        assert!(!json.contains("pass_count"));

        let back: PositionVerdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn latest_unexpected_hour_ignores_passes() {
        let verdicts = vec![
            PositionVerdict::simple_pass(1, hour(5)),
            PositionVerdict::with_details(2, hour(3), failing_details()),
            PositionVerdict::with_details(3, hour(7), failing_details()),
            PositionVerdict::simple_pass(4, hour(9)),
        ];
        assert_eq!(latest_unexpected_hour(&verdicts), Some(hour(7)));
        assert_eq!(latest_unexpected_hour(&verdicts[..1]), None);
    }
}
