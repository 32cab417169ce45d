//! Bayesian changepoint detection by recursive binary segmentation.
//!
//! Each verdict is reduced to a binary observation: failing (has an
//! unexpected result and is not exonerated) or passing. A segment of
//! history is modeled as Bernoulli draws with an unknown failure rate
//! under a conjugate Beta prior, so the marginal likelihood of any
//! span has a closed form in log-Beta functions.
//!
//! # Model
//!
//! For a span with `s` failures out of `n` verdicts under prior
//! Beta(α, β):
//!
//! ```text
//! log P(span) = log B(α + s, β + n - s) - log B(α, β)
//! ```
//!
//! A candidate split at index k compares two hypotheses:
//!
//! ```text
//! H0: one regime over [lo, hi)
//! H1: independent regimes [lo, k) and [k, hi), k uniform over candidates
//! ```
//!
//! The evidence for H1 marginalizes the split location, which builds in
//! an Occam penalty of `ln(candidate count)`. A split is accepted when
//! `log P(H1) - log P(H0)` exceeds the configured threshold, and the
//! procedure then recurses into both sides. The posterior over the
//! split location also yields a 99% credible interval on where the
//! behavior flipped.
//!
//! # Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use ft_core::detector::{BayesianChangepointDetector, ChangepointDetector, DetectorConfig};
//! use ft_core::verdict::{PositionVerdict, ResultCounts, Run, VerdictDetails};
//!
//! let hour = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
//! let failing = VerdictDetails {
//!     is_exonerated: false,
//!     runs: vec![Run {
//!         expected: ResultCounts::default(),
//!         unexpected: ResultCounts {
//!             fail_count: 1,
//!             ..Default::default()
//!         },
//!     }],
//! };
//!
//! let mut history: Vec<PositionVerdict> = (1..=50)
//!     .map(|position| PositionVerdict::simple_pass(position, hour))
//!     .collect();
//! history.extend(
//!     (51..=100).map(|position| PositionVerdict::with_details(position, hour, failing.clone())),
//! );
//!
//! let detector = BayesianChangepointDetector::new(DetectorConfig::default()).unwrap();
//! let changepoints = detector.analyze(&history);
//! assert_eq!(changepoints.len(), 1);
//! assert_eq!(changepoints[0].position, 51);
//! ```

use ft_math::bernoulli::{log_marginal, BetaParams};
use ft_math::{log_add_exp, log_sum_exp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{Changepoint, ChangepointDetector};
use crate::verdict::PositionVerdict;

/// Errors from detector configuration.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("invalid prior: Beta({alpha}, {beta}) (parameters must be finite and > 0)")]
    InvalidPrior { alpha: f64, beta: f64 },

    #[error("invalid min log Bayes factor: {0} (must be finite)")]
    InvalidThreshold(f64),

    #[error("invalid min segment verdicts: 0 (must be >= 1)")]
    InvalidMinSegmentVerdicts,
}

impl From<DetectorError> for ft_common::Error {
    fn from(err: DetectorError) -> Self {
        ft_common::Error::Config(err.to_string())
    }
}

/// Configuration for [`BayesianChangepointDetector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Beta prior over each regime's failure rate.
    #[serde(default = "default_prior")]
    pub prior: BetaParams,

    /// Acceptance threshold on the log Bayes factor of a split.
    /// The default of 5.0 demands roughly 148:1 evidence.
    #[serde(default = "default_min_log_bayes_factor")]
    pub min_log_bayes_factor: f64,

    /// Minimum verdicts required on each side of a candidate split.
    #[serde(default = "default_min_segment_verdicts")]
    pub min_segment_verdicts: usize,
}

fn default_prior() -> BetaParams {
    BetaParams::jeffreys()
}

fn default_min_log_bayes_factor() -> f64 {
    5.0
}

fn default_min_segment_verdicts() -> usize {
    1
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            prior: default_prior(),
            min_log_bayes_factor: default_min_log_bayes_factor(),
            min_segment_verdicts: default_min_segment_verdicts(),
        }
    }
}

impl DetectorConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !self.prior.is_valid() {
            return Err(DetectorError::InvalidPrior {
                alpha: self.prior.alpha,
                beta: self.prior.beta,
            });
        }
        if !self.min_log_bayes_factor.is_finite() {
            return Err(DetectorError::InvalidThreshold(self.min_log_bayes_factor));
        }
        if self.min_segment_verdicts == 0 {
            return Err(DetectorError::InvalidMinSegmentVerdicts);
        }
        Ok(())
    }
}

/// Precomputed view of one history: positions plus a failure prefix
/// sum, so any span's evidence is O(1).
struct Scan {
    positions: Vec<i64>,
    failure_prefix: Vec<u64>,
}

impl Scan {
    fn build(history: &[PositionVerdict]) -> Scan {
        let mut failure_prefix = Vec::with_capacity(history.len() + 1);
        failure_prefix.push(0);
        let mut failures = 0u64;
        for verdict in history {
            if verdict.is_failing_observation() {
                failures += 1;
            }
            failure_prefix.push(failures);
        }
        Scan {
            positions: history.iter().map(|v| v.commit_position).collect(),
            failure_prefix,
        }
    }

    fn failures_in(&self, lo: usize, hi: usize) -> u64 {
        self.failure_prefix[hi] - self.failure_prefix[lo]
    }
}

/// An accepted split of one span.
struct Split {
    /// Candidate index with the highest posterior mass.
    index: usize,
    /// Smallest candidate index inside the central 99% of the
    /// split-location posterior.
    lower_index: usize,
    /// Largest such candidate index.
    upper_index: usize,
    log_bayes_factor: f64,
}

/// Offline changepoint detector over binary failure observations.
pub struct BayesianChangepointDetector {
    config: DetectorConfig,
}

impl BayesianChangepointDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Log marginal likelihood of the span `[lo, hi)` as one regime.
    fn span_evidence(&self, scan: &Scan, lo: usize, hi: usize) -> f64 {
        let failures = scan.failures_in(lo, hi);
        let passes = (hi - lo) as u64 - failures;
        log_marginal(&self.config.prior, failures, passes)
    }

    /// Evaluates every candidate split of `[lo, hi)` and accepts the
    /// best one if the marginal evidence clears the threshold.
    fn best_split(&self, scan: &Scan, lo: usize, hi: usize) -> Option<Split> {
        let min = self.config.min_segment_verdicts;
        if hi - lo < 2 * min {
            return None;
        }
        let first = lo + min;
        let last = hi - min;

        let whole = self.span_evidence(scan, lo, hi);
        let weights: Vec<f64> = (first..=last)
            .map(|k| self.span_evidence(scan, lo, k) + self.span_evidence(scan, k, hi))
            .collect();

        let total = log_sum_exp(&weights);
        let split_evidence = total - (weights.len() as f64).ln();
        let log_bayes_factor = split_evidence - whole;
        if !(log_bayes_factor > self.config.min_log_bayes_factor) {
            return None;
        }

        // Posterior over the split location, scanned cumulatively in
        // the log domain for the central 99% interval.
        let target_low = total + (0.005f64).ln();
        let target_high = total + (0.995f64).ln();
        let mut lower_index = last;
        let mut upper_index = last;
        let mut best = first;
        let mut best_weight = f64::NEG_INFINITY;
        let mut cumulative = f64::NEG_INFINITY;
        let mut lower_found = false;
        for (offset, &weight) in weights.iter().enumerate() {
            let k = first + offset;
            if weight > best_weight {
                best_weight = weight;
                best = k;
            }
            cumulative = log_add_exp(cumulative, weight);
            if !lower_found && cumulative >= target_low {
                lower_index = k;
                lower_found = true;
            }
            if cumulative >= target_high {
                upper_index = k;
                break;
            }
        }

        Some(Split {
            index: best,
            lower_index,
            upper_index,
            log_bayes_factor,
        })
    }

    fn segment_range(&self, scan: &Scan, lo: usize, hi: usize, out: &mut Vec<Changepoint>) {
        let Some(split) = self.best_split(scan, lo, hi) else {
            return;
        };
        debug!(
            index = split.index,
            log_bayes_factor = split.log_bayes_factor,
            "accepted changepoint"
        );
        self.segment_range(scan, lo, split.index, out);
        out.push(Changepoint {
            index: split.index,
            position: scan.positions[split.index],
            // The flip lies strictly after the verdict preceding the
            // lowest credible split and at or before the highest one.
            lower_bound_99: scan.positions[split.lower_index - 1],
            upper_bound_99: scan.positions[split.upper_index],
        });
        self.segment_range(scan, split.index, hi, out);
    }
}

impl ChangepointDetector for BayesianChangepointDetector {
    fn analyze(&self, history: &[PositionVerdict]) -> Vec<Changepoint> {
        let mut out = Vec::new();
        if history.len() >= 2 * self.config.min_segment_verdicts {
            let scan = Scan::build(history);
            self.segment_range(&scan, 0, history.len(), &mut out);
        }
        out
    }
}
