//! Changepoint detection over buffered verdict histories.

pub mod bayes;

pub use bayes::{BayesianChangepointDetector, DetectorConfig, DetectorError};

use crate::verdict::PositionVerdict;

/// A detected flip in a test's failure behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Changepoint {
    /// Index into the analyzed history of the first verdict of the new
    /// regime.
    pub index: usize,
    /// Commit position of that verdict.
    pub position: i64,
    /// 99% credible bounds on where the behavior flipped: after
    /// `lower_bound_99`, at or before `upper_bound_99`.
    pub lower_bound_99: i64,
    pub upper_bound_99: i64,
}

/// Splits a verdict history into spans of homogeneous failure behavior.
pub trait ChangepointDetector: Send + Sync {
    /// Returns changepoints ordered by index. `history` must be sorted
    /// by `(commit_position, hour)`.
    fn analyze(&self, history: &[PositionVerdict]) -> Vec<Changepoint>;
}
