//! Beta-Bernoulli conjugate model over verdict outcomes.
//!
//! Verdict histories reduce to binary observations (a verdict either
//! carries unexpected results or it does not). The model:
//! - Prior: `p ~ Beta(α, β)`
//! - Likelihood: `x | p ~ Bernoulli(p)`
//! - Posterior after s failing and t passing verdicts: `Beta(α + s, β + t)`
//!
//! The marginal likelihood of a count pair under the prior is the evidence
//! term the changepoint search compares across candidate splits.

use super::stable::log_beta;
use serde::{Deserialize, Serialize};

/// Parameters for a Beta distribution used in Beta-Bernoulli conjugate
/// updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BetaParams {
    /// Shape parameter alpha (failing weight).
    pub alpha: f64,
    /// Shape parameter beta (passing weight).
    pub beta: f64,
}

impl BetaParams {
    /// Validated construction; non-positive or NaN shapes yield None.
    pub fn new(alpha: f64, beta: f64) -> Option<Self> {
        let params = Self { alpha, beta };
        params.is_valid().then_some(params)
    }

    /// Beta(1, 1) uniform prior.
    pub fn uniform() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }

    /// Jeffreys prior Beta(0.5, 0.5).
    pub fn jeffreys() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.5,
        }
    }

    /// Whether the parameters are usable (positive, non-NaN).
    pub fn is_valid(&self) -> bool {
        !self.alpha.is_nan() && !self.beta.is_nan() && self.alpha > 0.0 && self.beta > 0.0
    }

    /// Mean failure rate under these parameters, α / (α + β).
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Posterior after observing the given failing/passing counts.
    pub fn observe(&self, failing: u64, passing: u64) -> BetaParams {
        BetaParams {
            alpha: self.alpha + failing as f64,
            beta: self.beta + passing as f64,
        }
    }
}

/// Log marginal likelihood (evidence) of a failing/passing count pair.
///
/// P(s, t | α, β) = B(α + s, β + t) / B(α, β), in log form. Returns NaN
/// for an invalid prior.
pub fn log_marginal(prior: &BetaParams, failing: u64, passing: u64) -> f64 {
    if !prior.is_valid() {
        return f64::NAN;
    }
    let post = prior.observe(failing, passing);
    log_beta(post.alpha, post.beta) - log_beta(prior.alpha, prior.beta)
}
