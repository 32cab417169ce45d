//! Log-domain building blocks for the Bayesian evidence math.
//!
//! Changepoint evidence is accumulated over histories of up to a few
//! thousand verdicts; everything stays in log space so the per-candidate
//! marginals can be summed and normalized without underflow.

use std::f64::consts::PI;

const LOG_SQRT_2PI: f64 = 0.918_938_533_204_672_8; // 0.5 * ln(2*pi)
const LANCZOS_G: f64 = 7.0;
#[allow(clippy::excessive_precision)] // published coefficients
const LANCZOS_COEFFS: [f64; 9] = [
    0.999_999_999_999_809_93,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_59,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_571_6e-6,
    1.505_632_735_149_311_6e-7,
];

/// Log-domain sum: `ln(sum_i exp(values[i]))`.
///
/// Empty input and all-`-inf` input both yield `NEG_INFINITY`; NaN
/// anywhere poisons the result.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let mut max = f64::NEG_INFINITY;
    for v in values {
        if v.is_nan() {
            return f64::NAN;
        }
        max = max.max(*v);
    }
    if max.is_infinite() {
        // Covers empty input, all -inf, and any +inf term.
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Log-domain add: `ln(exp(a) + exp(b))` without leaving log space.
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY || hi == f64::INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Natural log of the Gamma function (log |Gamma(z)|).
///
/// Uses a Lanczos approximation with reflection for z < 0.5. Non-positive
/// integers are poles and return NaN.
pub fn log_gamma(z: f64) -> f64 {
    if z.is_nan() || z == f64::NEG_INFINITY {
        return f64::NAN;
    }
    if z == f64::INFINITY {
        return f64::INFINITY;
    }
    if z <= 0.0 && (z - z.round()).abs() < 1e-15 {
        return f64::NAN;
    }
    if z < 0.5 {
        // Reflection: Gamma(z) Gamma(1-z) = pi / sin(pi z).
        let sin_pi = (PI * z).sin();
        if sin_pi == 0.0 {
            return f64::NAN;
        }
        return PI.ln() - sin_pi.abs().ln() - log_gamma(1.0 - z);
    }

    let w = z - 1.0;
    let series = LANCZOS_COEFFS
        .iter()
        .enumerate()
        .skip(1)
        .fold(LANCZOS_COEFFS[0], |acc, (i, c)| acc + c / (w + i as f64));
    let t = w + LANCZOS_G + 0.5;
    LOG_SQRT_2PI + (w + 0.5) * t.ln() - t + series.ln()
}

/// log B(a, b) = log Gamma(a) + log Gamma(b) - log Gamma(a+b).
pub fn log_beta(a: f64, b: f64) -> f64 {
    log_gamma(a) + log_gamma(b) - log_gamma(a + b)
}
