//! Numerically stable log-space primitives.
//!
//! Everything above this module works in log space; the helpers here keep
//! that arithmetic free of underflow and NaN propagation. Log zero is the
//! sentinel `f64::NEG_INFINITY` with the rule `(-inf) + x = -inf`.

use crate::errors::{HmmError, HmmResult};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

/// Numerical constants used across the crate.
pub mod constants {
    /// ln(2π), the normaliser of every Gaussian log-density.
    pub const LN_TWO_PI: f64 = 1.8378770664093454835606594728112;

    /// Tolerance for probability-vector and row-sum validation.
    pub const STOCHASTIC_TOL: f64 = 1e-9;

    /// Tolerance enforced on re-estimated rows after each M-step.
    pub const REESTIMATE_TOL: f64 = 1e-12;

    /// Smallest scaling normaliser accepted before the sequence is treated
    /// as having zero probability mass.
    pub const MIN_SCALE: f64 = 1e-300;

    /// Tolerance for symmetry checks on covariance matrices.
    pub const SYMMETRY_TOL: f64 = 1e-9;
}

/// Computes log(Σ exp vᵢ) without overflow.
///
/// An all-(−∞) input yields −∞, never NaN.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Iterator flavour of [`logsumexp`] for strided matrix views.
pub fn logsumexp_iter<I>(values: I) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Log-space matrix-vector product: yⱼ = logsumexp_i(log_a[i,j] + log_x[i]).
pub fn log_mat_vec(log_a: &DMatrix<f64>, log_x: &DVector<f64>) -> DVector<f64> {
    let n = log_a.ncols();
    DVector::from_fn(n, |j, _| {
        logsumexp_iter((0..log_a.nrows()).map(|i| log_a[(i, j)] + log_x[i]))
    })
}

/// Takes elementwise natural log, mapping zero to −∞.
pub fn log_or_neg_inf(value: f64) -> f64 {
    if value > 0.0 {
        value.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Cholesky factor of a state covariance, cached for repeated density
/// evaluation across a whole sequence.
#[derive(Debug, Clone)]
pub struct GaussianFactor {
    lower: DMatrix<f64>,
    log_det: f64,
    dim: usize,
}

impl GaussianFactor {
    /// Factorises `cov`, flooring once with `min_covar · I` on failure.
    ///
    /// A second failure is surfaced as [`HmmError::NonPositiveDefinite`];
    /// the flooring itself is reported through `log::warn!` because it
    /// changes the effective parameters.
    pub fn try_new(cov: &DMatrix<f64>, min_covar: f64, state: usize) -> HmmResult<Self> {
        match Cholesky::new(cov.clone()) {
            Some(chol) => Ok(Self::from_cholesky(chol)),
            None => {
                log::warn!(
                    "covariance for state {state} is not positive-definite; \
                     flooring diagonal by {min_covar:e}"
                );
                let mut floored = cov.clone();
                for d in 0..floored.nrows() {
                    floored[(d, d)] += min_covar;
                }
                let chol = Cholesky::new(floored)
                    .ok_or(HmmError::NonPositiveDefinite { state })?;
                Ok(Self::from_cholesky(chol))
            }
        }
    }

    fn from_cholesky(chol: Cholesky<f64, Dyn>) -> Self {
        let lower = chol.l();
        let log_det = 2.0 * lower.diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let dim = lower.nrows();
        Self { lower, log_det, dim }
    }

    /// Log-density of `x` under N(mean, Σ) using the cached factor:
    /// −½(D ln 2π + ln|Σ| + ‖L⁻¹(x−μ)‖²).
    pub fn log_density(&self, x: &DVector<f64>, mean: &DVector<f64>) -> f64 {
        let diff = x - mean;
        // L is nonsingular by construction, so the triangular solve succeeds.
        let z = self
            .lower
            .solve_lower_triangular(&diff)
            .unwrap_or_else(|| DVector::zeros(self.dim));
        -0.5 * (self.dim as f64 * constants::LN_TWO_PI + self.log_det + z.norm_squared())
    }

    /// Draws from N(mean, Σ) as μ + L·z with z standard normal.
    pub fn correlate(&self, mean: &DVector<f64>, z: &DVector<f64>) -> DVector<f64> {
        mean + &self.lower * z
    }

    /// The cached log-determinant of the factored covariance.
    pub fn log_det(&self) -> f64 {
        self.log_det
    }
}
