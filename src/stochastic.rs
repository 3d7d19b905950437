//! Validation and projection of probability vectors and stochastic matrices.
//!
//! Re-estimation repeatedly pushes expected counts back onto the probability
//! simplex; the helpers here own that projection and the invariant checks
//! performed after every M-step and at the public API boundary.

use crate::errors::{HmmError, HmmResult};
use crate::numerics::constants::{STOCHASTIC_TOL, SYMMETRY_TOL};
use nalgebra::{Cholesky, DMatrix, DVector};

/// Projects expected counts onto the simplex with a Dirichlet pseudocount.
///
/// Computes `max(v + prior - 1, 0)` and divides by its sum; a zero sum
/// resets to the uniform distribution. `prior = 1` reproduces the maximum
/// likelihood estimate.
pub fn normalize_with_prior(v: &mut DVector<f64>, prior: f64) {
    let n = v.len();
    let mut total = 0.0;
    for x in v.iter_mut() {
        *x = (*x + prior - 1.0).max(0.0);
        total += *x;
    }
    if total > 0.0 {
        *v /= total;
    } else {
        v.fill(1.0 / n as f64);
    }
}

/// Row-wise flavour of [`normalize_with_prior`].
pub fn normalize_rows_with_prior(m: &mut DMatrix<f64>, prior: f64) {
    let (rows, cols) = m.shape();
    for i in 0..rows {
        let mut total = 0.0;
        for j in 0..cols {
            let x = (m[(i, j)] + prior - 1.0).max(0.0);
            m[(i, j)] = x;
            total += x;
        }
        if total > 0.0 {
            for j in 0..cols {
                m[(i, j)] /= total;
            }
        } else {
            for j in 0..cols {
                m[(i, j)] = 1.0 / cols as f64;
            }
        }
    }
}

/// Checks that `v` is non-negative and sums to one within `tol`.
pub fn validate_probability_vector(
    v: &DVector<f64>,
    what: &'static str,
    tol: f64,
) -> HmmResult<()> {
    if let Some(bad) = v.iter().find(|&&x| !(x >= 0.0)) {
        return Err(HmmError::NotStochastic {
            what,
            reason: format!("entry {bad} is negative or NaN"),
        });
    }
    let sum: f64 = v.iter().sum();
    if (sum - 1.0).abs() > tol {
        return Err(HmmError::NotStochastic {
            what,
            reason: format!("sums to {sum}, not 1"),
        });
    }
    Ok(())
}

/// Checks that every row of `m` is a probability distribution.
pub fn validate_row_stochastic(m: &DMatrix<f64>, what: &'static str) -> HmmResult<()> {
    for i in 0..m.nrows() {
        if let Some(bad) = m.row(i).iter().find(|&&x| !(x >= 0.0)) {
            return Err(HmmError::NotStochastic {
                what,
                reason: format!("row {i} has negative or NaN entry {bad}"),
            });
        }
        let sum: f64 = m.row(i).iter().sum();
        if (sum - 1.0).abs() > STOCHASTIC_TOL {
            return Err(HmmError::NotStochastic {
                what,
                reason: format!("row {i} sums to {sum}, not 1"),
            });
        }
    }
    Ok(())
}

/// Checks that a full covariance matrix is square, symmetric, and
/// positive-definite (via a Cholesky attempt).
pub fn validate_covariance_matrix(
    cov: &DMatrix<f64>,
    dim: usize,
    state: usize,
    what: &'static str,
) -> HmmResult<()> {
    if cov.nrows() != dim || cov.ncols() != dim {
        return Err(HmmError::ShapeMismatch {
            what,
            expected: format!("{dim}x{dim}"),
            actual: format!("{}x{}", cov.nrows(), cov.ncols()),
        });
    }
    for i in 0..dim {
        for j in (i + 1)..dim {
            if (cov[(i, j)] - cov[(j, i)]).abs() > SYMMETRY_TOL {
                return Err(HmmError::NotStochastic {
                    what,
                    reason: format!("state {state} covariance is not symmetric at ({i},{j})"),
                });
            }
        }
    }
    if Cholesky::new(cov.clone()).is_none() {
        return Err(HmmError::NonPositiveDefinite { state });
    }
    Ok(())
}

/// Checks that variance entries are strictly positive.
pub fn validate_positive_variances(
    vars: &[f64],
    state: usize,
    what: &'static str,
) -> HmmResult<()> {
    if vars.iter().any(|&v| !(v > 0.0)) {
        return Err(HmmError::NotStochastic {
            what,
            reason: format!("state {state} has a non-positive variance"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn prior_normalization_recovers_mle_at_unit_prior() {
        let mut v = DVector::from_row_slice(&[2.0, 6.0]);
        normalize_with_prior(&mut v, 1.0);
        assert_approx_eq!(v[0], 0.25, 1e-12);
        assert_approx_eq!(v[1], 0.75, 1e-12);
    }

    #[test]
    fn prior_normalization_clips_negative_counts() {
        let mut v = DVector::from_row_slice(&[0.5, 3.0]);
        // prior 0.8 drives the first entry below zero before clipping
        normalize_with_prior(&mut v, 0.8);
        assert_approx_eq!(v[0], 0.3 / 3.1, 1e-12);
        assert_approx_eq!(v.iter().sum::<f64>(), 1.0, 1e-12);
    }

    #[test]
    fn zero_row_resets_to_uniform() {
        let mut m = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 3.0, 1.0]);
        normalize_rows_with_prior(&mut m, 1.0);
        assert_approx_eq!(m[(0, 0)], 0.5, 1e-12);
        assert_approx_eq!(m[(0, 1)], 0.5, 1e-12);
        assert_approx_eq!(m[(1, 0)], 0.75, 1e-12);
    }

    #[test]
    fn stochastic_validation_rejects_bad_rows() {
        let ok = DMatrix::from_row_slice(2, 2, &[0.7, 0.3, 0.4, 0.6]);
        assert!(validate_row_stochastic(&ok, "trans_mat").is_ok());
        let bad_sum = DMatrix::from_row_slice(2, 2, &[0.7, 0.2, 0.4, 0.6]);
        assert!(validate_row_stochastic(&bad_sum, "trans_mat").is_err());
        let negative = DMatrix::from_row_slice(2, 2, &[1.1, -0.1, 0.4, 0.6]);
        assert!(validate_row_stochastic(&negative, "trans_mat").is_err());
    }

    #[test]
    fn covariance_validation_catches_asymmetry_and_indefiniteness() {
        let ok = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.2, 1.0]);
        assert!(validate_covariance_matrix(&ok, 2, 0, "covars").is_ok());
        let asym = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.3, 1.0]);
        assert!(validate_covariance_matrix(&asym, 2, 0, "covars").is_err());
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert_eq!(
            validate_covariance_matrix(&indefinite, 2, 1, "covars").unwrap_err(),
            HmmError::NonPositiveDefinite { state: 1 }
        );
    }
}
