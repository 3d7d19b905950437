//! Error types and validation helpers shared across the crate.
//!
//! All fallible operations return [`HmmResult`]. Validation errors are raised
//! at the API boundary before any model state is mutated; per-iteration
//! numeric anomalies are reported through the `log` facade instead.

use thiserror::Error;

/// Errors produced by model construction, training, and inference.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum HmmError {
    /// Array dimensions disagree with the model configuration.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Parameter or input that failed the check
        what: &'static str,
        /// Expected dimensions
        expected: String,
        /// Dimensions actually provided
        actual: String,
    },

    /// A probability vector or matrix row does not describe a distribution.
    #[error("{what} is not stochastic: {reason}")]
    NotStochastic {
        /// Parameter that failed the check
        what: &'static str,
        /// Which invariant was violated
        reason: String,
    },

    /// A covariance matrix could not be factorised even after flooring.
    #[error("covariance for state {state} is not positive-definite after flooring")]
    NonPositiveDefinite {
        /// State (or state/mixture pair encoded by the caller) that failed
        state: usize,
    },

    /// The lengths partition does not sum to the observation count.
    #[error("sequence lengths sum to {claimed} but {actual} observation rows were given")]
    LengthMismatch {
        /// Total claimed by the lengths vector
        claimed: usize,
        /// Number of rows actually provided
        actual: usize,
    },

    /// Inference was requested before the required parameters were set.
    #[error("{what} has not been set; fit the model or provide it explicitly")]
    NotFitted {
        /// Missing parameter
        what: &'static str,
    },

    /// The model assigns zero probability mass to the observations.
    #[error("ill-conditioned model: {context}")]
    IllConditioned {
        /// Where the degenerate log-probability was detected
        context: String,
    },

    /// Training exhausted its iteration budget without meeting the
    /// tolerance, and the caller opted into strict convergence.
    #[error("EM did not converge within {n_iter} iterations (last delta {last_delta})")]
    NotConverged {
        /// Iteration budget that was exhausted
        n_iter: usize,
        /// Most recent log-probability gain
        last_delta: f64,
    },

    /// An option string or parameter letter is not recognised.
    #[error("invalid {option}: {value:?} (expected {expected})")]
    InvalidOption {
        /// Option name
        option: &'static str,
        /// Offending value
        value: String,
        /// Accepted values
        expected: &'static str,
    },
}

/// Result alias used throughout the crate.
pub type HmmResult<T> = Result<T, HmmError>;

/// Validates that every entry of a slice is finite.
pub fn validate_finite(values: &[f64], what: &'static str) -> HmmResult<()> {
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(HmmError::NotStochastic {
            what,
            reason: format!("contains non-finite entry {bad}"),
        });
    }
    Ok(())
}

/// Validates that a count is strictly positive.
pub fn validate_positive_count(value: usize, what: &'static str) -> HmmResult<()> {
    if value == 0 {
        return Err(HmmError::InvalidOption {
            option: what,
            value: value.to_string(),
            expected: "a positive integer",
        });
    }
    Ok(())
}

/// Validates that a scalar lies strictly above a lower bound.
pub fn validate_above(value: f64, bound: f64, what: &'static str) -> HmmResult<()> {
    if !(value > bound) {
        return Err(HmmError::InvalidOption {
            option: what,
            value: value.to_string(),
            expected: "a value strictly above the lower bound",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_check_flags_nan_and_infinity() {
        assert!(validate_finite(&[0.1, 0.9], "start_prob").is_ok());
        assert!(validate_finite(&[0.1, f64::NAN], "start_prob").is_err());
        assert!(validate_finite(&[f64::INFINITY], "start_prob").is_err());
    }

    #[test]
    fn positive_count_rejects_zero() {
        assert!(validate_positive_count(3, "n_components").is_ok());
        assert!(validate_positive_count(0, "n_components").is_err());
    }

    #[test]
    fn above_rejects_nan_and_bound() {
        assert!(validate_above(1e-3, 0.0, "tol").is_ok());
        assert!(validate_above(0.0, 0.0, "tol").is_err());
        assert!(validate_above(f64::NAN, 0.0, "tol").is_err());
    }
}
