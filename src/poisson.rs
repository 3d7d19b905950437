//! Poisson emission family.
//!
//! Observations are D-dimensional non-negative count vectors; each state
//! carries one rate per dimension, re-estimated with an optional Gamma prior.

use crate::emission::{EmissionModel, ParamSelection};
use crate::errors::{validate_positive_count, HmmError, HmmResult};
use crate::rng::HmmRng;
use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::ln_gamma;

/// Floor keeping re-estimated rates strictly positive.
const MIN_RATE: f64 = 1e-10;

/// Poisson emissions with state- and dimension-specific rates.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Poisson {
    n_states: usize,
    n_features: usize,
    lambdas: Option<DMatrix<f64>>,
    /// Gamma-prior shape contribution added to the expected counts.
    lambdas_prior: f64,
    /// Gamma-prior rate contribution added to the posterior mass.
    lambdas_weight: f64,
}

impl Poisson {
    /// Creates an unparameterised family over `n_features` count dimensions.
    pub fn new(n_states: usize, n_features: usize) -> HmmResult<Self> {
        validate_positive_count(n_states, "n_components")?;
        validate_positive_count(n_features, "n_features")?;
        Ok(Self {
            n_states,
            n_features,
            lambdas: None,
            lambdas_prior: 0.0,
            lambdas_weight: 0.0,
        })
    }

    /// Sets the Gamma prior used by the M-step; zeros give the MLE.
    pub fn with_prior(mut self, lambdas_prior: f64, lambdas_weight: f64) -> Self {
        self.lambdas_prior = lambdas_prior;
        self.lambdas_weight = lambdas_weight;
        self
    }

    /// Supplies the rate matrix explicitly (N×D, strictly positive).
    pub fn with_lambdas(mut self, lambdas: DMatrix<f64>) -> HmmResult<Self> {
        self.set_lambdas(lambdas)?;
        Ok(self)
    }

    /// Replaces the rate matrix, validating shape and positivity.
    pub fn set_lambdas(&mut self, lambdas: DMatrix<f64>) -> HmmResult<()> {
        if lambdas.shape() != (self.n_states, self.n_features) {
            return Err(HmmError::ShapeMismatch {
                what: "lambdas",
                expected: format!("{}x{}", self.n_states, self.n_features),
                actual: format!("{}x{}", lambdas.nrows(), lambdas.ncols()),
            });
        }
        if lambdas.iter().any(|&l| !(l > 0.0)) {
            return Err(HmmError::NotStochastic {
                what: "lambdas",
                reason: "rates must be strictly positive".to_string(),
            });
        }
        self.lambdas = Some(lambdas);
        Ok(())
    }

    /// The fitted rates, if set.
    pub fn lambdas(&self) -> Option<&DMatrix<f64>> {
        self.lambdas.as_ref()
    }

    fn require_lambdas(&self) -> HmmResult<&DMatrix<f64>> {
        self.lambdas.as_ref().ok_or(HmmError::NotFitted { what: "lambdas" })
    }

    fn check_row(&self, row: &DVector<f64>) -> HmmResult<()> {
        if row.len() != self.n_features {
            return Err(HmmError::ShapeMismatch {
                what: "observation row",
                expected: self.n_features.to_string(),
                actual: row.len().to_string(),
            });
        }
        if row.iter().any(|&x| !(x >= 0.0)) {
            return Err(HmmError::InvalidOption {
                option: "observations",
                value: "negative count".to_string(),
                expected: "non-negative counts",
            });
        }
        Ok(())
    }
}

/// Posterior mass and expected counts per state.
#[derive(Debug, Clone)]
pub struct PoissonStats {
    post: DVector<f64>,
    obs: DMatrix<f64>,
}

impl EmissionModel for Poisson {
    type Obs = DVector<f64>;
    type Stats = PoissonStats;

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn letters(&self) -> &'static [char] {
        &['l']
    }

    fn validate(&self) -> HmmResult<()> {
        let lambdas = self.require_lambdas()?;
        if lambdas.iter().any(|&l| !(l > 0.0)) {
            return Err(HmmError::NotStochastic {
                what: "lambdas",
                reason: "rates must be strictly positive".to_string(),
            });
        }
        Ok(())
    }

    fn initialize(
        &mut self,
        observations: &[DVector<f64>],
        selection: &ParamSelection,
        rng: &mut HmmRng,
    ) -> HmmResult<()> {
        if !(selection.contains('l') && self.lambdas.is_none()) {
            return Ok(());
        }
        if observations.is_empty() {
            return Err(HmmError::ShapeMismatch {
                what: "observations",
                expected: "at least one row for initialisation".to_string(),
                actual: "0".to_string(),
            });
        }
        for row in observations {
            self.check_row(row)?;
        }
        // Column means perturbed per state so EM can break symmetry.
        let mut column_means = DVector::zeros(self.n_features);
        for row in observations {
            column_means += row;
        }
        column_means /= observations.len() as f64;
        let lambdas = DMatrix::from_fn(self.n_states, self.n_features, |_, d| {
            (column_means[d] * (0.5 + rng.uniform())).max(MIN_RATE)
        });
        self.lambdas = Some(lambdas);
        Ok(())
    }

    fn frame_log_prob(&self, observations: &[DVector<f64>]) -> HmmResult<DMatrix<f64>> {
        let lambdas = self.require_lambdas()?;
        let mut frame = DMatrix::zeros(observations.len(), self.n_states);
        for (t, x) in observations.iter().enumerate() {
            self.check_row(x)?;
            for j in 0..self.n_states {
                let mut log_prob = 0.0;
                for d in 0..self.n_features {
                    let rate = lambdas[(j, d)];
                    log_prob += x[d] * rate.ln() - rate - ln_gamma(x[d] + 1.0);
                }
                frame[(t, j)] = log_prob;
            }
        }
        Ok(frame)
    }

    fn empty_stats(&self) -> PoissonStats {
        PoissonStats {
            post: DVector::zeros(self.n_states),
            obs: DMatrix::zeros(self.n_states, self.n_features),
        }
    }

    fn accumulate(
        &self,
        stats: &mut PoissonStats,
        observations: &[DVector<f64>],
        posteriors: &DMatrix<f64>,
    ) -> HmmResult<()> {
        for (t, x) in observations.iter().enumerate() {
            for j in 0..self.n_states {
                let weight = posteriors[(t, j)];
                stats.post[j] += weight;
                for d in 0..self.n_features {
                    stats.obs[(j, d)] += weight * x[d];
                }
            }
        }
        Ok(())
    }

    fn merge_stats(&self, into: &mut PoissonStats, from: PoissonStats) {
        into.post += from.post;
        into.obs += from.obs;
    }

    fn m_step(&mut self, stats: &PoissonStats, selection: &ParamSelection) -> HmmResult<()> {
        if selection.contains('l') {
            let mut lambdas = self.require_lambdas()?.clone();
            for j in 0..self.n_states {
                let denom = self.lambdas_weight + stats.post[j];
                if denom <= MIN_RATE {
                    continue;
                }
                for d in 0..self.n_features {
                    lambdas[(j, d)] =
                        ((self.lambdas_prior + stats.obs[(j, d)]) / denom).max(MIN_RATE);
                }
            }
            self.lambdas = Some(lambdas);
        }
        Ok(())
    }

    fn sample_state(&self, state: usize, rng: &mut HmmRng) -> HmmResult<DVector<f64>> {
        let lambdas = self.require_lambdas()?;
        Ok(DVector::from_fn(self.n_features, |d, _| {
            rng.poisson(lambdas[(state, d)])
        }))
    }

    fn free_parameters(&self, selection: &ParamSelection) -> usize {
        if selection.contains('l') {
            self.n_states * self.n_features
        } else {
            0
        }
    }
}
