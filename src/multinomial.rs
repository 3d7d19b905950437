//! Multinomial emission family.
//!
//! Each observation is a vector of K symbol counts drawn from a fixed number
//! of trials. The per-state symbol probabilities share the row-stochastic
//! layout of the categorical family; the likelihood carries the multinomial
//! coefficient so scores are comparable across trial counts.

use crate::emission::{EmissionModel, ParamSelection};
use crate::errors::{validate_positive_count, HmmError, HmmResult};
use crate::rng::HmmRng;
use crate::stochastic::{normalize_rows_with_prior, validate_row_stochastic};
use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::ln_gamma;

/// Multinomial emissions over K symbols with a fixed trial count.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Multinomial {
    n_states: usize,
    n_symbols: usize,
    /// Trials per sample; required for sampling, checked against the data
    /// when provided.
    n_trials: Option<u64>,
    emission_prob: Option<DMatrix<f64>>,
}

impl Multinomial {
    /// Creates an unparameterised family over `n_symbols` symbols.
    pub fn new(n_states: usize, n_symbols: usize) -> HmmResult<Self> {
        validate_positive_count(n_states, "n_components")?;
        validate_positive_count(n_symbols, "n_symbols")?;
        Ok(Self {
            n_states,
            n_symbols,
            n_trials: None,
            emission_prob: None,
        })
    }

    /// Fixes the number of trials per sample.
    pub fn with_n_trials(mut self, n_trials: u64) -> HmmResult<Self> {
        if n_trials == 0 {
            return Err(HmmError::InvalidOption {
                option: "n_trials",
                value: "0".to_string(),
                expected: "a positive trial count",
            });
        }
        self.n_trials = Some(n_trials);
        Ok(self)
    }

    /// Supplies the symbol probabilities explicitly.
    pub fn with_emission_prob(mut self, emission_prob: DMatrix<f64>) -> HmmResult<Self> {
        if emission_prob.shape() != (self.n_states, self.n_symbols) {
            return Err(HmmError::ShapeMismatch {
                what: "emission_prob",
                expected: format!("{}x{}", self.n_states, self.n_symbols),
                actual: format!("{}x{}", emission_prob.nrows(), emission_prob.ncols()),
            });
        }
        validate_row_stochastic(&emission_prob, "emission_prob")?;
        self.emission_prob = Some(emission_prob);
        Ok(self)
    }

    /// The fitted symbol probabilities, if set.
    pub fn emission_prob(&self) -> Option<&DMatrix<f64>> {
        self.emission_prob.as_ref()
    }

    fn require_emission_prob(&self) -> HmmResult<&DMatrix<f64>> {
        self.emission_prob.as_ref().ok_or(HmmError::NotFitted {
            what: "emission_prob",
        })
    }

    fn check_counts(&self, row: &DVector<f64>) -> HmmResult<f64> {
        if row.len() != self.n_symbols {
            return Err(HmmError::ShapeMismatch {
                what: "observation row",
                expected: self.n_symbols.to_string(),
                actual: row.len().to_string(),
            });
        }
        let mut total = 0.0;
        for &count in row.iter() {
            if !(count >= 0.0) || (count - count.round()).abs() > 1e-9 {
                return Err(HmmError::InvalidOption {
                    option: "observations",
                    value: count.to_string(),
                    expected: "non-negative integer symbol counts",
                });
            }
            total += count;
        }
        if let Some(expected) = self.n_trials {
            if (total - expected as f64).abs() > 1e-9 {
                return Err(HmmError::InvalidOption {
                    option: "observations",
                    value: total.to_string(),
                    expected: "rows summing to n_trials",
                });
            }
        }
        Ok(total)
    }
}

/// Expected symbol counts per state.
#[derive(Debug, Clone)]
pub struct MultinomialStats {
    obs: DMatrix<f64>,
}

impl EmissionModel for Multinomial {
    type Obs = DVector<f64>;
    type Stats = MultinomialStats;

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn letters(&self) -> &'static [char] {
        &['e']
    }

    fn validate(&self) -> HmmResult<()> {
        validate_row_stochastic(self.require_emission_prob()?, "emission_prob")
    }

    fn initialize(
        &mut self,
        _observations: &[DVector<f64>],
        selection: &ParamSelection,
        rng: &mut HmmRng,
    ) -> HmmResult<()> {
        if selection.contains('e') && self.emission_prob.is_none() {
            let mut emission = DMatrix::zeros(self.n_states, self.n_symbols);
            for j in 0..self.n_states {
                let row = rng.simplex_vector(self.n_symbols);
                for k in 0..self.n_symbols {
                    emission[(j, k)] = row[k];
                }
            }
            self.emission_prob = Some(emission);
        }
        Ok(())
    }

    fn frame_log_prob(&self, observations: &[DVector<f64>]) -> HmmResult<DMatrix<f64>> {
        let emission = self.require_emission_prob()?;
        let mut frame = DMatrix::zeros(observations.len(), self.n_states);
        for (t, counts) in observations.iter().enumerate() {
            let total = self.check_counts(counts)?;
            // log n! - Σ log x_k!, shared by every state.
            let mut coefficient = ln_gamma(total + 1.0);
            for k in 0..self.n_symbols {
                coefficient -= ln_gamma(counts[k] + 1.0);
            }
            for j in 0..self.n_states {
                let mut log_prob = coefficient;
                for k in 0..self.n_symbols {
                    if counts[k] > 0.0 {
                        let p = emission[(j, k)];
                        if p > 0.0 {
                            log_prob += counts[k] * p.ln();
                        } else {
                            log_prob = f64::NEG_INFINITY;
                            break;
                        }
                    }
                }
                frame[(t, j)] = log_prob;
            }
        }
        Ok(frame)
    }

    fn empty_stats(&self) -> MultinomialStats {
        MultinomialStats {
            obs: DMatrix::zeros(self.n_states, self.n_symbols),
        }
    }

    fn accumulate(
        &self,
        stats: &mut MultinomialStats,
        observations: &[DVector<f64>],
        posteriors: &DMatrix<f64>,
    ) -> HmmResult<()> {
        for (t, counts) in observations.iter().enumerate() {
            for j in 0..self.n_states {
                let weight = posteriors[(t, j)];
                for k in 0..self.n_symbols {
                    stats.obs[(j, k)] += weight * counts[k];
                }
            }
        }
        Ok(())
    }

    fn merge_stats(&self, into: &mut MultinomialStats, from: MultinomialStats) {
        into.obs += from.obs;
    }

    fn m_step(&mut self, stats: &MultinomialStats, selection: &ParamSelection) -> HmmResult<()> {
        if selection.contains('e') {
            let mut emission = stats.obs.clone();
            normalize_rows_with_prior(&mut emission, 1.0);
            self.emission_prob = Some(emission);
        }
        Ok(())
    }

    fn sample_state(&self, state: usize, rng: &mut HmmRng) -> HmmResult<DVector<f64>> {
        let emission = self.require_emission_prob()?;
        let n_trials = self.n_trials.ok_or(HmmError::NotFitted { what: "n_trials" })?;
        let mut counts = DVector::zeros(self.n_symbols);
        for _ in 0..n_trials {
            let symbol = rng.categorical((0..self.n_symbols).map(|k| emission[(state, k)]));
            counts[symbol] += 1.0;
        }
        Ok(counts)
    }

    fn free_parameters(&self, selection: &ParamSelection) -> usize {
        if selection.contains('e') {
            self.n_states * (self.n_symbols - 1)
        } else {
            0
        }
    }
}
