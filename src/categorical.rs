//! Categorical (discrete-symbol) emission family.
//!
//! Observations are integer symbols in `[0, K)`. Each state owns one row of
//! the `N×K` emission probability matrix.

use crate::emission::{EmissionModel, ParamSelection};
use crate::errors::{validate_positive_count, HmmError, HmmResult};
use crate::rng::HmmRng;
use crate::stochastic::{normalize_rows_with_prior, validate_row_stochastic};
use nalgebra::DMatrix;

/// Categorical emissions: `p(x = k | state = j) = emission_prob[j, k]`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Categorical {
    n_states: usize,
    n_symbols: usize,
    emission_prob: Option<DMatrix<f64>>,
    /// Dirichlet pseudocount applied in the M-step; 1 gives the MLE.
    prior: f64,
}

impl Categorical {
    /// Creates an unparameterised family over `n_symbols` symbols.
    pub fn new(n_states: usize, n_symbols: usize) -> HmmResult<Self> {
        validate_positive_count(n_states, "n_components")?;
        validate_positive_count(n_symbols, "n_symbols")?;
        Ok(Self {
            n_states,
            n_symbols,
            emission_prob: None,
            prior: 1.0,
        })
    }

    /// Sets the Dirichlet pseudocount used when re-estimating emissions.
    pub fn with_prior(mut self, prior: f64) -> Self {
        self.prior = prior;
        self
    }

    /// Supplies the emission matrix explicitly.
    pub fn with_emission_prob(mut self, emission_prob: DMatrix<f64>) -> HmmResult<Self> {
        self.set_emission_prob(emission_prob)?;
        Ok(self)
    }

    /// Replaces the emission matrix, validating shape and stochasticity.
    pub fn set_emission_prob(&mut self, emission_prob: DMatrix<f64>) -> HmmResult<()> {
        if emission_prob.shape() != (self.n_states, self.n_symbols) {
            return Err(HmmError::ShapeMismatch {
                what: "emission_prob",
                expected: format!("{}x{}", self.n_states, self.n_symbols),
                actual: format!("{}x{}", emission_prob.nrows(), emission_prob.ncols()),
            });
        }
        validate_row_stochastic(&emission_prob, "emission_prob")?;
        self.emission_prob = Some(emission_prob);
        Ok(())
    }

    /// The fitted emission matrix, if set.
    pub fn emission_prob(&self) -> Option<&DMatrix<f64>> {
        self.emission_prob.as_ref()
    }

    /// Alphabet size.
    pub fn n_symbols(&self) -> usize {
        self.n_symbols
    }

    fn require_emission_prob(&self) -> HmmResult<&DMatrix<f64>> {
        self.emission_prob
            .as_ref()
            .ok_or(HmmError::NotFitted {
                what: "emission_prob",
            })
    }
}

/// Expected symbol counts per state, weighted by the state posterior.
#[derive(Debug, Clone)]
pub struct CategoricalStats {
    obs: DMatrix<f64>,
}

impl EmissionModel for Categorical {
    type Obs = usize;
    type Stats = CategoricalStats;

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
        _observations: &[usize],
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

    fn frame_log_prob(&self, observations: &[usize]) -> HmmResult<DMatrix<f64>> {
        let emission = self.require_emission_prob()?;
        let mut frame = DMatrix::zeros(observations.len(), self.n_states);
        for (t, &symbol) in observations.iter().enumerate() {
            if symbol >= self.n_symbols {
                return Err(HmmError::ShapeMismatch {
                    what: "observation symbol",
                    expected: format!("a symbol below {}", self.n_symbols),
                    actual: symbol.to_string(),
                });
            }
            for j in 0..self.n_states {
                let p = emission[(j, symbol)];
                frame[(t, j)] = if p > 0.0 { p.ln() } else { f64::NEG_INFINITY };
            }
        }
        Ok(frame)
    }

    fn empty_stats(&self) -> CategoricalStats {
        CategoricalStats {
            obs: DMatrix::zeros(self.n_states, self.n_symbols),
        }
    }

    fn accumulate(
        &self,
        stats: &mut CategoricalStats,
        observations: &[usize],
        posteriors: &DMatrix<f64>,
    ) -> HmmResult<()> {
        for (t, &symbol) in observations.iter().enumerate() {
            for j in 0..self.n_states {
                stats.obs[(j, symbol)] += posteriors[(t, j)];
            }
        }
        Ok(())
    }

    fn merge_stats(&self, into: &mut CategoricalStats, from: CategoricalStats) {
        into.obs += from.obs;
    }

    fn m_step(&mut self, stats: &CategoricalStats, selection: &ParamSelection) -> HmmResult<()> {
        if selection.contains('e') {
            let mut emission = stats.obs.clone();
            normalize_rows_with_prior(&mut emission, self.prior);
            self.emission_prob = Some(emission);
        }
        Ok(())
    }

    fn sample_state(&self, state: usize, rng: &mut HmmRng) -> HmmResult<usize> {
        let emission = self.require_emission_prob()?;
        Ok(rng.categorical((0..self.n_symbols).map(|k| emission[(state, k)])))
    }

    fn free_parameters(&self, selection: &ParamSelection) -> usize {
        if selection.contains('e') {
            self.n_states * (self.n_symbols - 1)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn family() -> Categorical {
        Categorical::new(2, 3)
            .unwrap()
            .with_emission_prob(DMatrix::from_row_slice(
                2,
                3,
                &[0.1, 0.4, 0.5, 0.6, 0.3, 0.1],
            ))
            .unwrap()
    }

    #[test]
    fn frame_log_prob_reads_symbol_columns() {
        let frame = family().frame_log_prob(&[0, 2]).unwrap();
        assert_approx_eq!(frame[(0, 0)], 0.1f64.ln(), 1e-12);
        assert_approx_eq!(frame[(0, 1)], 0.6f64.ln(), 1e-12);
        assert_approx_eq!(frame[(1, 0)], 0.5f64.ln(), 1e-12);
        assert_approx_eq!(frame[(1, 1)], 0.1f64.ln(), 1e-12);
    }

    #[test]
    fn out_of_range_symbol_is_rejected() {
        assert!(family().frame_log_prob(&[3]).is_err());
    }

    #[test]
    fn unset_emission_matrix_is_not_fitted() {
        let bare = Categorical::new(2, 3).unwrap();
        assert_eq!(
            bare.frame_log_prob(&[0]).unwrap_err(),
            HmmError::NotFitted {
                what: "emission_prob"
            }
        );
    }

    #[test]
    fn m_step_recovers_posterior_weighted_frequencies() {
        let fam = family();
        let mut stats = fam.empty_stats();
        // Two frames of symbol 0 fully explained by state 0, one frame of
        // symbol 1 fully explained by state 1.
        let posteriors = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        fam.accumulate(&mut stats, &[0, 0, 1], &posteriors).unwrap();
        let mut fam = fam;
        fam.m_step(&stats, &ParamSelection::from_letters(&['e']))
            .unwrap();
        let emission = fam.emission_prob().unwrap();
        assert_approx_eq!(emission[(0, 0)], 1.0, 1e-12);
        assert_approx_eq!(emission[(1, 1)], 1.0, 1e-12);
    }

    #[test]
    fn initialization_only_fills_unset_parameters() {
        let mut fam = family();
        let before = fam.emission_prob().unwrap().clone();
        let mut rng = HmmRng::with_seed(5);
        fam.initialize(&[0, 1], &ParamSelection::from_letters(&['e']), &mut rng)
            .unwrap();
        assert_eq!(fam.emission_prob().unwrap(), &before);

        let mut bare = Categorical::new(2, 3).unwrap();
        bare.initialize(&[0, 1], &ParamSelection::from_letters(&['e']), &mut rng)
            .unwrap();
        assert!(validate_row_stochastic(bare.emission_prob().unwrap(), "emission_prob").is_ok());
    }

    #[test]
    fn free_parameter_count_tracks_selection() {
        let fam = family();
        assert_eq!(fam.free_parameters(&ParamSelection::from_letters(&['e'])), 4);
        assert_eq!(fam.free_parameters(&ParamSelection::from_letters(&[])), 0);
    }
}
