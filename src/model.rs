//! The generic hidden Markov model estimator.
//!
//! `HiddenMarkovModel<E>` owns the start distribution, the transition matrix,
//! an emission family, and a convergence monitor, and orchestrates Baum-Welch
//! training plus the inference surface (scoring, posterior decoding, Viterbi,
//! sampling, information criteria).
//!
//! Independent subsequences share only read-only parameters during the
//! E-step, so they are fanned out across a rayon pool; the per-sequence
//! accumulators are reduced afterwards in subsequence order, which keeps
//! repeated runs bitwise identical.

use crate::config::{DecodeAlgorithm, HmmConfig, LatticeImpl};
use crate::emission::{EmissionModel, ParamSelection};
use crate::errors::{HmmError, HmmResult};
use crate::lattice::{
    forward_backward_log, forward_backward_scaling, forward_log, forward_scaling, viterbi,
    LatticePass,
};
use crate::monitor::ConvergenceMonitor;
use crate::numerics::constants::REESTIMATE_TOL;
use crate::numerics::log_or_neg_inf;
use crate::rng::HmmRng;
use crate::sequences::split_sequences;
use crate::stochastic::{
    normalize_rows_with_prior, normalize_with_prior, validate_probability_vector,
    validate_row_stochastic,
};
use nalgebra::{DMatrix, DVector};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// A trained or trainable HMM over the emission family `E`.
#[derive(Debug, Clone)]
pub struct HiddenMarkovModel<E: EmissionModel> {
    config: HmmConfig,
    emission: E,
    start_prob: Option<DVector<f64>>,
    trans_mat: Option<DMatrix<f64>>,
    monitor: ConvergenceMonitor,
    rng: HmmRng,
}

/// Everything one subsequence contributes to an EM iteration.
struct SequenceContribution<S> {
    log_prob: f64,
    first_posterior: DVector<f64>,
    xi_sum: DMatrix<f64>,
    emission_stats: S,
}

impl<E: EmissionModel> HiddenMarkovModel<E> {
    /// Creates a model from an emission family and shared options.
    pub fn new(emission: E, config: HmmConfig) -> HmmResult<Self> {
        config.validate()?;
        let monitor = ConvergenceMonitor::new(config.tol, config.n_iter, config.verbose);
        let rng = match config.seed {
            Some(seed) => HmmRng::with_seed(seed),
            None => HmmRng::from_entropy(),
        };
        Ok(Self {
            config,
            emission,
            start_prob: None,
            trans_mat: None,
            monitor,
            rng,
        })
    }

    /// Number of hidden states.
    pub fn n_states(&self) -> usize {
        self.emission.n_states()
    }

    /// The emission family.
    pub fn emission(&self) -> &E {
        &self.emission
    }

    /// The shared options.
    pub fn config(&self) -> &HmmConfig {
        &self.config
    }

    /// The convergence monitor of the most recent `fit`.
    pub fn monitor(&self) -> &ConvergenceMonitor {
        &self.monitor
    }

    /// The start distribution, if set.
    pub fn start_prob(&self) -> Option<&DVector<f64>> {
        self.start_prob.as_ref()
    }

    /// The transition matrix, if set.
    pub fn trans_mat(&self) -> Option<&DMatrix<f64>> {
        self.trans_mat.as_ref()
    }

    /// Replaces the random stream, e.g. with an injected generator.
    pub fn set_rng(&mut self, rng: HmmRng) {
        self.rng = rng;
    }

    /// Supplies the start distribution explicitly.
    pub fn with_start_prob(mut self, start_prob: DVector<f64>) -> HmmResult<Self> {
        self.set_start_prob(start_prob)?;
        Ok(self)
    }

    /// Supplies the transition matrix explicitly.
    pub fn with_trans_mat(mut self, trans_mat: DMatrix<f64>) -> HmmResult<Self> {
        self.set_trans_mat(trans_mat)?;
        Ok(self)
    }

    /// Replaces the start distribution, validating length and
    /// stochasticity.
    pub fn set_start_prob(&mut self, start_prob: DVector<f64>) -> HmmResult<()> {
        let n = self.n_states();
        if start_prob.len() != n {
            return Err(HmmError::ShapeMismatch {
                what: "start_prob",
                expected: n.to_string(),
                actual: start_prob.len().to_string(),
            });
        }
        validate_probability_vector(&start_prob, "start_prob", crate::numerics::constants::STOCHASTIC_TOL)?;
        self.start_prob = Some(start_prob);
        Ok(())
    }

    /// Replaces the transition matrix, validating shape and row
    /// stochasticity.
    pub fn set_trans_mat(&mut self, trans_mat: DMatrix<f64>) -> HmmResult<()> {
        let n = self.n_states();
        if trans_mat.shape() != (n, n) {
            return Err(HmmError::ShapeMismatch {
                what: "trans_mat",
                expected: format!("{n}x{n}"),
                actual: format!("{}x{}", trans_mat.nrows(), trans_mat.ncols()),
            });
        }
        validate_row_stochastic(&trans_mat, "trans_mat")?;
        self.trans_mat = Some(trans_mat);
        Ok(())
    }

    fn require_start(&self) -> HmmResult<&DVector<f64>> {
        self.start_prob.as_ref().ok_or(HmmError::NotFitted { what: "start_prob" })
    }

    fn require_trans(&self) -> HmmResult<&DMatrix<f64>> {
        self.trans_mat.as_ref().ok_or(HmmError::NotFitted { what: "trans_mat" })
    }

    /// Full parameter check used at every inference boundary.
    fn validate_parameters(&self) -> HmmResult<()> {
        validate_probability_vector(
            self.require_start()?,
            "start_prob",
            crate::numerics::constants::STOCHASTIC_TOL,
        )?;
        validate_row_stochastic(self.require_trans()?, "trans_mat")?;
        self.emission.validate()
    }

    /// Resolves a letter selection against this family, with `None`
    /// meaning "all recognised letters".
    fn resolve_selection(
        &self,
        selection: Option<&ParamSelection>,
        option: &'static str,
    ) -> HmmResult<ParamSelection> {
        let mut allowed = vec!['s', 't'];
        allowed.extend_from_slice(self.emission.letters());
        match selection {
            None => Ok(ParamSelection::from_letters(&allowed)),
            Some(selection) => {
                selection.validate_against(
                    &allowed,
                    option,
                    "'s', 't', and the family's parameter letters",
                )?;
                Ok(selection.clone())
            }
        }
    }

    /// Number of freely estimated scalars under the configured `params`.
    pub fn free_parameters(&self) -> HmmResult<usize> {
        let train = self.resolve_selection(self.config.params.as_ref(), "params")?;
        let n = self.n_states();
        let mut count = self.emission.free_parameters(&train);
        if train.contains('s') {
            count += n - 1;
        }
        if train.contains('t') {
            count += n * (n - 1);
        }
        Ok(count)
    }

    fn run_forward_backward(&self, frame: &DMatrix<f64>, want_xi: bool) -> HmmResult<LatticePass> {
        let start = self.require_start()?;
        let trans = self.require_trans()?;
        Ok(match self.config.implementation {
            LatticeImpl::Log => forward_backward_log(start, trans, frame, want_xi),
            LatticeImpl::Scaling => forward_backward_scaling(start, trans, frame, want_xi),
        })
    }

    /// Runs Baum-Welch until convergence or the iteration budget and
    /// returns the final per-iteration log-probability.
    pub fn fit(&mut self, observations: &[E::Obs], lengths: Option<&[usize]>) -> HmmResult<f64>
    where
        E: Sync,
    {
        let train = self.resolve_selection(self.config.params.as_ref(), "params")?;
        let init = self.resolve_selection(self.config.init_params.as_ref(), "init_params")?;
        let sequences = split_sequences(observations, lengths)?;
        let n = self.n_states();

        // Initialisation fills whatever the caller left unset; start and
        // transition probabilities default to uniform.
        if self.start_prob.is_none() {
            self.start_prob = Some(DVector::from_element(n, 1.0 / n as f64));
        }
        if self.trans_mat.is_none() {
            self.trans_mat = Some(DMatrix::from_element(n, n, 1.0 / n as f64));
        }
        let mut rng = self.rng.clone();
        self.emission.initialize(observations, &init, &mut rng)?;
        self.rng = rng;
        self.validate_parameters()?;

        self.monitor.reset();
        let want_xi = train.contains('t');
        loop {
            // E-step: independent subsequences fan out over the pool; the
            // reduction below walks the results in subsequence order.
            let contributions: Vec<HmmResult<SequenceContribution<E::Stats>>> = {
                let start = self.require_start()?;
                let trans = self.require_trans()?;
                let emission = &self.emission;
                let implementation = self.config.implementation;
                sequences
                    .clone()
                    .into_par_iter()
                    .map(|sequence| {
                        e_step_sequence(emission, start, trans, implementation, want_xi, sequence)
                    })
                    .collect()
            };

            let mut iter_log_prob = 0.0;
            let mut start_acc = DVector::zeros(n);
            let mut trans_acc = DMatrix::zeros(n, n);
            let mut emission_stats = self.emission.empty_stats();
            for contribution in contributions {
                let contribution = contribution?;
                iter_log_prob += contribution.log_prob;
                start_acc += contribution.first_posterior;
                trans_acc += contribution.xi_sum;
                self.emission.merge_stats(&mut emission_stats, contribution.emission_stats);
            }

            // M-step for the selected parameters only.
            if train.contains('s') {
                normalize_with_prior(&mut start_acc, self.config.start_prob_prior);
                validate_probability_vector(&start_acc, "start_prob", REESTIMATE_TOL)?;
                self.start_prob = Some(start_acc);
            }
            if train.contains('t') {
                normalize_rows_with_prior(&mut trans_acc, self.config.trans_mat_prior);
                for i in 0..n {
                    let row_sum: f64 = trans_acc.row(i).iter().sum();
                    if (row_sum - 1.0).abs() > REESTIMATE_TOL {
                        return Err(HmmError::NotStochastic {
                            what: "trans_mat",
                            reason: format!("re-estimated row {i} sums to {row_sum}"),
                        });
                    }
                }
                self.trans_mat = Some(trans_acc);
            }
            self.emission.m_step(&emission_stats, &train)?;

            self.monitor.report(iter_log_prob);
            if self.monitor.converged() {
                break;
            }
        }

        if self.config.require_convergence && !self.monitor.converged_by_tolerance() {
            return Err(HmmError::NotConverged {
                n_iter: self.config.n_iter,
                last_delta: self.monitor.last_delta().unwrap_or(f64::INFINITY),
            });
        }
        Ok(self.monitor.last_log_prob().unwrap_or(f64::NEG_INFINITY))
    }

    /// Total forward log-probability summed over subsequences.
    ///
    /// A model that assigns the observations zero mass yields −∞ rather
    /// than an error; only `fit` treats that as fatal.
    pub fn score(&self, observations: &[E::Obs], lengths: Option<&[usize]>) -> HmmResult<f64> {
        self.validate_parameters()?;
        let start = self.require_start()?;
        let trans = self.require_trans()?;
        let mut total = 0.0;
        for sequence in split_sequences(observations, lengths)? {
            let frame = self.emission.frame_log_prob(sequence)?;
            total += match self.config.implementation {
                LatticeImpl::Log => forward_log(start, trans, &frame).1,
                LatticeImpl::Scaling => forward_scaling(start, trans, &frame).2,
            };
        }
        Ok(total)
    }

    /// Total log-probability plus the concatenated state posteriors.
    pub fn score_samples(
        &self,
        observations: &[E::Obs],
        lengths: Option<&[usize]>,
    ) -> HmmResult<(f64, DMatrix<f64>)> {
        self.validate_parameters()?;
        let n = self.n_states();
        let mut posteriors = DMatrix::zeros(observations.len(), n);
        let mut total = 0.0;
        let mut offset = 0;
        for sequence in split_sequences(observations, lengths)? {
            let frame = self.emission.frame_log_prob(sequence)?;
            let pass = self.run_forward_backward(&frame, false)?;
            total += pass.log_prob;
            for t in 0..sequence.len() {
                for j in 0..n {
                    posteriors[(offset + t, j)] = pass.posteriors[(t, j)];
                }
            }
            offset += sequence.len();
        }
        Ok((total, posteriors))
    }

    /// State posteriors for every observation row.
    pub fn predict_proba(
        &self,
        observations: &[E::Obs],
        lengths: Option<&[usize]>,
    ) -> HmmResult<DMatrix<f64>> {
        Ok(self.score_samples(observations, lengths)?.1)
    }

    /// Decodes a state path with the configured algorithm.
    pub fn decode(
        &self,
        observations: &[E::Obs],
        lengths: Option<&[usize]>,
    ) -> HmmResult<(f64, Vec<usize>)> {
        self.decode_with(observations, lengths, self.config.algorithm)
    }

    /// Decodes a state path with an explicit algorithm choice.
    ///
    /// Both algorithms report the joint log-probability of the returned
    /// path, so the Viterbi score always dominates the MAP score.
    pub fn decode_with(
        &self,
        observations: &[E::Obs],
        lengths: Option<&[usize]>,
        algorithm: DecodeAlgorithm,
    ) -> HmmResult<(f64, Vec<usize>)> {
        self.validate_parameters()?;
        let start = self.require_start()?;
        let trans = self.require_trans()?;
        let mut total = 0.0;
        let mut path = Vec::with_capacity(observations.len());
        for sequence in split_sequences(observations, lengths)? {
            let frame = self.emission.frame_log_prob(sequence)?;
            match algorithm {
                DecodeAlgorithm::Viterbi => {
                    let (score, states) = viterbi(start, trans, &frame);
                    total += score;
                    path.extend(states);
                }
                DecodeAlgorithm::Map => {
                    let pass = self.run_forward_backward(&frame, false)?;
                    let states = argmax_rows(&pass.posteriors);
                    total += path_log_prob(start, trans, &frame, &states);
                    path.extend(states);
                }
            }
        }
        Ok((total, path))
    }

    /// The decoded state path alone.
    pub fn predict(
        &self,
        observations: &[E::Obs],
        lengths: Option<&[usize]>,
    ) -> HmmResult<Vec<usize>> {
        Ok(self.decode(observations, lengths)?.1)
    }

    /// Draws `n_samples` observations and their generating states from the
    /// model-owned random stream.
    pub fn sample(&mut self, n_samples: usize) -> HmmResult<(Vec<E::Obs>, Vec<usize>)> {
        let mut rng = self.rng.clone();
        let result = self.sample_with(n_samples, &mut rng);
        self.rng = rng;
        result
    }

    /// Draws from an injected random stream, leaving the model untouched.
    pub fn sample_with(
        &self,
        n_samples: usize,
        rng: &mut HmmRng,
    ) -> HmmResult<(Vec<E::Obs>, Vec<usize>)> {
        self.validate_parameters()?;
        let start = self.require_start()?;
        let trans = self.require_trans()?;
        let n = self.n_states();
        let mut observations = Vec::with_capacity(n_samples);
        let mut states = Vec::with_capacity(n_samples);
        let mut state = 0;
        for step in 0..n_samples {
            state = if step == 0 {
                rng.categorical(start.iter().copied())
            } else {
                rng.categorical((0..n).map(|j| trans[(state, j)]))
            };
            observations.push(self.emission.sample_state(state, rng)?);
            states.push(state);
        }
        Ok((observations, states))
    }

    /// Akaike information criterion of the current parameters on the data.
    pub fn aic(&self, observations: &[E::Obs], lengths: Option<&[usize]>) -> HmmResult<f64> {
        let log_prob = self.score(observations, lengths)?;
        Ok(-2.0 * log_prob + 2.0 * self.free_parameters()? as f64)
    }

    /// Bayesian information criterion of the current parameters on the
    /// data.
    pub fn bic(&self, observations: &[E::Obs], lengths: Option<&[usize]>) -> HmmResult<f64> {
        let log_prob = self.score(observations, lengths)?;
        let penalty = self.free_parameters()? as f64 * (observations.len().max(1) as f64).ln();
        Ok(-2.0 * log_prob + penalty)
    }

    /// Stationary distribution of the transition matrix by power
    /// iteration.
    pub fn stationary_distribution(&self) -> HmmResult<DVector<f64>> {
        let trans = self.require_trans()?;
        validate_row_stochastic(trans, "trans_mat")?;
        let n = self.n_states();
        let mut pi = DVector::from_element(n, 1.0 / n as f64);
        for _ in 0..1000 {
            let mut next = trans.transpose() * &pi;
            let total: f64 = next.iter().sum();
            if total <= 0.0 {
                return Err(HmmError::IllConditioned {
                    context: "power iteration on trans_mat collapsed to zero".to_string(),
                });
            }
            next /= total;
            let drift = (&next - &pi).abs().max();
            pi = next;
            if drift < 1e-13 {
                break;
            }
        }
        Ok(pi)
    }
}

/// One subsequence's E-step, runnable from a worker task: frame
/// probabilities, forward-backward, and private accumulation.
fn e_step_sequence<E: EmissionModel>(
    emission: &E,
    start: &DVector<f64>,
    trans: &DMatrix<f64>,
    implementation: LatticeImpl,
    want_xi: bool,
    sequence: &[E::Obs],
) -> HmmResult<SequenceContribution<E::Stats>> {
    let frame = emission.frame_log_prob(sequence)?;
    let pass = match implementation {
        LatticeImpl::Log => forward_backward_log(start, trans, &frame, want_xi),
        LatticeImpl::Scaling => forward_backward_scaling(start, trans, &frame, want_xi),
    };
    if !pass.log_prob.is_finite() {
        return Err(HmmError::IllConditioned {
            context: format!(
                "forward pass over a {}-frame subsequence returned log-probability {}",
                sequence.len(),
                pass.log_prob
            ),
        });
    }
    let mut emission_stats = emission.empty_stats();
    emission.accumulate(&mut emission_stats, sequence, &pass.posteriors)?;
    let first_posterior = if pass.posteriors.nrows() > 0 {
        pass.posteriors.row(0).transpose()
    } else {
        DVector::zeros(start.len())
    };
    Ok(SequenceContribution {
        log_prob: pass.log_prob,
        first_posterior,
        xi_sum: pass.xi_sum,
        emission_stats,
    })
}

/// Row-wise argmax with ties broken toward the lowest state index.
fn argmax_rows(posteriors: &DMatrix<f64>) -> Vec<usize> {
    let (rows, cols) = posteriors.shape();
    let mut states = Vec::with_capacity(rows);
    for t in 0..rows {
        let mut best = f64::NEG_INFINITY;
        let mut best_state = 0;
        for j in 0..cols {
            if posteriors[(t, j)] > best {
                best = posteriors[(t, j)];
                best_state = j;
            }
        }
        states.push(best_state);
    }
    states
}

/// Joint log-probability of a fixed state path.
fn path_log_prob(
    start: &DVector<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
    path: &[usize],
) -> f64 {
    let Some(&first) = path.first() else {
        return 0.0;
    };
    let mut total = log_or_neg_inf(start[first]) + frame_log_prob[(0, first)];
    for t in 1..path.len() {
        total += log_or_neg_inf(trans[(path[t - 1], path[t])]) + frame_log_prob[(t, path[t])];
    }
    total
}

/// Convenience alias for a categorical-emission model.
pub type CategoricalHmm = HiddenMarkovModel<crate::categorical::Categorical>;
/// Convenience alias for a Gaussian-emission model.
pub type GaussianHmm = HiddenMarkovModel<crate::gaussian::Gaussian>;
/// Convenience alias for a multinomial-emission model.
pub type MultinomialHmm = HiddenMarkovModel<crate::multinomial::Multinomial>;
/// Convenience alias for a Poisson-emission model.
pub type PoissonHmm = HiddenMarkovModel<crate::poisson::Poisson>;
/// Convenience alias for a Gaussian-mixture-emission model.
pub type GmmHmm = HiddenMarkovModel<crate::mixture::GaussianMixture>;
