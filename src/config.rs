//! Training and inference configuration.
//!
//! One configuration struct covers the options every family shares; family
//! specific knobs (priors, covariance type, trial counts) live on the
//! emission structs themselves.

use crate::emission::ParamSelection;
use crate::errors::{validate_above, validate_positive_count, HmmError, HmmResult};
use std::str::FromStr;

/// Decoding strategy used by `decode` and `predict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeAlgorithm {
    /// Joint maximum-probability state path (Viterbi).
    #[default]
    Viterbi,
    /// Per-frame argmax of the state posteriors.
    Map,
}

impl DecodeAlgorithm {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            DecodeAlgorithm::Viterbi => "viterbi",
            DecodeAlgorithm::Map => "map",
        }
    }
}

impl FromStr for DecodeAlgorithm {
    type Err = HmmError;

    fn from_str(s: &str) -> HmmResult<Self> {
        match s {
            "viterbi" => Ok(DecodeAlgorithm::Viterbi),
            "map" => Ok(DecodeAlgorithm::Map),
            other => Err(HmmError::InvalidOption {
                option: "algorithm",
                value: other.to_string(),
                expected: "one of: viterbi, map",
            }),
        }
    }
}

/// Which forward-backward implementation carries the E-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatticeImpl {
    /// Log-space recurrences; the default and the most robust.
    #[default]
    Log,
    /// Probability-space recurrences with per-step rescaling.
    Scaling,
}

impl LatticeImpl {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            LatticeImpl::Log => "log",
            LatticeImpl::Scaling => "scaling",
        }
    }
}

impl FromStr for LatticeImpl {
    type Err = HmmError;

    fn from_str(s: &str) -> HmmResult<Self> {
        match s {
            "log" => Ok(LatticeImpl::Log),
            "scaling" => Ok(LatticeImpl::Scaling),
            other => Err(HmmError::InvalidOption {
                option: "implementation",
                value: other.to_string(),
                expected: "one of: log, scaling",
            }),
        }
    }
}

/// Options shared by every model regardless of emission family.
#[derive(Debug, Clone)]
pub struct HmmConfig {
    /// Maximum number of EM iterations.
    pub n_iter: usize,
    /// Minimum log-probability gain that still counts as progress.
    pub tol: f64,
    /// Emit per-iteration progress through the `log` facade.
    pub verbose: bool,
    /// Decoding strategy for `decode`/`predict`.
    pub algorithm: DecodeAlgorithm,
    /// Forward-backward implementation.
    pub implementation: LatticeImpl,
    /// Parameters re-estimated by the M-step; `None` trains everything the
    /// family recognises.
    pub params: Option<ParamSelection>,
    /// Parameters filled by initialisation; `None` initialises everything
    /// the caller left unset.
    pub init_params: Option<ParamSelection>,
    /// Dirichlet pseudocount on the start distribution; 1 gives the MLE.
    pub start_prob_prior: f64,
    /// Dirichlet pseudocount on each transition row; 1 gives the MLE.
    pub trans_mat_prior: f64,
    /// Fail `fit` with `NotConverged` when the tolerance is never met.
    pub require_convergence: bool,
    /// Seed for the model-owned random stream; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            n_iter: 10,
            tol: 1e-2,
            verbose: false,
            algorithm: DecodeAlgorithm::default(),
            implementation: LatticeImpl::default(),
            params: None,
            init_params: None,
            start_prob_prior: 1.0,
            trans_mat_prior: 1.0,
            require_convergence: false,
            seed: None,
        }
    }
}

impl HmmConfig {
    /// Checks the scalar options; selection letters are validated against
    /// the family at `fit` time.
    pub fn validate(&self) -> HmmResult<()> {
        validate_positive_count(self.n_iter, "n_iter")?;
        validate_above(self.tol, 0.0, "tol")?;
        if !self.start_prob_prior.is_finite() || !self.trans_mat_prior.is_finite() {
            return Err(HmmError::InvalidOption {
                option: "priors",
                value: format!("{}/{}", self.start_prob_prior, self.trans_mat_prior),
                expected: "finite Dirichlet pseudocounts",
            });
        }
        Ok(())
    }

    /// Overrides the iteration budget.
    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    /// Overrides the convergence tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Seeds the model-owned random stream.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Selects the trained parameters from a letter string.
    pub fn with_params(mut self, letters: &str) -> HmmResult<Self> {
        self.params = Some(letters.parse()?);
        Ok(self)
    }

    /// Selects the initialised parameters from a letter string.
    pub fn with_init_params(mut self, letters: &str) -> HmmResult<Self> {
        self.init_params = Some(letters.parse()?);
        Ok(self)
    }
}
