//! # Hidden Markov Models
//!
//! Training and inference engine for discrete-time, finite-state hidden
//! Markov models with pluggable emission distributions.
//!
//! The crate provides the numerical core of an HMM toolkit: log-space
//! forward/backward and Viterbi recurrences over the time×state lattice,
//! Baum-Welch (EM) training with per-family sufficient statistics, and a
//! convergence monitor with numerical safeguards. Five emission families are
//! built in — categorical, Gaussian (spherical/diag/full/tied covariances),
//! multinomial, Poisson, and per-state Gaussian mixtures — and the estimator
//! is generic over the [`EmissionModel`] trait so further families plug in
//! without touching the core.
//!
//! ## Quick start
//!
//! ```rust
//! use hidden_markov::{Categorical, HiddenMarkovModel, HmmConfig};
//! use nalgebra::{DMatrix, DVector};
//!
//! fn main() -> Result<(), hidden_markov::HmmError> {
//!     // A two-state model over three symbols with known parameters.
//!     let emission = Categorical::new(2, 3)?.with_emission_prob(
//!         DMatrix::from_row_slice(2, 3, &[0.1, 0.4, 0.5, 0.6, 0.3, 0.1]),
//!     )?;
//!     let model = HiddenMarkovModel::new(emission, HmmConfig::default())?
//!         .with_start_prob(DVector::from_row_slice(&[0.6, 0.4]))?
//!         .with_trans_mat(DMatrix::from_row_slice(2, 2, &[0.7, 0.3, 0.4, 0.6]))?;
//!
//!     let observations = [0usize, 1, 2, 2, 1, 0];
//!     let log_prob = model.score(&observations, None)?;
//!     let (_, state_path) = model.decode(&observations, None)?;
//!     assert!(log_prob < 0.0);
//!     assert_eq!(state_path.len(), observations.len());
//!     Ok(())
//! }
//! ```
//!
//! Training works the same way with unset parameters: construct a family
//! without supplying them, seed the configuration, and call
//! [`HiddenMarkovModel::fit`] with the observation buffer and optional
//! subsequence lengths.
//!
//! ## Numerical conventions
//!
//! - Probabilities of zero are represented in log space by `-inf`, never by
//!   NaN; [`numerics::logsumexp`] treats an all-`-inf` input as `-inf`.
//! - Two forward-backward implementations are available ([`LatticeImpl`]):
//!   the default log-space recurrences and the rescaled probability-space
//!   recurrences, agreeing within 1e-8.
//! - Re-estimated probability rows are projected back onto the simplex with
//!   Dirichlet pseudocounts; covariances are floored and re-validated after
//!   every M-step.
//!
//! Persistence, data loading, and presentation are the host application's
//! responsibility; parameter types derive `serde` traits behind the `serde`
//! feature for hosts that want them.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Infrastructure
pub mod config;
pub mod errors;
pub mod monitor;
pub mod numerics;
pub mod rng;
pub mod sequences;
pub mod stochastic;

// Lattice recurrences and the estimator
pub mod lattice;
pub mod model;

// Emission families
pub mod categorical;
pub mod emission;
pub mod gaussian;
pub mod mixture;
pub mod multinomial;
pub mod poisson;

pub use config::{DecodeAlgorithm, HmmConfig, LatticeImpl};
pub use errors::{HmmError, HmmResult};
pub use model::{
    CategoricalHmm, GaussianHmm, GmmHmm, HiddenMarkovModel, MultinomialHmm, PoissonHmm,
};
pub use monitor::ConvergenceMonitor;
pub use rng::HmmRng;

pub use categorical::Categorical;
pub use emission::{CovarianceKind, EmissionModel, ParamSelection};
pub use gaussian::{Gaussian, StateCovariances};
pub use mixture::{GaussianMixture, MixtureCovariances};
pub use multinomial::Multinomial;
pub use poisson::Poisson;
