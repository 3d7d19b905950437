//! The emission-family abstraction.
//!
//! The HMM core is parameterised over an [`EmissionModel`]: every family
//! supplies per-frame log-likelihoods, sufficient-statistic accumulation, a
//! closed-form M-step, sampling, and parameter validation. Which parameters
//! participate in training and initialisation is selected by single-letter
//! flags, mirroring the `'s'`/`'t'` letters the estimator itself owns for the
//! start distribution and transition matrix.

use crate::errors::{HmmError, HmmResult};
use crate::rng::HmmRng;
use nalgebra::DMatrix;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A set of single-letter parameter flags such as `"st"` or `"stmc"`.
///
/// Letters are deduplicated and order-independent. Whether a letter is
/// recognised depends on the family it is checked against; unknown letters
/// are rejected at `fit` time rather than silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamSelection {
    letters: BTreeSet<char>,
}

impl ParamSelection {
    /// Builds a selection from an explicit letter set.
    pub fn from_letters(letters: &[char]) -> Self {
        Self {
            letters: letters.iter().copied().collect(),
        }
    }

    /// True when the letter is selected.
    pub fn contains(&self, letter: char) -> bool {
        self.letters.contains(&letter)
    }

    /// True when no letter is selected.
    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    /// Rejects any letter outside the permitted set.
    pub fn validate_against(
        &self,
        allowed: &[char],
        option: &'static str,
        expected: &'static str,
    ) -> HmmResult<()> {
        if let Some(bad) = self.letters.iter().copied().find(|letter| !allowed.contains(letter)) {
            return Err(HmmError::InvalidOption {
                option,
                value: bad.to_string(),
                expected,
            });
        }
        Ok(())
    }
}

impl FromStr for ParamSelection {
    type Err = HmmError;

    fn from_str(s: &str) -> HmmResult<Self> {
        let mut letters = BTreeSet::new();
        for ch in s.chars() {
            if !ch.is_ascii_lowercase() {
                return Err(HmmError::InvalidOption {
                    option: "params",
                    value: ch.to_string(),
                    expected: "lowercase ASCII parameter letters",
                });
            }
            letters.insert(ch);
        }
        Ok(Self { letters })
    }
}

impl fmt::Display for ParamSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for letter in &self.letters {
            write!(f, "{letter}")?;
        }
        Ok(())
    }
}

/// Storage layout of per-state covariance matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CovarianceKind {
    /// One shared variance per state.
    Spherical,
    /// Independent per-dimension variances per state.
    Diag,
    /// A dense covariance matrix per state.
    Full,
    /// A single dense covariance matrix shared by all states.
    Tied,
}

impl CovarianceKind {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            CovarianceKind::Spherical => "spherical",
            CovarianceKind::Diag => "diag",
            CovarianceKind::Full => "full",
            CovarianceKind::Tied => "tied",
        }
    }
}

impl FromStr for CovarianceKind {
    type Err = HmmError;

    fn from_str(s: &str) -> HmmResult<Self> {
        match s {
            "spherical" => Ok(CovarianceKind::Spherical),
            "diag" => Ok(CovarianceKind::Diag),
            "full" => Ok(CovarianceKind::Full),
            "tied" => Ok(CovarianceKind::Tied),
            other => Err(HmmError::InvalidOption {
                option: "covariance_type",
                value: other.to_string(),
                expected: "one of: spherical, diag, full, tied",
            }),
        }
    }
}

/// Capability set every emission family implements.
///
/// The estimator only ever talks to a family through this trait: it asks for
/// frame log-probabilities during the E-step, hands back posteriors for
/// accumulation, and triggers the closed-form M-step once all subsequences
/// are reduced.
pub trait EmissionModel {
    /// One observation row (a symbol index, a count vector, a real vector).
    type Obs: Clone + Send + Sync;

    /// Family-owned sufficient-statistic accumulator.
    type Stats: Send;

    /// Number of hidden states.
    fn n_states(&self) -> usize;

    /// Parameter letters this family recognises (excluding `'s'`/`'t'`).
    fn letters(&self) -> &'static [char];

    /// Checks that all parameters are present and well-formed.
    fn validate(&self) -> HmmResult<()>;

    /// Fills parameters selected by `selection` that the caller left unset,
    /// drawing from `rng` and the observations.
    fn initialize(
        &mut self,
        observations: &[Self::Obs],
        selection: &ParamSelection,
        rng: &mut HmmRng,
    ) -> HmmResult<()>;

    /// Per-frame emission log-probabilities, one row per observation and one
    /// column per state.
    fn frame_log_prob(&self, observations: &[Self::Obs]) -> HmmResult<DMatrix<f64>>;

    /// Allocates a zeroed accumulator.
    fn empty_stats(&self) -> Self::Stats;

    /// Folds one subsequence's posteriors into the accumulator.
    fn accumulate(
        &self,
        stats: &mut Self::Stats,
        observations: &[Self::Obs],
        posteriors: &DMatrix<f64>,
    ) -> HmmResult<()>;

    /// Elementwise reduction of a worker-private accumulator into `into`.
    fn merge_stats(&self, into: &mut Self::Stats, from: Self::Stats);

    /// Re-estimates the parameters selected by `selection`.
    fn m_step(&mut self, stats: &Self::Stats, selection: &ParamSelection) -> HmmResult<()>;

    /// Draws one observation from the given state.
    fn sample_state(&self, state: usize, rng: &mut HmmRng) -> HmmResult<Self::Obs>;

    /// Number of freely estimated scalars among the selected parameters.
    fn free_parameters(&self, selection: &ParamSelection) -> usize;
}
