//! Per-state Gaussian mixture emission family.
//!
//! Each hidden state owns M mixture components with their own weights, means,
//! and covariances. Frame likelihoods marginalise the mixture in log space;
//! accumulation splits each state posterior across components before reusing
//! the Gaussian moment updates per component.

use crate::emission::{CovarianceKind, EmissionModel, ParamSelection};
use crate::errors::{validate_positive_count, HmmError, HmmResult};
use crate::gaussian::pooled_covariance;
use crate::numerics::constants::LN_TWO_PI;
use crate::numerics::{logsumexp, GaussianFactor};
use crate::rng::HmmRng;
use crate::stochastic::{
    normalize_rows_with_prior, validate_covariance_matrix, validate_positive_variances,
    validate_row_stochastic,
};
use nalgebra::{DMatrix, DVector};

/// Weight below which a mixture component is left untouched by the M-step.
const MIN_POSTERIOR_WEIGHT: f64 = 1e-10;

/// Covariance storage for an N-state, M-component mixture.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MixtureCovariances {
    /// One variance per state and component (N×M).
    Spherical(DMatrix<f64>),
    /// Per-dimension variances per component; one M×D matrix per state.
    Diag(Vec<DMatrix<f64>>),
    /// A dense D×D covariance per state and component.
    Full(Vec<Vec<DMatrix<f64>>>),
    /// A single D×D covariance shared by the components of each state.
    Tied(Vec<DMatrix<f64>>),
}

impl MixtureCovariances {
    /// The layout tag of this storage.
    pub fn kind(&self) -> CovarianceKind {
        match self {
            MixtureCovariances::Spherical(_) => CovarianceKind::Spherical,
            MixtureCovariances::Diag(_) => CovarianceKind::Diag,
            MixtureCovariances::Full(_) => CovarianceKind::Full,
            MixtureCovariances::Tied(_) => CovarianceKind::Tied,
        }
    }

    fn validate(&self, n_states: usize, n_mix: usize, n_features: usize) -> HmmResult<()> {
        let bad_shape = |expected: String, actual: String| HmmError::ShapeMismatch {
            what: "covars",
            expected,
            actual,
        };
        match self {
            MixtureCovariances::Spherical(m) => {
                if m.shape() != (n_states, n_mix) {
                    return Err(bad_shape(
                        format!("{n_states}x{n_mix}"),
                        format!("{}x{}", m.nrows(), m.ncols()),
                    ));
                }
                for j in 0..n_states {
                    let row: Vec<f64> = m.row(j).iter().copied().collect();
                    validate_positive_variances(&row, j, "covars")?;
                }
                Ok(())
            }
            MixtureCovariances::Diag(per_state) => {
                if per_state.len() != n_states {
                    return Err(bad_shape(
                        format!("{n_states} variance blocks"),
                        per_state.len().to_string(),
                    ));
                }
                for (j, block) in per_state.iter().enumerate() {
                    if block.shape() != (n_mix, n_features) {
                        return Err(bad_shape(
                            format!("{n_mix}x{n_features}"),
                            format!("{}x{}", block.nrows(), block.ncols()),
                        ));
                    }
                    let all: Vec<f64> = block.iter().copied().collect();
                    validate_positive_variances(&all, j, "covars")?;
                }
                Ok(())
            }
            MixtureCovariances::Full(per_state) => {
                if per_state.len() != n_states {
                    return Err(bad_shape(
                        format!("{n_states} covariance blocks"),
                        per_state.len().to_string(),
                    ));
                }
                for (j, block) in per_state.iter().enumerate() {
                    if block.len() != n_mix {
                        return Err(bad_shape(
                            format!("{n_mix} matrices per state"),
                            block.len().to_string(),
                        ));
                    }
                    for cov in block {
                        validate_covariance_matrix(cov, n_features, j, "covars")?;
                    }
                }
                Ok(())
            }
            MixtureCovariances::Tied(per_state) => {
                if per_state.len() != n_states {
                    return Err(bad_shape(
                        format!("{n_states} covariance matrices"),
                        per_state.len().to_string(),
                    ));
                }
                for (j, cov) in per_state.iter().enumerate() {
                    validate_covariance_matrix(cov, n_features, j, "covars")?;
                }
                Ok(())
            }
        }
    }
}

/// Gaussian-mixture emissions: `p(x | j) = Σ_m w[j,m] N(x | μ[j,m], Σ[j,m])`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianMixture {
    n_states: usize,
    n_mix: usize,
    n_features: usize,
    kind: CovarianceKind,
    weights: Option<DMatrix<f64>>,
    means: Option<Vec<DMatrix<f64>>>,
    covars: Option<MixtureCovariances>,
    min_covar: f64,
    /// Dirichlet pseudocount on the mixture weights; 1 gives the MLE.
    weights_prior: f64,
    means_prior: f64,
    means_weight: f64,
    covars_prior: f64,
    covars_weight: f64,
}

impl GaussianMixture {
    /// Creates an unparameterised mixture family.
    pub fn new(
        n_states: usize,
        n_mix: usize,
        n_features: usize,
        kind: CovarianceKind,
    ) -> HmmResult<Self> {
        validate_positive_count(n_states, "n_components")?;
        validate_positive_count(n_mix, "n_mix")?;
        validate_positive_count(n_features, "n_features")?;
        Ok(Self {
            n_states,
            n_mix,
            n_features,
            kind,
            weights: None,
            means: None,
            covars: None,
            min_covar: 1e-3,
            weights_prior: 1.0,
            means_prior: 0.0,
            means_weight: 0.0,
            covars_prior: 0.0,
            covars_weight: 0.0,
        })
    }

    /// Overrides the covariance floor.
    pub fn with_min_covar(mut self, min_covar: f64) -> HmmResult<Self> {
        crate::errors::validate_above(min_covar, 0.0, "min_covar")?;
        self.min_covar = min_covar;
        Ok(self)
    }

    /// Sets the Dirichlet pseudocount on the mixture weights.
    pub fn with_weights_prior(mut self, weights_prior: f64) -> Self {
        self.weights_prior = weights_prior;
        self
    }

    /// Sets the conjugate-MAP priors shared with the Gaussian family.
    pub fn with_gaussian_priors(
        mut self,
        means_prior: f64,
        means_weight: f64,
        covars_prior: f64,
        covars_weight: f64,
    ) -> Self {
        self.means_prior = means_prior;
        self.means_weight = means_weight;
        self.covars_prior = covars_prior;
        self.covars_weight = covars_weight;
        self
    }

    /// Supplies the mixture weights explicitly (N×M, row-stochastic).
    pub fn with_weights(mut self, weights: DMatrix<f64>) -> HmmResult<Self> {
        if weights.shape() != (self.n_states, self.n_mix) {
            return Err(HmmError::ShapeMismatch {
                what: "weights",
                expected: format!("{}x{}", self.n_states, self.n_mix),
                actual: format!("{}x{}", weights.nrows(), weights.ncols()),
            });
        }
        validate_row_stochastic(&weights, "weights")?;
        self.weights = Some(weights);
        Ok(self)
    }

    /// Supplies per-state component means (one M×D matrix per state).
    pub fn with_means(mut self, means: Vec<DMatrix<f64>>) -> HmmResult<Self> {
        if means.len() != self.n_states {
            return Err(HmmError::ShapeMismatch {
                what: "means",
                expected: format!("{} mean blocks", self.n_states),
                actual: means.len().to_string(),
            });
        }
        for block in &means {
            if block.shape() != (self.n_mix, self.n_features) {
                return Err(HmmError::ShapeMismatch {
                    what: "means",
                    expected: format!("{}x{}", self.n_mix, self.n_features),
                    actual: format!("{}x{}", block.nrows(), block.ncols()),
                });
            }
        }
        self.means = Some(means);
        Ok(self)
    }

    /// Supplies the covariances; the storage variant must match the
    /// configured covariance kind.
    pub fn with_covariances(mut self, covars: MixtureCovariances) -> HmmResult<Self> {
        if covars.kind() != self.kind {
            return Err(HmmError::InvalidOption {
                option: "covars",
                value: covars.kind().as_str().to_string(),
                expected: "a storage variant matching covariance_type",
            });
        }
        covars.validate(self.n_states, self.n_mix, self.n_features)?;
        self.covars = Some(covars);
        Ok(self)
    }

    /// The fitted mixture weights, if set.
    pub fn weights(&self) -> Option<&DMatrix<f64>> {
        self.weights.as_ref()
    }

    /// The fitted component means, if set.
    pub fn means(&self) -> Option<&Vec<DMatrix<f64>>> {
        self.means.as_ref()
    }

    /// The fitted covariances, if set.
    pub fn covariances(&self) -> Option<&MixtureCovariances> {
        self.covars.as_ref()
    }

    fn require_weights(&self) -> HmmResult<&DMatrix<f64>> {
        self.weights.as_ref().ok_or(HmmError::NotFitted { what: "weights" })
    }

    fn require_means(&self) -> HmmResult<&Vec<DMatrix<f64>>> {
        self.means.as_ref().ok_or(HmmError::NotFitted { what: "means" })
    }

    fn require_covars(&self) -> HmmResult<&MixtureCovariances> {
        self.covars.as_ref().ok_or(HmmError::NotFitted { what: "covars" })
    }

    fn check_row(&self, row: &DVector<f64>) -> HmmResult<()> {
        if row.len() != self.n_features {
            return Err(HmmError::ShapeMismatch {
                what: "observation row",
                expected: self.n_features.to_string(),
                actual: row.len().to_string(),
            });
        }
        Ok(())
    }

    /// Log of `w[j,m] · N(x_t | μ[j,m], Σ[j,m])` for every frame and
    /// component, one T×M matrix per state.
    fn weighted_component_log_prob(
        &self,
        observations: &[DVector<f64>],
    ) -> HmmResult<Vec<DMatrix<f64>>> {
        let weights = self.require_weights()?;
        let means = self.require_means()?;
        let covars = self.require_covars()?;
        for row in observations {
            self.check_row(row)?;
        }
        let frames = observations.len();
        let dim = self.n_features as f64;
        let mut per_state = Vec::with_capacity(self.n_states);
        for j in 0..self.n_states {
            let mut block = DMatrix::zeros(frames, self.n_mix);
            for m in 0..self.n_mix {
                let log_weight = if weights[(j, m)] > 0.0 {
                    weights[(j, m)].ln()
                } else {
                    f64::NEG_INFINITY
                };
                let mean = means[j].row(m).transpose();
                match covars {
                    MixtureCovariances::Spherical(vars) => {
                        let var = vars[(j, m)];
                        let log_det = dim * var.ln();
                        for (t, x) in observations.iter().enumerate() {
                            let sq = (x - &mean).norm_squared() / var;
                            block[(t, m)] =
                                log_weight - 0.5 * (dim * LN_TWO_PI + log_det + sq);
                        }
                    }
                    MixtureCovariances::Diag(per_state_vars) => {
                        let vars = &per_state_vars[j];
                        let log_det: f64 =
                            (0..self.n_features).map(|d| vars[(m, d)].ln()).sum();
                        for (t, x) in observations.iter().enumerate() {
                            let mut sq = 0.0;
                            for d in 0..self.n_features {
                                let diff = x[d] - mean[d];
                                sq += diff * diff / vars[(m, d)];
                            }
                            block[(t, m)] =
                                log_weight - 0.5 * (dim * LN_TWO_PI + log_det + sq);
                        }
                    }
                    MixtureCovariances::Full(per_state_mats) => {
                        let factor =
                            GaussianFactor::try_new(&per_state_mats[j][m], self.min_covar, j)?;
                        for (t, x) in observations.iter().enumerate() {
                            block[(t, m)] = log_weight + factor.log_density(x, &mean);
                        }
                    }
                    MixtureCovariances::Tied(per_state_mats) => {
                        let factor =
                            GaussianFactor::try_new(&per_state_mats[j], self.min_covar, j)?;
                        for (t, x) in observations.iter().enumerate() {
                            block[(t, m)] = log_weight + factor.log_density(x, &mean);
                        }
                    }
                }
            }
            per_state.push(block);
        }
        Ok(per_state)
    }
}

/// Posterior-weighted per-component moments.
#[derive(Debug, Clone)]
pub struct MixtureStats {
    post_mix: DMatrix<f64>,
    obs_mix: Vec<DMatrix<f64>>,
    obs_sq_mix: Vec<DMatrix<f64>>,
    obs_outer_mix: Option<Vec<Vec<DMatrix<f64>>>>,
}

impl EmissionModel for GaussianMixture {
    type Obs = DVector<f64>;
    type Stats = MixtureStats;

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn letters(&self) -> &'static [char] {
        &['w', 'm', 'c']
    }

    fn validate(&self) -> HmmResult<()> {
        validate_row_stochastic(self.require_weights()?, "weights")?;
        let means = self.require_means()?;
        if means.len() != self.n_states {
            return Err(HmmError::ShapeMismatch {
                what: "means",
                expected: format!("{} mean blocks", self.n_states),
                actual: means.len().to_string(),
            });
        }
        self.require_covars()?
            .validate(self.n_states, self.n_mix, self.n_features)
    }

    fn initialize(
        &mut self,
        observations: &[DVector<f64>],
        selection: &ParamSelection,
        rng: &mut HmmRng,
    ) -> HmmResult<()> {
        let needs_weights = selection.contains('w') && self.weights.is_none();
        let needs_means = selection.contains('m') && self.means.is_none();
        let needs_covars = selection.contains('c') && self.covars.is_none();
        if !(needs_weights || needs_means || needs_covars) {
            return Ok(());
        }
        if needs_weights {
            self.weights = Some(DMatrix::from_element(
                self.n_states,
                self.n_mix,
                1.0 / self.n_mix as f64,
            ));
        }
        if needs_means || needs_covars {
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
        }
        if needs_means {
            let mut blocks = Vec::with_capacity(self.n_states);
            for _ in 0..self.n_states {
                let mut block = DMatrix::zeros(self.n_mix, self.n_features);
                for m in 0..self.n_mix {
                    let source = &observations[rng.below(observations.len())];
                    for d in 0..self.n_features {
                        block[(m, d)] = source[d];
                    }
                }
                blocks.push(block);
            }
            self.means = Some(blocks);
        }
        if needs_covars {
            let pooled = pooled_covariance(observations, self.n_features, self.min_covar);
            self.covars = Some(match self.kind {
                CovarianceKind::Spherical => {
                    let avg = pooled.diagonal().sum() / self.n_features as f64;
                    MixtureCovariances::Spherical(DMatrix::from_element(
                        self.n_states,
                        self.n_mix,
                        avg,
                    ))
                }
                CovarianceKind::Diag => {
                    let diag = pooled.diagonal();
                    MixtureCovariances::Diag(vec![
                        DMatrix::from_fn(self.n_mix, self.n_features, |_, d| diag[d]);
                        self.n_states
                    ])
                }
                CovarianceKind::Full => MixtureCovariances::Full(vec![
                    vec![pooled.clone(); self.n_mix];
                    self.n_states
                ]),
                CovarianceKind::Tied => {
                    MixtureCovariances::Tied(vec![pooled; self.n_states])
                }
            });
        }
        Ok(())
    }

    fn frame_log_prob(&self, observations: &[DVector<f64>]) -> HmmResult<DMatrix<f64>> {
        let weighted = self.weighted_component_log_prob(observations)?;
        let frames = observations.len();
        let mut frame = DMatrix::zeros(frames, self.n_states);
        let mut work = vec![0.0; self.n_mix];
        for (j, block) in weighted.iter().enumerate() {
            for t in 0..frames {
                for m in 0..self.n_mix {
                    work[m] = block[(t, m)];
                }
                frame[(t, j)] = logsumexp(&work);
            }
        }
        Ok(frame)
    }

    fn empty_stats(&self) -> MixtureStats {
        let wants_outer = matches!(self.kind, CovarianceKind::Full | CovarianceKind::Tied);
        MixtureStats {
            post_mix: DMatrix::zeros(self.n_states, self.n_mix),
            obs_mix: vec![DMatrix::zeros(self.n_mix, self.n_features); self.n_states],
            obs_sq_mix: vec![DMatrix::zeros(self.n_mix, self.n_features); self.n_states],
            obs_outer_mix: wants_outer.then(|| {
                vec![
                    vec![DMatrix::zeros(self.n_features, self.n_features); self.n_mix];
                    self.n_states
                ]
            }),
        }
    }

    fn accumulate(
        &self,
        stats: &mut MixtureStats,
        observations: &[DVector<f64>],
        posteriors: &DMatrix<f64>,
    ) -> HmmResult<()> {
        let weighted = self.weighted_component_log_prob(observations)?;
        let mut work = vec![0.0; self.n_mix];
        for (t, x) in observations.iter().enumerate() {
            for j in 0..self.n_states {
                let state_weight = posteriors[(t, j)];
                if state_weight <= 0.0 {
                    continue;
                }
                for m in 0..self.n_mix {
                    work[m] = weighted[j][(t, m)];
                }
                let normaliser = logsumexp(&work);
                if normaliser == f64::NEG_INFINITY {
                    continue;
                }
                for m in 0..self.n_mix {
                    let weight = state_weight * (work[m] - normaliser).exp();
                    stats.post_mix[(j, m)] += weight;
                    for d in 0..self.n_features {
                        stats.obs_mix[j][(m, d)] += weight * x[d];
                        stats.obs_sq_mix[j][(m, d)] += weight * x[d] * x[d];
                    }
                    if let Some(outer) = stats.obs_outer_mix.as_mut() {
                        for a in 0..self.n_features {
                            let wa = weight * x[a];
                            for b in 0..self.n_features {
                                outer[j][m][(a, b)] += wa * x[b];
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_stats(&self, into: &mut MixtureStats, from: MixtureStats) {
        into.post_mix += from.post_mix;
        for (dst, src) in into.obs_mix.iter_mut().zip(from.obs_mix) {
            *dst += src;
        }
        for (dst, src) in into.obs_sq_mix.iter_mut().zip(from.obs_sq_mix) {
            *dst += src;
        }
        if let (Some(dst), Some(src)) = (into.obs_outer_mix.as_mut(), from.obs_outer_mix) {
            for (dj, sj) in dst.iter_mut().zip(src) {
                for (dm, sm) in dj.iter_mut().zip(sj) {
                    *dm += sm;
                }
            }
        }
    }

    fn m_step(&mut self, stats: &MixtureStats, selection: &ParamSelection) -> HmmResult<()> {
        if selection.contains('w') {
            let mut weights = stats.post_mix.clone();
            normalize_rows_with_prior(&mut weights, self.weights_prior);
            self.weights = Some(weights);
        }
        let mut means = self.require_means()?.clone();
        if selection.contains('m') {
            for j in 0..self.n_states {
                for m in 0..self.n_mix {
                    if stats.post_mix[(j, m)] <= MIN_POSTERIOR_WEIGHT {
                        continue;
                    }
                    let denom = self.means_weight + stats.post_mix[(j, m)];
                    for d in 0..self.n_features {
                        means[j][(m, d)] = (self.means_weight * self.means_prior
                            + stats.obs_mix[j][(m, d)])
                            / denom;
                    }
                }
            }
            self.means = Some(means.clone());
        }
        if selection.contains('c') {
            let covars = self.reestimate_covariances(stats, &means)?;
            covars.validate(self.n_states, self.n_mix, self.n_features)?;
            self.covars = Some(covars);
        }
        Ok(())
    }

    fn sample_state(&self, state: usize, rng: &mut HmmRng) -> HmmResult<DVector<f64>> {
        let weights = self.require_weights()?;
        let means = self.require_means()?;
        let covars = self.require_covars()?;
        let m = rng.categorical((0..self.n_mix).map(|m| weights[(state, m)]));
        let mean = means[state].row(m).transpose();
        let z = rng.standard_normal_vector(self.n_features);
        Ok(match covars {
            MixtureCovariances::Spherical(vars) => &mean + z * vars[(state, m)].sqrt(),
            MixtureCovariances::Diag(per_state) => DVector::from_fn(self.n_features, |d, _| {
                mean[d] + per_state[state][(m, d)].sqrt() * z[d]
            }),
            MixtureCovariances::Full(per_state) => {
                let factor =
                    GaussianFactor::try_new(&per_state[state][m], self.min_covar, state)?;
                factor.correlate(&mean, &z)
            }
            MixtureCovariances::Tied(per_state) => {
                let factor = GaussianFactor::try_new(&per_state[state], self.min_covar, state)?;
                factor.correlate(&mean, &z)
            }
        })
    }

    fn free_parameters(&self, selection: &ParamSelection) -> usize {
        let mut count = 0;
        if selection.contains('w') {
            count += self.n_states * (self.n_mix - 1);
        }
        if selection.contains('m') {
            count += self.n_states * self.n_mix * self.n_features;
        }
        if selection.contains('c') {
            let triangle = self.n_features * (self.n_features + 1) / 2;
            count += match self.kind {
                CovarianceKind::Spherical => self.n_states * self.n_mix,
                CovarianceKind::Diag => self.n_states * self.n_mix * self.n_features,
                CovarianceKind::Full => self.n_states * self.n_mix * triangle,
                CovarianceKind::Tied => self.n_states * triangle,
            };
        }
        count
    }
}

impl GaussianMixture {
    /// Per-component covariance re-estimation reusing the Gaussian
    /// conjugate-MAP forms with the split posteriors.
    fn reestimate_covariances(
        &self,
        stats: &MixtureStats,
        means: &[DMatrix<f64>],
    ) -> HmmResult<MixtureCovariances> {
        let dim = self.n_features;
        let diag_estimate = |j: usize, m: usize| -> DVector<f64> {
            DVector::from_fn(dim, |d, _| {
                let mean = means[j][(m, d)];
                let mean_diff = mean - self.means_prior;
                let num = self.covars_prior
                    + self.means_weight * mean_diff * mean_diff
                    + stats.obs_sq_mix[j][(m, d)]
                    - 2.0 * mean * stats.obs_mix[j][(m, d)]
                    + stats.post_mix[(j, m)] * mean * mean;
                let den = (self.covars_weight - 1.0).max(0.0) + stats.post_mix[(j, m)];
                (num / den).max(self.min_covar)
            })
        };
        match self.kind {
            CovarianceKind::Diag => {
                let mut per_state = match self.require_covars()? {
                    MixtureCovariances::Diag(existing) => existing.clone(),
                    _ => vec![
                        DMatrix::from_element(self.n_mix, dim, self.min_covar);
                        self.n_states
                    ],
                };
                for j in 0..self.n_states {
                    for m in 0..self.n_mix {
                        if stats.post_mix[(j, m)] <= MIN_POSTERIOR_WEIGHT {
                            continue;
                        }
                        let estimate = diag_estimate(j, m);
                        for d in 0..dim {
                            per_state[j][(m, d)] = estimate[d];
                        }
                    }
                }
                Ok(MixtureCovariances::Diag(per_state))
            }
            CovarianceKind::Spherical => {
                let mut vars = match self.require_covars()? {
                    MixtureCovariances::Spherical(existing) => existing.clone(),
                    _ => DMatrix::from_element(self.n_states, self.n_mix, self.min_covar),
                };
                for j in 0..self.n_states {
                    for m in 0..self.n_mix {
                        if stats.post_mix[(j, m)] <= MIN_POSTERIOR_WEIGHT {
                            continue;
                        }
                        vars[(j, m)] = diag_estimate(j, m).sum() / dim as f64;
                    }
                }
                Ok(MixtureCovariances::Spherical(vars))
            }
            CovarianceKind::Full | CovarianceKind::Tied => {
                let outer = stats.obs_outer_mix.as_ref().ok_or(HmmError::ShapeMismatch {
                    what: "sufficient statistics",
                    expected: "outer-product moments for full/tied covariances".to_string(),
                    actual: "elementwise moments only".to_string(),
                })?;
                let cv_num = |j: usize, m: usize| -> DMatrix<f64> {
                    let mean = means[j].row(m).transpose();
                    let obs = stats.obs_mix[j].row(m).transpose();
                    let mean_diff = mean.map(|v| v - self.means_prior);
                    let mut num = &outer[j][m]
                        - &obs * mean.transpose()
                        - &mean * obs.transpose()
                        + stats.post_mix[(j, m)] * &mean * mean.transpose();
                    num += self.means_weight * &mean_diff * mean_diff.transpose();
                    for d in 0..dim {
                        num[(d, d)] += self.covars_prior;
                    }
                    num
                };
                let cv_weight = (self.covars_weight - dim as f64).max(0.0);
                if self.kind == CovarianceKind::Full {
                    let mut per_state = match self.require_covars()? {
                        MixtureCovariances::Full(existing) => existing.clone(),
                        _ => vec![
                            vec![DMatrix::identity(dim, dim) * self.min_covar; self.n_mix];
                            self.n_states
                        ],
                    };
                    for j in 0..self.n_states {
                        for m in 0..self.n_mix {
                            if stats.post_mix[(j, m)] <= MIN_POSTERIOR_WEIGHT {
                                continue;
                            }
                            let cov = cv_num(j, m) / (cv_weight + stats.post_mix[(j, m)]);
                            per_state[j][m] = self.floor_full(cov, j)?;
                        }
                    }
                    Ok(MixtureCovariances::Full(per_state))
                } else {
                    let mut per_state = match self.require_covars()? {
                        MixtureCovariances::Tied(existing) => existing.clone(),
                        _ => vec![DMatrix::identity(dim, dim) * self.min_covar; self.n_states],
                    };
                    for j in 0..self.n_states {
                        let state_post: f64 =
                            (0..self.n_mix).map(|m| stats.post_mix[(j, m)]).sum();
                        if state_post <= MIN_POSTERIOR_WEIGHT {
                            continue;
                        }
                        let mut sum = DMatrix::zeros(dim, dim);
                        for m in 0..self.n_mix {
                            sum += cv_num(j, m);
                        }
                        let cov = sum / (cv_weight + state_post);
                        per_state[j] = self.floor_full(cov, j)?;
                    }
                    Ok(MixtureCovariances::Tied(per_state))
                }
            }
        }
    }

    fn floor_full(&self, mut cov: DMatrix<f64>, state: usize) -> HmmResult<DMatrix<f64>> {
        if nalgebra::Cholesky::new(cov.clone()).is_some() {
            return Ok(cov);
        }
        log::warn!(
            "re-estimated mixture covariance for state {state} lost positive-definiteness; \
             flooring diagonal by {:e}",
            self.min_covar
        );
        for d in 0..self.n_features {
            cov[(d, d)] += self.min_covar;
        }
        if nalgebra::Cholesky::new(cov.clone()).is_none() {
            return Err(HmmError::NonPositiveDefinite { state });
        }
        Ok(cov)
    }
}
