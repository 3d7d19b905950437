//! Gaussian emission family with four covariance parameterisations.
//!
//! Observations are D-dimensional real vectors. Covariances are stored as a
//! tagged variant per parameterisation rather than a single implicitly-shaped
//! array, so each layout carries exactly the scalars it estimates.

use crate::emission::{CovarianceKind, EmissionModel, ParamSelection};
use crate::errors::{validate_positive_count, HmmError, HmmResult};
use crate::numerics::constants::LN_TWO_PI;
use crate::numerics::GaussianFactor;
use crate::rng::HmmRng;
use crate::stochastic::{validate_covariance_matrix, validate_positive_variances};
use nalgebra::{DMatrix, DVector};

/// Weight below which a state is considered unsupported by the data and its
/// parameters are left untouched by the M-step.
const MIN_POSTERIOR_WEIGHT: f64 = 1e-10;

/// Per-state covariance storage.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StateCovariances {
    /// One shared variance per state (length N).
    Spherical(DVector<f64>),
    /// Per-dimension variances per state (N×D).
    Diag(DMatrix<f64>),
    /// A dense D×D covariance per state.
    Full(Vec<DMatrix<f64>>),
    /// A single D×D covariance shared by every state.
    Tied(DMatrix<f64>),
}

impl StateCovariances {
    /// The layout tag of this storage.
    pub fn kind(&self) -> CovarianceKind {
        match self {
            StateCovariances::Spherical(_) => CovarianceKind::Spherical,
            StateCovariances::Diag(_) => CovarianceKind::Diag,
            StateCovariances::Full(_) => CovarianceKind::Full,
            StateCovariances::Tied(_) => CovarianceKind::Tied,
        }
    }

    fn validate(&self, n_states: usize, n_features: usize) -> HmmResult<()> {
        match self {
            StateCovariances::Spherical(v) => {
                if v.len() != n_states {
                    return Err(HmmError::ShapeMismatch {
                        what: "covars",
                        expected: format!("{n_states} spherical variances"),
                        actual: v.len().to_string(),
                    });
                }
                validate_positive_variances(v.as_slice(), 0, "covars")
            }
            StateCovariances::Diag(m) => {
                if m.shape() != (n_states, n_features) {
                    return Err(HmmError::ShapeMismatch {
                        what: "covars",
                        expected: format!("{n_states}x{n_features}"),
                        actual: format!("{}x{}", m.nrows(), m.ncols()),
                    });
                }
                for j in 0..n_states {
                    let row: Vec<f64> = m.row(j).iter().copied().collect();
                    validate_positive_variances(&row, j, "covars")?;
                }
                Ok(())
            }
            StateCovariances::Full(mats) => {
                if mats.len() != n_states {
                    return Err(HmmError::ShapeMismatch {
                        what: "covars",
                        expected: format!("{n_states} covariance matrices"),
                        actual: mats.len().to_string(),
                    });
                }
                for (j, cov) in mats.iter().enumerate() {
                    validate_covariance_matrix(cov, n_features, j, "covars")?;
                }
                Ok(())
            }
            StateCovariances::Tied(cov) => {
                validate_covariance_matrix(cov, n_features, 0, "covars")
            }
        }
    }
}

/// Gaussian emissions with state-dependent mean and covariance.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Gaussian {
    n_states: usize,
    n_features: usize,
    kind: CovarianceKind,
    means: Option<DMatrix<f64>>,
    covars: Option<StateCovariances>,
    /// Diagonal floor applied to re-estimated and factored covariances.
    min_covar: f64,
    means_prior: f64,
    means_weight: f64,
    covars_prior: f64,
    covars_weight: f64,
}

impl Gaussian {
    /// Creates an unparameterised family over `n_features` dimensions.
    pub fn new(n_states: usize, n_features: usize, kind: CovarianceKind) -> HmmResult<Self> {
        validate_positive_count(n_states, "n_components")?;
        validate_positive_count(n_features, "n_features")?;
        Ok(Self {
            n_states,
            n_features,
            kind,
            means: None,
            covars: None,
            min_covar: 1e-3,
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

    /// Sets the conjugate-MAP prior on the means: location `means_prior`
    /// with pseudo-observation weight `means_weight`. Zero weight gives
    /// the MLE.
    pub fn with_means_prior(mut self, means_prior: f64, means_weight: f64) -> Self {
        self.means_prior = means_prior;
        self.means_weight = means_weight;
        self
    }

    /// Sets the conjugate-MAP prior on the covariances. Zero values give
    /// the MLE.
    pub fn with_covars_prior(mut self, covars_prior: f64, covars_weight: f64) -> Self {
        self.covars_prior = covars_prior;
        self.covars_weight = covars_weight;
        self
    }

    /// Supplies the state means explicitly (N×D).
    pub fn with_means(mut self, means: DMatrix<f64>) -> HmmResult<Self> {
        self.set_means(means)?;
        Ok(self)
    }

    /// Supplies the covariances explicitly; the storage variant must match
    /// the configured covariance kind.
    pub fn with_covariances(mut self, covars: StateCovariances) -> HmmResult<Self> {
        self.set_covariances(covars)?;
        Ok(self)
    }

    /// Replaces the state means, validating the shape.
    pub fn set_means(&mut self, means: DMatrix<f64>) -> HmmResult<()> {
        if means.shape() != (self.n_states, self.n_features) {
            return Err(HmmError::ShapeMismatch {
                what: "means",
                expected: format!("{}x{}", self.n_states, self.n_features),
                actual: format!("{}x{}", means.nrows(), means.ncols()),
            });
        }
        self.means = Some(means);
        Ok(())
    }

    /// Replaces the covariances, validating layout and positive-definiteness.
    pub fn set_covariances(&mut self, covars: StateCovariances) -> HmmResult<()> {
        if covars.kind() != self.kind {
            return Err(HmmError::InvalidOption {
                option: "covars",
                value: covars.kind().as_str().to_string(),
                expected: "a storage variant matching covariance_type",
            });
        }
        covars.validate(self.n_states, self.n_features)?;
        self.covars = Some(covars);
        Ok(())
    }

    /// The fitted means, if set.
    pub fn means(&self) -> Option<&DMatrix<f64>> {
        self.means.as_ref()
    }

    /// The fitted covariances, if set.
    pub fn covariances(&self) -> Option<&StateCovariances> {
        self.covars.as_ref()
    }

    /// Number of observed dimensions.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    fn require_means(&self) -> HmmResult<&DMatrix<f64>> {
        self.means.as_ref().ok_or(HmmError::NotFitted { what: "means" })
    }

    fn require_covars(&self) -> HmmResult<&StateCovariances> {
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

    fn state_mean(&self, means: &DMatrix<f64>, j: usize) -> DVector<f64> {
        means.row(j).transpose()
    }

    /// Restores positive-definiteness after re-estimation by flooring the
    /// diagonal once; a second failure aborts training.
    fn floor_full(&self, mut cov: DMatrix<f64>, state: usize) -> HmmResult<DMatrix<f64>> {
        if nalgebra::Cholesky::new(cov.clone()).is_some() {
            return Ok(cov);
        }
        log::warn!(
            "re-estimated covariance for state {state} lost positive-definiteness; \
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

/// Posterior-weighted first and second moments per state.
#[derive(Debug, Clone)]
pub struct GaussianStats {
    post: DVector<f64>,
    obs: DMatrix<f64>,
    obs_sq: DMatrix<f64>,
    obs_outer: Option<Vec<DMatrix<f64>>>,
}

impl EmissionModel for Gaussian {
    type Obs = DVector<f64>;
    type Stats = GaussianStats;

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn letters(&self) -> &'static [char] {
        &['m', 'c']
    }

    fn validate(&self) -> HmmResult<()> {
        let means = self.require_means()?;
        if means.shape() != (self.n_states, self.n_features) {
            return Err(HmmError::ShapeMismatch {
                what: "means",
                expected: format!("{}x{}", self.n_states, self.n_features),
                actual: format!("{}x{}", means.nrows(), means.ncols()),
            });
        }
        self.require_covars()?.validate(self.n_states, self.n_features)
    }

    fn initialize(
        &mut self,
        observations: &[DVector<f64>],
        selection: &ParamSelection,
        rng: &mut HmmRng,
    ) -> HmmResult<()> {
        let needs_means = selection.contains('m') && self.means.is_none();
        let needs_covars = selection.contains('c') && self.covars.is_none();
        if !(needs_means || needs_covars) {
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
        if needs_means {
            self.means = Some(pick_rows_as_means(
                observations,
                self.n_states,
                self.n_features,
                rng,
            ));
        }
        if needs_covars {
            let pooled = pooled_covariance(observations, self.n_features, self.min_covar);
            self.covars = Some(match self.kind {
                CovarianceKind::Spherical => {
                    let avg = pooled.diagonal().sum() / self.n_features as f64;
                    StateCovariances::Spherical(DVector::from_element(self.n_states, avg))
                }
                CovarianceKind::Diag => {
                    let diag = pooled.diagonal();
                    StateCovariances::Diag(DMatrix::from_fn(
                        self.n_states,
                        self.n_features,
                        |_, d| diag[d],
                    ))
                }
                CovarianceKind::Full => {
                    StateCovariances::Full(vec![pooled.clone(); self.n_states])
                }
                CovarianceKind::Tied => StateCovariances::Tied(pooled),
            });
        }
        Ok(())
    }

    fn frame_log_prob(&self, observations: &[DVector<f64>]) -> HmmResult<DMatrix<f64>> {
        let means = self.require_means()?;
        let covars = self.require_covars()?;
        for row in observations {
            self.check_row(row)?;
        }
        let frames = observations.len();
        let dim = self.n_features as f64;
        let mut frame = DMatrix::zeros(frames, self.n_states);
        match covars {
            StateCovariances::Spherical(vars) => {
                for j in 0..self.n_states {
                    let var = vars[j];
                    let log_det = dim * var.ln();
                    let mean = self.state_mean(means, j);
                    for (t, x) in observations.iter().enumerate() {
                        let sq = (x - &mean).norm_squared() / var;
                        frame[(t, j)] = -0.5 * (dim * LN_TWO_PI + log_det + sq);
                    }
                }
            }
            StateCovariances::Diag(vars) => {
                for j in 0..self.n_states {
                    let log_det: f64 = (0..self.n_features).map(|d| vars[(j, d)].ln()).sum();
                    let mean = self.state_mean(means, j);
                    for (t, x) in observations.iter().enumerate() {
                        let mut sq = 0.0;
                        for d in 0..self.n_features {
                            let diff = x[d] - mean[d];
                            sq += diff * diff / vars[(j, d)];
                        }
                        frame[(t, j)] = -0.5 * (dim * LN_TWO_PI + log_det + sq);
                    }
                }
            }
            StateCovariances::Full(mats) => {
                for j in 0..self.n_states {
                    let factor = GaussianFactor::try_new(&mats[j], self.min_covar, j)?;
                    let mean = self.state_mean(means, j);
                    for (t, x) in observations.iter().enumerate() {
                        frame[(t, j)] = factor.log_density(x, &mean);
                    }
                }
            }
            StateCovariances::Tied(cov) => {
                let factor = GaussianFactor::try_new(cov, self.min_covar, 0)?;
                for j in 0..self.n_states {
                    let mean = self.state_mean(means, j);
                    for (t, x) in observations.iter().enumerate() {
                        frame[(t, j)] = factor.log_density(x, &mean);
                    }
                }
            }
        }
        Ok(frame)
    }

    fn empty_stats(&self) -> GaussianStats {
        let wants_outer = matches!(self.kind, CovarianceKind::Full | CovarianceKind::Tied);
        GaussianStats {
            post: DVector::zeros(self.n_states),
            obs: DMatrix::zeros(self.n_states, self.n_features),
            obs_sq: DMatrix::zeros(self.n_states, self.n_features),
            obs_outer: wants_outer.then(|| {
                vec![DMatrix::zeros(self.n_features, self.n_features); self.n_states]
            }),
        }
    }

    fn accumulate(
        &self,
        stats: &mut GaussianStats,
        observations: &[DVector<f64>],
        posteriors: &DMatrix<f64>,
    ) -> HmmResult<()> {
        for (t, x) in observations.iter().enumerate() {
            for j in 0..self.n_states {
                let weight = posteriors[(t, j)];
                stats.post[j] += weight;
                for d in 0..self.n_features {
                    stats.obs[(j, d)] += weight * x[d];
                    stats.obs_sq[(j, d)] += weight * x[d] * x[d];
                }
                if let Some(outer) = stats.obs_outer.as_mut() {
                    for a in 0..self.n_features {
                        let wa = weight * x[a];
                        for b in 0..self.n_features {
                            outer[j][(a, b)] += wa * x[b];
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_stats(&self, into: &mut GaussianStats, from: GaussianStats) {
        into.post += from.post;
        into.obs += from.obs;
        into.obs_sq += from.obs_sq;
        if let (Some(dst), Some(src)) = (into.obs_outer.as_mut(), from.obs_outer) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
    }

    fn m_step(&mut self, stats: &GaussianStats, selection: &ParamSelection) -> HmmResult<()> {
        let mut means = self.require_means()?.clone();
        if selection.contains('m') {
            for j in 0..self.n_states {
                if stats.post[j] <= MIN_POSTERIOR_WEIGHT {
                    continue;
                }
                let denom = self.means_weight + stats.post[j];
                for d in 0..self.n_features {
                    means[(j, d)] =
                        (self.means_weight * self.means_prior + stats.obs[(j, d)]) / denom;
                }
            }
            self.means = Some(means.clone());
        }
        if selection.contains('c') {
            let covars = self.reestimate_covariances(stats, &means)?;
            covars.validate(self.n_states, self.n_features)?;
            self.covars = Some(covars);
        }
        Ok(())
    }

    fn sample_state(&self, state: usize, rng: &mut HmmRng) -> HmmResult<DVector<f64>> {
        let means = self.require_means()?;
        let covars = self.require_covars()?;
        let mean = self.state_mean(means, state);
        let z = rng.standard_normal_vector(self.n_features);
        Ok(match covars {
            StateCovariances::Spherical(vars) => &mean + z * vars[state].sqrt(),
            StateCovariances::Diag(vars) => {
                DVector::from_fn(self.n_features, |d, _| {
                    mean[d] + vars[(state, d)].sqrt() * z[d]
                })
            }
            StateCovariances::Full(mats) => {
                let factor = GaussianFactor::try_new(&mats[state], self.min_covar, state)?;
                factor.correlate(&mean, &z)
            }
            StateCovariances::Tied(cov) => {
                let factor = GaussianFactor::try_new(cov, self.min_covar, state)?;
                factor.correlate(&mean, &z)
            }
        })
    }

    fn free_parameters(&self, selection: &ParamSelection) -> usize {
        let mut count = 0;
        if selection.contains('m') {
            count += self.n_states * self.n_features;
        }
        if selection.contains('c') {
            count += match self.kind {
                CovarianceKind::Spherical => self.n_states,
                CovarianceKind::Diag => self.n_states * self.n_features,
                CovarianceKind::Full => {
                    self.n_states * self.n_features * (self.n_features + 1) / 2
                }
                CovarianceKind::Tied => self.n_features * (self.n_features + 1) / 2,
            };
        }
        count
    }
}

impl Gaussian {
    /// Conjugate-MAP covariance re-estimation; see DESIGN notes for the
    /// pseudocount convention. Zero-valued priors give the MLE.
    fn reestimate_covariances(
        &self,
        stats: &GaussianStats,
        means: &DMatrix<f64>,
    ) -> HmmResult<StateCovariances> {
        let dim = self.n_features;
        // Per-state, per-dimension second central moment with the MAP terms.
        let diag_estimate = |j: usize| -> DVector<f64> {
            DVector::from_fn(dim, |d, _| {
                let mean = means[(j, d)];
                let mean_diff = mean - self.means_prior;
                let num = self.covars_prior
                    + self.means_weight * mean_diff * mean_diff
                    + stats.obs_sq[(j, d)]
                    - 2.0 * mean * stats.obs[(j, d)]
                    + stats.post[j] * mean * mean;
                let den = (self.covars_weight - 1.0).max(0.0) + stats.post[j];
                (num / den).max(self.min_covar)
            })
        };
        match self.kind {
            CovarianceKind::Diag => {
                let mut vars = match self.require_covars()? {
                    StateCovariances::Diag(existing) => existing.clone(),
                    _ => DMatrix::from_element(self.n_states, dim, self.min_covar),
                };
                for j in 0..self.n_states {
                    if stats.post[j] <= MIN_POSTERIOR_WEIGHT {
                        continue;
                    }
                    let estimate = diag_estimate(j);
                    for d in 0..dim {
                        vars[(j, d)] = estimate[d];
                    }
                }
                Ok(StateCovariances::Diag(vars))
            }
            CovarianceKind::Spherical => {
                let mut vars = match self.require_covars()? {
                    StateCovariances::Spherical(existing) => existing.clone(),
                    _ => DVector::from_element(self.n_states, self.min_covar),
                };
                for j in 0..self.n_states {
                    if stats.post[j] <= MIN_POSTERIOR_WEIGHT {
                        continue;
                    }
                    vars[j] = diag_estimate(j).sum() / dim as f64;
                }
                Ok(StateCovariances::Spherical(vars))
            }
            CovarianceKind::Full | CovarianceKind::Tied => {
                let outer = stats.obs_outer.as_ref().ok_or(HmmError::ShapeMismatch {
                    what: "sufficient statistics",
                    expected: "outer-product moments for full/tied covariances".to_string(),
                    actual: "elementwise moments only".to_string(),
                })?;
                let cv_num = |j: usize| -> DMatrix<f64> {
                    let mean = means.row(j).transpose();
                    let obs_j = stats.obs.row(j).transpose();
                    let mean_diff = mean.map(|m| m - self.means_prior);
                    let mut num = &outer[j]
                        - &obs_j * mean.transpose()
                        - &mean * obs_j.transpose()
                        + stats.post[j] * &mean * mean.transpose();
                    num += self.means_weight * &mean_diff * mean_diff.transpose();
                    for d in 0..dim {
                        num[(d, d)] += self.covars_prior;
                    }
                    num
                };
                let cv_weight = (self.covars_weight - dim as f64).max(0.0);
                if self.kind == CovarianceKind::Full {
                    let mut mats = match self.require_covars()? {
                        StateCovariances::Full(existing) => existing.clone(),
                        _ => vec![DMatrix::identity(dim, dim) * self.min_covar; self.n_states],
                    };
                    for j in 0..self.n_states {
                        if stats.post[j] <= MIN_POSTERIOR_WEIGHT {
                            continue;
                        }
                        let cov = cv_num(j) / (cv_weight + stats.post[j]);
                        mats[j] = self.floor_full(cov, j)?;
                    }
                    Ok(StateCovariances::Full(mats))
                } else {
                    let total_post = stats.post.sum();
                    if total_post <= MIN_POSTERIOR_WEIGHT {
                        return Ok(self.require_covars()?.clone());
                    }
                    let mut sum = DMatrix::zeros(dim, dim);
                    for j in 0..self.n_states {
                        sum += cv_num(j);
                    }
                    let cov = sum / (cv_weight + total_post);
                    Ok(StateCovariances::Tied(self.floor_full(cov, 0)?))
                }
            }
        }
    }
}

/// Picks `n_states` observation rows (distinct when possible) as initial
/// state means.
fn pick_rows_as_means(
    observations: &[DVector<f64>],
    n_states: usize,
    n_features: usize,
    rng: &mut HmmRng,
) -> DMatrix<f64> {
    let mut chosen: Vec<usize> = Vec::with_capacity(n_states);
    let mut attempts = 0;
    while chosen.len() < n_states {
        let idx = rng.below(observations.len());
        attempts += 1;
        if !chosen.contains(&idx) || attempts > 64 * n_states {
            chosen.push(idx);
        }
    }
    DMatrix::from_fn(n_states, n_features, |j, d| observations[chosen[j]][d])
}

/// Covariance of the whole observation buffer with a diagonal floor; falls
/// back to the identity for degenerate inputs. Shared with the mixture
/// family's initialisation.
pub(crate) fn pooled_covariance(
    observations: &[DVector<f64>],
    n_features: usize,
    min_covar: f64,
) -> DMatrix<f64> {
    if observations.len() < 2 {
        return DMatrix::identity(n_features, n_features);
    }
    let count = observations.len() as f64;
    let mut mean = DVector::zeros(n_features);
    for x in observations {
        mean += x;
    }
    mean /= count;
    let mut cov = DMatrix::zeros(n_features, n_features);
    for x in observations {
        let diff = x - &mean;
        cov += &diff * diff.transpose();
    }
    cov /= count - 1.0;
    for d in 0..n_features {
        cov[(d, d)] += min_covar;
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn diag_family() -> Gaussian {
        Gaussian::new(2, 1, CovarianceKind::Diag)
            .unwrap()
            .with_means(DMatrix::from_row_slice(2, 1, &[0.0, 3.0]))
            .unwrap()
            .with_covariances(StateCovariances::Diag(DMatrix::from_row_slice(
                2,
                1,
                &[1.0, 1.0],
            )))
            .unwrap()
    }

    fn rows(values: &[f64]) -> Vec<DVector<f64>> {
        values.iter().map(|&v| DVector::from_row_slice(&[v])).collect()
    }

    #[test]
    fn diag_log_density_matches_closed_form() {
        let frame = diag_family().frame_log_prob(&rows(&[0.1])).unwrap();
        let expected = -0.5 * (LN_TWO_PI + 0.01);
        assert_approx_eq!(frame[(0, 0)], expected, 1e-12);
    }

    #[test]
    fn full_and_diag_agree_on_diagonal_covariance() {
        let diag = Gaussian::new(1, 2, CovarianceKind::Diag)
            .unwrap()
            .with_means(DMatrix::from_row_slice(1, 2, &[1.0, -1.0]))
            .unwrap()
            .with_covariances(StateCovariances::Diag(DMatrix::from_row_slice(
                1,
                2,
                &[2.0, 0.5],
            )))
            .unwrap();
        let full = Gaussian::new(1, 2, CovarianceKind::Full)
            .unwrap()
            .with_means(DMatrix::from_row_slice(1, 2, &[1.0, -1.0]))
            .unwrap()
            .with_covariances(StateCovariances::Full(vec![DMatrix::from_row_slice(
                2,
                2,
                &[2.0, 0.0, 0.0, 0.5],
            )]))
            .unwrap();
        let x = vec![DVector::from_row_slice(&[0.3, 0.4])];
        let a = diag.frame_log_prob(&x).unwrap();
        let b = full.frame_log_prob(&x).unwrap();
        assert_approx_eq!(a[(0, 0)], b[(0, 0)], 1e-10);
    }

    #[test]
    fn m_step_recovers_weighted_moments() {
        let fam = diag_family();
        let data = rows(&[0.0, 2.0, 10.0]);
        let mut stats = fam.empty_stats();
        // First two rows belong to state 0, the last to state 1.
        let posteriors =
            DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        fam.accumulate(&mut stats, &data, &posteriors).unwrap();
        let mut fam = fam;
        fam.m_step(&stats, &ParamSelection::from_letters(&['m', 'c']))
            .unwrap();
        let means = fam.means().unwrap();
        assert_approx_eq!(means[(0, 0)], 1.0, 1e-12);
        assert_approx_eq!(means[(1, 0)], 10.0, 1e-12);
        match fam.covariances().unwrap() {
            StateCovariances::Diag(vars) => {
                // Variance of {0, 2} about the mean 1 is 1.
                assert_approx_eq!(vars[(0, 0)], 1.0, 1e-12);
                // Single sample collapses to the floor.
                assert_approx_eq!(vars[(1, 0)], 1e-3, 1e-12);
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn unsupported_state_keeps_previous_parameters() {
        let fam = diag_family();
        let data = rows(&[0.5]);
        let mut stats = fam.empty_stats();
        let posteriors = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        fam.accumulate(&mut stats, &data, &posteriors).unwrap();
        let mut fam = fam;
        fam.m_step(&stats, &ParamSelection::from_letters(&['m', 'c']))
            .unwrap();
        // State 1 saw no posterior mass and keeps its mean.
        assert_approx_eq!(fam.means().unwrap()[(1, 0)], 3.0, 1e-12);
    }

    #[test]
    fn tied_covariance_pools_across_states() {
        let fam = Gaussian::new(2, 1, CovarianceKind::Tied)
            .unwrap()
            .with_means(DMatrix::from_row_slice(2, 1, &[0.0, 4.0]))
            .unwrap()
            .with_covariances(StateCovariances::Tied(DMatrix::from_row_slice(1, 1, &[1.0])))
            .unwrap();
        let data = rows(&[-1.0, 1.0, 3.0, 5.0]);
        let mut stats = fam.empty_stats();
        let posteriors = DMatrix::from_row_slice(
            4,
            2,
            &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
        );
        fam.accumulate(&mut stats, &data, &posteriors).unwrap();
        let mut fam = fam;
        fam.m_step(&stats, &ParamSelection::from_letters(&['c']))
            .unwrap();
        match fam.covariances().unwrap() {
            StateCovariances::Tied(cov) => {
                // Both states contribute unit squared deviation per sample.
                assert_approx_eq!(cov[(0, 0)], 1.0, 1e-12);
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn initialization_derives_parameters_from_data() {
        let mut fam = Gaussian::new(2, 1, CovarianceKind::Diag).unwrap();
        let data = rows(&[0.0, 0.1, 3.0, 3.1]);
        let mut rng = HmmRng::with_seed(9);
        fam.initialize(&data, &ParamSelection::from_letters(&['m', 'c']), &mut rng)
            .unwrap();
        assert!(fam.validate().is_ok());
        match fam.covariances().unwrap() {
            StateCovariances::Diag(vars) => assert!(vars[(0, 0)] > 0.0),
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn sampling_uses_state_location() {
        let fam = diag_family();
        let mut rng = HmmRng::with_seed(17);
        let mut total = 0.0;
        let draws = 256;
        for _ in 0..draws {
            total += fam.sample_state(1, &mut rng).unwrap()[0];
        }
        let empirical_mean = total / draws as f64;
        assert!((empirical_mean - 3.0).abs() < 0.25);
    }

    #[test]
    fn free_parameters_per_covariance_kind() {
        let sel = ParamSelection::from_letters(&['m', 'c']);
        let make = |kind| Gaussian::new(3, 2, kind).unwrap().free_parameters(&sel);
        assert_eq!(make(CovarianceKind::Spherical), 6 + 3);
        assert_eq!(make(CovarianceKind::Diag), 6 + 6);
        assert_eq!(make(CovarianceKind::Full), 6 + 9);
        assert_eq!(make(CovarianceKind::Tied), 6 + 3);
    }
}
