//! Forward, backward, Viterbi, and posterior computations over the
//! time×state lattice.
//!
//! Two interchangeable implementations are provided: the default log-space
//! recurrences, and the classic scaling recurrences that stay in probability
//! space with a per-step normaliser. Both take the start distribution and
//! transition matrix in probability space together with per-frame emission
//! log-probabilities, and must agree within 1e-8.
//!
//! Degenerate inputs are well-defined: a zero-length lattice yields total
//! log-probability 0 and an empty path, and a model that assigns no mass to
//! the observations yields −∞ which callers surface as `IllConditioned`.

use crate::numerics::constants::MIN_SCALE;
use crate::numerics::{log_or_neg_inf, logsumexp, logsumexp_iter};
use nalgebra::{DMatrix, DVector};

/// Result of one complete forward-backward pass over a subsequence.
#[derive(Debug, Clone)]
pub struct LatticePass {
    /// Total log-probability of the subsequence.
    pub log_prob: f64,
    /// State posteriors γ, one row per frame, rows summing to one.
    pub posteriors: DMatrix<f64>,
    /// Transition posteriors ξ summed over time; zero when T < 2.
    pub xi_sum: DMatrix<f64>,
}

/// Log-space forward recurrence.
///
/// Returns the α lattice and the total log-probability
/// logsumexp_j α[T−1, j]. For T = 0 the lattice is empty and the total is 0.
pub fn forward_log(
    start: &DVector<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
) -> (DMatrix<f64>, f64) {
    let frames = frame_log_prob.nrows();
    let n = start.len();
    let mut fwd = DMatrix::zeros(frames, n);
    if frames == 0 {
        return (fwd, 0.0);
    }
    let log_trans = trans.map(log_or_neg_inf);
    for j in 0..n {
        fwd[(0, j)] = log_or_neg_inf(start[j]) + frame_log_prob[(0, j)];
    }
    let mut work = vec![0.0; n];
    for t in 1..frames {
        for j in 0..n {
            for i in 0..n {
                work[i] = fwd[(t - 1, i)] + log_trans[(i, j)];
            }
            fwd[(t, j)] = logsumexp(&work) + frame_log_prob[(t, j)];
        }
    }
    let total = logsumexp_iter((0..n).map(|j| fwd[(frames - 1, j)]));
    (fwd, total)
}

/// Log-space backward recurrence; β[T−1, ·] = 0.
pub fn backward_log(trans: &DMatrix<f64>, frame_log_prob: &DMatrix<f64>) -> DMatrix<f64> {
    let frames = frame_log_prob.nrows();
    let n = trans.nrows();
    let mut bwd = DMatrix::zeros(frames, n);
    if frames == 0 {
        return bwd;
    }
    let log_trans = trans.map(log_or_neg_inf);
    let mut work = vec![0.0; n];
    for t in (0..frames.saturating_sub(1)).rev() {
        for i in 0..n {
            for j in 0..n {
                work[j] = log_trans[(i, j)] + frame_log_prob[(t + 1, j)] + bwd[(t + 1, j)];
            }
            bwd[(t, i)] = logsumexp(&work);
        }
    }
    bwd
}

/// State posteriors γ[t,j] = exp(α[t,j] + β[t,j] − ℓ), renormalised per row
/// against floating-point drift.
///
/// A degenerate ℓ = −∞ produces an all-zero matrix rather than NaN.
pub fn posteriors_log(fwd: &DMatrix<f64>, bwd: &DMatrix<f64>, log_prob: f64) -> DMatrix<f64> {
    let (frames, n) = fwd.shape();
    let mut posteriors = DMatrix::zeros(frames, n);
    if !log_prob.is_finite() {
        return posteriors;
    }
    for t in 0..frames {
        let mut row_sum = 0.0;
        for j in 0..n {
            let g = (fwd[(t, j)] + bwd[(t, j)] - log_prob).exp();
            posteriors[(t, j)] = g;
            row_sum += g;
        }
        if row_sum > 0.0 {
            for j in 0..n {
                posteriors[(t, j)] /= row_sum;
            }
        }
    }
    posteriors
}

/// Transition posteriors summed over time:
/// ξ[i,j] = exp(logsumexp_t(α[t,i] + log A[i,j] + B[t+1,j] + β[t+1,j]) − ℓ).
///
/// Σᵢⱼ ξ = T − 1; the matrix is zero when T < 2 or ℓ = −∞.
pub fn xi_sum_log(
    fwd: &DMatrix<f64>,
    bwd: &DMatrix<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
    log_prob: f64,
) -> DMatrix<f64> {
    let (frames, n) = fwd.shape();
    let mut xi = DMatrix::zeros(n, n);
    if frames < 2 || !log_prob.is_finite() {
        return xi;
    }
    let log_trans = trans.map(log_or_neg_inf);
    let mut work = vec![0.0; frames - 1];
    for i in 0..n {
        for j in 0..n {
            for (t, slot) in work.iter_mut().enumerate() {
                *slot = fwd[(t, i)]
                    + log_trans[(i, j)]
                    + frame_log_prob[(t + 1, j)]
                    + bwd[(t + 1, j)];
            }
            xi[(i, j)] = (logsumexp(&work) - log_prob).exp();
        }
    }
    xi
}

/// Scaling-mode forward recurrence.
///
/// Each α row is normalised to sum to one; the per-step normalisers are
/// returned as logs and their sum is the total log-probability. A zero
/// normaliser means the model assigns no mass to the frame and the total is
/// −∞.
pub fn forward_scaling(
    start: &DVector<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
) -> (DMatrix<f64>, DVector<f64>, f64) {
    let frames = frame_log_prob.nrows();
    let n = start.len();
    let mut fwd = DMatrix::zeros(frames, n);
    let mut log_scale = DVector::zeros(frames);
    if frames == 0 {
        return (fwd, log_scale, 0.0);
    }
    for j in 0..n {
        fwd[(0, j)] = start[j] * frame_log_prob[(0, j)].exp();
    }
    for t in 0..frames {
        if t > 0 {
            for j in 0..n {
                let mut acc = 0.0;
                for i in 0..n {
                    acc += fwd[(t - 1, i)] * trans[(i, j)];
                }
                fwd[(t, j)] = acc * frame_log_prob[(t, j)].exp();
            }
        }
        let scale: f64 = fwd.row(t).iter().sum();
        if scale < MIN_SCALE {
            return (fwd, log_scale, f64::NEG_INFINITY);
        }
        log_scale[t] = scale.ln();
        for j in 0..n {
            fwd[(t, j)] /= scale;
        }
    }
    let total: f64 = log_scale.iter().sum();
    (fwd, log_scale, total)
}

/// Scaling-mode backward recurrence using the forward normalisers.
pub fn backward_scaling(
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
    log_scale: &DVector<f64>,
) -> DMatrix<f64> {
    let frames = frame_log_prob.nrows();
    let n = trans.nrows();
    let mut bwd = DMatrix::zeros(frames, n);
    if frames == 0 {
        return bwd;
    }
    for j in 0..n {
        bwd[(frames - 1, j)] = 1.0;
    }
    for t in (0..frames - 1).rev() {
        let inv_scale = (-log_scale[t + 1]).exp();
        for i in 0..n {
            let mut acc = 0.0;
            for j in 0..n {
                acc += trans[(i, j)] * frame_log_prob[(t + 1, j)].exp() * bwd[(t + 1, j)];
            }
            bwd[(t, i)] = acc * inv_scale;
        }
    }
    bwd
}

/// Posteriors in scaling mode: γ = ᾱ ⊙ β̂, renormalised per row.
pub fn posteriors_scaling(fwd: &DMatrix<f64>, bwd: &DMatrix<f64>) -> DMatrix<f64> {
    let (frames, n) = fwd.shape();
    let mut posteriors = DMatrix::zeros(frames, n);
    for t in 0..frames {
        let mut row_sum = 0.0;
        for j in 0..n {
            let g = fwd[(t, j)] * bwd[(t, j)];
            posteriors[(t, j)] = g;
            row_sum += g;
        }
        if row_sum > 0.0 {
            for j in 0..n {
                posteriors[(t, j)] /= row_sum;
            }
        }
    }
    posteriors
}

/// Transition posteriors summed over time in scaling mode:
/// ξ[i,j] = Σ_t ᾱ[t,i] A[i,j] b[t+1,j] β̂[t+1,j] / c_{t+1}.
pub fn xi_sum_scaling(
    fwd: &DMatrix<f64>,
    bwd: &DMatrix<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
    log_scale: &DVector<f64>,
) -> DMatrix<f64> {
    let (frames, n) = fwd.shape();
    let mut xi = DMatrix::zeros(n, n);
    if frames < 2 {
        return xi;
    }
    for t in 0..frames - 1 {
        let inv_scale = (-log_scale[t + 1]).exp();
        for i in 0..n {
            for j in 0..n {
                xi[(i, j)] += fwd[(t, i)]
                    * trans[(i, j)]
                    * frame_log_prob[(t + 1, j)].exp()
                    * bwd[(t + 1, j)]
                    * inv_scale;
            }
        }
    }
    xi
}

/// Viterbi decoding: the maximum-probability state path and its joint
/// log-probability. Ties break toward the lowest state index.
pub fn viterbi(
    start: &DVector<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
) -> (f64, Vec<usize>) {
    let frames = frame_log_prob.nrows();
    let n = start.len();
    if frames == 0 {
        return (0.0, Vec::new());
    }
    let log_trans = trans.map(log_or_neg_inf);
    let mut delta = DMatrix::zeros(frames, n);
    let mut back = vec![vec![0usize; n]; frames];
    for j in 0..n {
        delta[(0, j)] = log_or_neg_inf(start[j]) + frame_log_prob[(0, j)];
    }
    for t in 1..frames {
        for j in 0..n {
            let mut best = f64::NEG_INFINITY;
            let mut best_idx = 0;
            for i in 0..n {
                let candidate = delta[(t - 1, i)] + log_trans[(i, j)];
                if candidate > best {
                    best = candidate;
                    best_idx = i;
                }
            }
            delta[(t, j)] = best + frame_log_prob[(t, j)];
            back[t][j] = best_idx;
        }
    }
    let mut best = f64::NEG_INFINITY;
    let mut state = 0;
    for j in 0..n {
        if delta[(frames - 1, j)] > best {
            best = delta[(frames - 1, j)];
            state = j;
        }
    }
    let mut path = vec![0usize; frames];
    path[frames - 1] = state;
    for t in (0..frames - 1).rev() {
        path[t] = back[t + 1][path[t + 1]];
    }
    (best, path)
}

/// Runs forward-backward in log mode and packages the posterior quantities.
pub fn forward_backward_log(
    start: &DVector<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
    want_xi: bool,
) -> LatticePass {
    let (fwd, log_prob) = forward_log(start, trans, frame_log_prob);
    let bwd = backward_log(trans, frame_log_prob);
    let posteriors = posteriors_log(&fwd, &bwd, log_prob);
    let xi_sum = if want_xi {
        xi_sum_log(&fwd, &bwd, trans, frame_log_prob, log_prob)
    } else {
        DMatrix::zeros(start.len(), start.len())
    };
    LatticePass {
        log_prob,
        posteriors,
        xi_sum,
    }
}

/// Runs forward-backward in scaling mode and packages the posterior
/// quantities.
pub fn forward_backward_scaling(
    start: &DVector<f64>,
    trans: &DMatrix<f64>,
    frame_log_prob: &DMatrix<f64>,
    want_xi: bool,
) -> LatticePass {
    let (fwd, log_scale, log_prob) = forward_scaling(start, trans, frame_log_prob);
    if !log_prob.is_finite() {
        let n = start.len();
        return LatticePass {
            log_prob,
            posteriors: DMatrix::zeros(frame_log_prob.nrows(), n),
            xi_sum: DMatrix::zeros(n, n),
        };
    }
    let bwd = backward_scaling(trans, frame_log_prob, &log_scale);
    let posteriors = posteriors_scaling(&fwd, &bwd);
    let xi_sum = if want_xi {
        xi_sum_scaling(&fwd, &bwd, trans, frame_log_prob, &log_scale)
    } else {
        DMatrix::zeros(start.len(), start.len())
    };
    LatticePass {
        log_prob,
        posteriors,
        xi_sum,
    }
}
