//! Convergence tracking for the EM loop.
//!
//! The monitor keeps only the two most recent per-iteration log-probabilities;
//! its decision rule depends on the last delta alone. A decrease beyond √ε is
//! a numerical anomaly (EM guarantees monotone improvement for exact M-steps)
//! and is reported as a warning without aborting training.

use std::collections::VecDeque;

/// Tracks log-probability history and decides when EM should stop.
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    tol: f64,
    n_iter: usize,
    verbose: bool,
    iter: usize,
    history: VecDeque<f64>,
}

impl ConvergenceMonitor {
    /// Creates a monitor that stops after `n_iter` reports or once the
    /// log-probability gain falls below `tol`.
    pub fn new(tol: f64, n_iter: usize, verbose: bool) -> Self {
        Self {
            tol,
            n_iter,
            verbose,
            iter: 0,
            history: VecDeque::with_capacity(2),
        }
    }

    /// Records one iteration's total log-probability.
    pub fn report(&mut self, log_prob: f64) {
        if let Some(&last) = self.history.back() {
            let delta = log_prob - last;
            if self.verbose {
                log::info!(
                    "EM iteration {}: log-prob {log_prob:.6}, delta {delta:.6}",
                    self.iter + 1
                );
            }
            if log_prob < last - f64::EPSILON.sqrt() {
                log::warn!(
                    "log-probability decreased from {last:.10} to {log_prob:.10}; \
                     the model may be degenerate or the priors too strong"
                );
            }
        } else if self.verbose {
            log::info!("EM iteration {}: log-prob {log_prob:.6}", self.iter + 1);
        }
        self.history.push_back(log_prob);
        if self.history.len() > 2 {
            self.history.pop_front();
        }
        self.iter += 1;
    }

    /// True once the iteration budget is spent or the last gain dipped
    /// below the tolerance.
    pub fn converged(&self) -> bool {
        self.iter >= self.n_iter
            || (self.history.len() == 2 && self.history[1] - self.history[0] < self.tol)
    }

    /// True when the tolerance criterion specifically was met, independent
    /// of the iteration budget.
    pub fn converged_by_tolerance(&self) -> bool {
        self.history.len() == 2 && self.history[1] - self.history[0] < self.tol
    }

    /// Gain of the most recent iteration over its predecessor.
    pub fn last_delta(&self) -> Option<f64> {
        if self.history.len() == 2 {
            Some(self.history[1] - self.history[0])
        } else {
            None
        }
    }

    /// Number of iterations reported so far.
    pub fn iterations(&self) -> usize {
        self.iter
    }

    /// The most recent reported log-probability, if any.
    pub fn last_log_prob(&self) -> Option<f64> {
        self.history.back().copied()
    }

    /// Clears the history before a fresh `fit`.
    pub fn reset(&mut self) {
        self.iter = 0;
        self.history.clear();
    }
}
