//! Seeded random stream for initialisation and sampling.
//!
//! Wraps a ChaCha20 generator so every draw the crate makes flows through one
//! reproducible stream. There is no process-global state: the stream is owned
//! by the model and can be seeded or injected by the caller.

use nalgebra::DVector;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Poisson, StandardNormal};

/// Reproducible random stream used for parameter initialisation and
/// observation sampling.
#[derive(Debug, Clone)]
pub struct HmmRng {
    rng: ChaCha20Rng,
}

impl HmmRng {
    /// Creates a stream seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    /// Creates a reproducible stream from a 64-bit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// Forks a stream from a caller-supplied generator.
    pub fn from_source<R: RngCore>(source: &mut R) -> Self {
        let mut seed = [0u8; 32];
        source.fill_bytes(&mut seed);
        Self {
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    /// Uniform draw in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen()
    }

    /// Uniform index in [0, n).
    pub fn below(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }

    /// Standard normal draw.
    pub fn standard_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    /// Vector of independent standard normal draws.
    pub fn standard_normal_vector(&mut self, dim: usize) -> DVector<f64> {
        DVector::from_fn(dim, |_, _| self.standard_normal())
    }

    /// Poisson draw with the given rate.
    ///
    /// A non-positive or non-finite rate yields zero, matching the
    /// degenerate limit of the distribution.
    pub fn poisson(&mut self, lambda: f64) -> f64 {
        match Poisson::new(lambda) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0.0,
        }
    }

    /// Draws an index from a normalised weight vector by inverting the CDF.
    ///
    /// Rounding remainders fall on the final index so the draw is always
    /// in range.
    pub fn categorical<I>(&mut self, weights: I) -> usize
    where
        I: IntoIterator<Item = f64>,
    {
        let target = self.uniform();
        let mut cumulative = 0.0;
        let mut last = 0;
        for (index, w) in weights.into_iter().enumerate() {
            cumulative += w;
            last = index;
            if target < cumulative {
                return index;
            }
        }
        last
    }

    /// Random point in the interior of the probability simplex.
    pub fn simplex_vector(&mut self, dim: usize) -> DVector<f64> {
        let mut v = DVector::from_fn(dim, |_, _| self.uniform() + f64::EPSILON);
        let total: f64 = v.iter().sum();
        v /= total;
        v
    }
}
