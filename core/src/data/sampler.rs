//! Strategies for sampling indices from a dataset.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fmt::Debug;

/// A trait for determining the order of data access.
pub trait Sampler: Debug + Send + Sync {
    /// Returns the visiting order for one pass over the data.
    ///
    /// # Arguments
    ///
    /// * `len`: The length of the dataset.
    /// * `epoch`: Zero-based pass counter. Seeded samplers derive their order from it.
    fn sample(&self, len: usize, epoch: u64) -> Vec<usize>;
}

/// Samples elements sequentially, always in the same order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialSampler;

impl Sampler for SequentialSampler {
    fn sample(&self, len: usize, _epoch: u64) -> Vec<usize> {
        (0..len).collect()
    }
}

/// Samples elements randomly (without replacement).
///
/// With a seed the order for a given epoch is reproducible, which is what a
/// resumed run needs. Without one every pass draws from the thread RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSampler {
    pub seed: Option<u64>,
}

impl RandomSampler {
    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

impl Sampler for RandomSampler {
    fn sample(&self, len: usize, epoch: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();
        match self.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch));
                indices.shuffle(&mut rng);
            }
            None => indices.shuffle(&mut rand::rng()),
        }
        indices
    }
}
