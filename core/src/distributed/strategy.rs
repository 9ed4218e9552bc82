//! The mirrored strategy: how many replicas, and how a global batch is split
//! among them.

use super::cpu_backend::CpuBackend;
use crate::error::{Result, TrainError};
use crate::tensor::TensorElem;
use std::time::Duration;

/// Synchronous data parallelism over `num_replicas` in-process replicas.
///
/// Built explicitly with [`MirroredStrategy::builder`] and handed to whatever
/// needs it; there is no ambient "current strategy".
///
/// ```
/// use mirrored_rs::distributed::MirroredStrategy;
///
/// let strategy = MirroredStrategy::builder().num_replicas(2).build().unwrap();
/// let batch = [1, 2, 3, 4, 5];
/// let shards = strategy.split_batch(&batch);
/// assert_eq!(shards, vec![&[1, 2, 3][..], &[4, 5][..]]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredStrategy {
    num_replicas: usize,
    collective_timeout: Option<Duration>,
}

impl MirroredStrategy {
    pub fn builder() -> MirroredStrategyBuilder {
        MirroredStrategyBuilder::default()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Global batch size for a given per-replica batch size.
    pub fn global_batch_size(&self, per_replica: usize) -> usize {
        per_replica * self.num_replicas
    }

    /// Partitions `batch` into `num_replicas` contiguous slices.
    ///
    /// Slices cover the batch in order with no overlap; sizes differ by at
    /// most one, the first `len % num_replicas` slices taking the extra item.
    /// Slices are empty when the batch is smaller than the replica count.
    pub fn split_batch<'a, E>(&self, batch: &'a [E]) -> Vec<&'a [E]> {
        let base = batch.len() / self.num_replicas;
        let extra = batch.len() % self.num_replicas;

        let mut shards = Vec::with_capacity(self.num_replicas);
        let mut start = 0;
        for replica in 0..self.num_replicas {
            let len = base + usize::from(replica < extra);
            shards.push(&batch[start..start + len]);
            start += len;
        }
        shards
    }

    /// One connected collective endpoint per replica.
    pub fn backends<T: TensorElem>(&self) -> Result<Vec<CpuBackend<T>>> {
        let ring = CpuBackend::ring(self.num_replicas)?;
        Ok(match self.collective_timeout {
            Some(timeout) => ring.into_iter().map(|b| b.with_timeout(timeout)).collect(),
            None => ring,
        })
    }
}

/// Builder for [`MirroredStrategy`].
#[derive(Debug, Clone, Default)]
pub struct MirroredStrategyBuilder {
    num_replicas: Option<usize>,
    collective_timeout: Option<Duration>,
}

impl MirroredStrategyBuilder {
    #[must_use]
    pub fn num_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = Some(num_replicas);
        self
    }

    #[must_use]
    pub fn collective_timeout(mut self, timeout: Duration) -> Self {
        self.collective_timeout = Some(timeout);
        self
    }

    /// Defaults to one replica.
    pub fn build(self) -> Result<MirroredStrategy> {
        let num_replicas = self.num_replicas.unwrap_or(1);
        if num_replicas == 0 {
            return Err(TrainError::invalid_config("num_replicas must be positive"));
        }
        Ok(MirroredStrategy {
            num_replicas,
            collective_timeout: self.collective_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(n: usize) -> MirroredStrategy {
        MirroredStrategy::builder().num_replicas(n).build().unwrap()
    }

    #[test]
    fn test_zero_replicas_rejected() {
        assert!(matches!(
            MirroredStrategy::builder().num_replicas(0).build(),
            Err(TrainError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_even_split() {
        let batch: Vec<i32> = (0..8).collect();
        let shards = strategy(4).split_batch(&batch);
        assert_eq!(shards, vec![&[0, 1][..], &[2, 3][..], &[4, 5][..], &[6, 7][..]]);
    }

    #[test]
    fn test_split_is_a_partition() {
        for replicas in 1..6 {
            for len in 0..20 {
                let batch: Vec<usize> = (0..len).collect();
                let shards = strategy(replicas).split_batch(&batch);

                assert_eq!(shards.len(), replicas);
                let joined: Vec<usize> = shards.iter().flat_map(|s| s.iter().copied()).collect();
                assert_eq!(joined, batch);

                let sizes: Vec<usize> = shards.iter().map(|s| s.len()).collect();
                let max = *sizes.iter().max().unwrap();
                let min = *sizes.iter().min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn test_smaller_batch_than_replicas() {
        let shards = strategy(3).split_batch(&[9]);
        assert_eq!(shards, vec![&[9][..], &[][..], &[][..]]);
    }

    #[test]
    fn test_global_batch_size_and_defaults() {
        let s = MirroredStrategy::builder().build().unwrap();
        assert_eq!(s.num_replicas(), 1);
        assert_eq!(strategy(4).global_batch_size(8), 32);
    }

    #[test]
    fn test_backends_match_replicas() {
        let backends = strategy(3).backends::<f32>().unwrap();
        assert_eq!(backends.len(), 3);
    }
}
