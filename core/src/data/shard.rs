use super::Dataset;
use crate::distributed::WorkerContext;
use std::marker::PhantomData;

/// The part of a dataset owned by one worker.
///
/// Keeps every item whose index satisfies `index % num_workers == worker_index`.
/// Sharding is by worker, never by replica: replicas inside a worker split
/// each global batch instead.
pub struct ShardedDataset<D, T>
where
    D: Dataset<T>,
{
    inner: D,
    worker: WorkerContext,
    _marker: PhantomData<T>,
}

impl<D, T> ShardedDataset<D, T>
where
    D: Dataset<T>,
{
    pub fn new(inner: D, worker: WorkerContext) -> Self {
        Self {
            inner,
            worker,
            _marker: PhantomData,
        }
    }

    pub fn worker(&self) -> WorkerContext {
        self.worker
    }
}

impl<D, T> Dataset<T> for ShardedDataset<D, T>
where
    D: Dataset<T>,
    T: Send + Sync,
{
    fn len(&self) -> usize {
        let total = self.inner.len();
        let WorkerContext {
            worker_index,
            num_workers,
        } = self.worker;
        if worker_index >= total {
            0
        } else {
            (total - worker_index).div_ceil(num_workers)
        }
    }

    fn get(&self, index: usize) -> T {
        self.inner
            .get(index * self.worker.num_workers + self.worker.worker_index)
    }
}
