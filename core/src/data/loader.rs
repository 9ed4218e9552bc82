//! DataLoader implementation.

use super::{BatchStream, Dataset, RandomSampler, Sampler, SequentialSampler};
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

/// Trait for collating a list of items into a batch.
pub trait Collate<T> {
    /// The type of the batched output.
    type Output;

    /// Collates a vector of items into a single batch.
    fn collate(batch: Vec<T>) -> Self::Output;
}

/// A default collator that just returns the `Vec<T>`.
///
/// The mirrored trainer wants the global batch uncollated so it can split it
/// across replicas first.
pub struct DefaultCollate;

impl<T> Collate<T> for DefaultCollate {
    type Output = Vec<T>;

    fn collate(batch: Vec<T>) -> Self::Output {
        batch
    }
}

/// Range of `indices` forming the next batch starting at `cursor`, if any.
pub(crate) fn next_batch_range(
    len: usize,
    cursor: usize,
    batch_size: usize,
    drop_last: bool,
) -> Option<Range<usize>> {
    if batch_size == 0 || cursor >= len {
        return None;
    }
    let remaining = len - cursor;
    if drop_last && remaining < batch_size {
        return None;
    }
    Some(cursor..cursor + remaining.min(batch_size))
}

/// Data loader.
///
/// Combines a dataset and a sampler, and provides an iterable over the given dataset.
///
/// # Type Parameters
///
/// * `D`: The dataset type.
/// * `T`: The item type returned by the dataset.
/// * `C`: The collator type (defaults to `DefaultCollate`).
pub struct DataLoader<D, T, C = DefaultCollate>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    dataset: Arc<D>,
    batch_size: usize,
    sampler: Arc<dyn Sampler>,
    drop_last: bool,
    _marker: PhantomData<(T, C)>,
}

impl<D, T> DataLoader<D, T, DefaultCollate>
where
    D: Dataset<T> + 'static,
{
    /// Creates a new DataLoader with default collation.
    pub fn new(dataset: D, batch_size: usize) -> Self {
        Self {
            dataset: Arc::new(dataset),
            batch_size,
            sampler: Arc::new(SequentialSampler),
            drop_last: false,
            _marker: PhantomData,
        }
    }
}

impl<D, T, C> DataLoader<D, T, C>
where
    D: Dataset<T> + 'static,
    C: Collate<T>,
{
    /// Sets the sampler to use.
    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    /// Sets whether to shuffle the data (uses an unseeded `RandomSampler`).
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        if shuffle {
            self.sampler = Arc::new(RandomSampler::default());
        } else {
            self.sampler = Arc::new(SequentialSampler);
        }
        self
    }

    /// Shuffles with a reproducible per-epoch order.
    pub fn shuffle_seeded(mut self, seed: u64) -> Self {
        self.sampler = Arc::new(RandomSampler::seeded(seed));
        self
    }

    /// Sets whether to drop the last incomplete batch.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Number of batches in one pass.
    pub fn num_batches(&self) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        let len = self.dataset.len();
        if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    /// Returns an iterator over the first pass.
    pub fn iter(&self) -> DataLoaderIter<D, T, C> {
        self.iter_epoch(0)
    }

    /// Returns an iterator over pass number `epoch`.
    pub fn iter_epoch(&self, epoch: u64) -> DataLoaderIter<D, T, C> {
        let indices = self.sampler.sample(self.dataset.len(), epoch);
        DataLoaderIter {
            dataset: self.dataset.clone(),
            indices,
            batch_size: self.batch_size,
            current_idx: 0,
            drop_last: self.drop_last,
            _marker: PhantomData,
        }
    }

    /// A persistent cursor over this loader. With `repeat` it rolls into the
    /// next epoch instead of ending.
    pub fn stream(&self, repeat: bool) -> BatchStream<D, T, C> {
        BatchStream::new(
            self.dataset.clone(),
            self.sampler.clone(),
            self.batch_size,
            self.drop_last,
            repeat,
        )
    }
}

impl<D, T, C> IntoIterator for DataLoader<D, T, C>
where
    D: Dataset<T> + 'static,
    C: Collate<T>,
{
    type Item = C::Output;
    type IntoIter = DataLoaderIter<D, T, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator for DataLoader.
pub struct DataLoaderIter<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    dataset: Arc<D>,
    indices: Vec<usize>,
    batch_size: usize,
    current_idx: usize,
    drop_last: bool,
    _marker: PhantomData<(T, C)>,
}

impl<D, T, C> Iterator for DataLoaderIter<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    type Item = C::Output;

    fn next(&mut self) -> Option<Self::Item> {
        let range = next_batch_range(
            self.indices.len(),
            self.current_idx,
            self.batch_size,
            self.drop_last,
        )?;
        self.current_idx = range.end;

        let batch: Vec<T> = self.indices[range]
            .iter()
            .map(|&idx| self.dataset.get(idx))
            .collect();

        Some(C::collate(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataloader_sequential() {
        let data = vec![1, 2, 3, 4, 5];
        let loader = DataLoader::new(data, 2);

        let mut iter = loader.iter();
        assert_eq!(iter.next(), Some(vec![1, 2]));
        assert_eq!(iter.next(), Some(vec![3, 4]));
        assert_eq!(iter.next(), Some(vec![5]));
        assert_eq!(iter.next(), None);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn test_dataloader_drop_last() {
        let data = vec![1, 2, 3, 4, 5];
        let loader = DataLoader::new(data, 2).drop_last(true);

        let mut iter = loader.iter();
        assert_eq!(iter.next(), Some(vec![1, 2]));
        assert_eq!(iter.next(), Some(vec![3, 4]));
        assert_eq!(iter.next(), None);
        assert_eq!(loader.num_batches(), 2);
    }

    #[test]
    fn test_dataloader_shuffle() {
        let data: Vec<i32> = (0..20).collect();
        let loader = DataLoader::new(data.clone(), 20).shuffle_seeded(3);

        let batch = loader.iter().next().unwrap();
        assert_eq!(batch.len(), 20);
        assert_ne!(batch, data);
        assert_eq!(loader.iter_epoch(0).next().unwrap(), batch);

        // Check content is same
        let mut sorted_batch = batch.clone();
        sorted_batch.sort();
        assert_eq!(sorted_batch, data);
    }

    #[test]
    fn test_zero_batch_size_yields_nothing() {
        let loader = DataLoader::new(vec![1, 2, 3], 0);
        assert_eq!(loader.iter().next(), None);
        assert_eq!(loader.num_batches(), 0);
    }
}
