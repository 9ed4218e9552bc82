use super::loader::next_batch_range;
use super::{Collate, Dataset, Sampler};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// Where a [`BatchStream`] is in the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Pass over the dataset currently being read.
    pub epoch: u64,
    /// Index into this pass's sampled order of the next unread item.
    pub offset: usize,
    /// Batches handed out since the stream was created.
    pub batches: u64,
}

/// A persistent batch iterator.
///
/// Unlike a fresh [`DataLoader::iter`](super::DataLoader::iter) per call, a
/// stream remembers its cursor: taking ten batches and then ten more yields
/// the same twenty batches as taking twenty at once. With `repeat` the
/// stream rolls into the next epoch (re-sampling the order) when a pass ends.
pub struct BatchStream<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    dataset: Arc<D>,
    sampler: Arc<dyn Sampler>,
    batch_size: usize,
    drop_last: bool,
    repeat: bool,
    indices: Vec<usize>,
    position: StreamPosition,
    _marker: PhantomData<(T, C)>,
}

impl<D, T, C> BatchStream<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    pub(crate) fn new(
        dataset: Arc<D>,
        sampler: Arc<dyn Sampler>,
        batch_size: usize,
        drop_last: bool,
        repeat: bool,
    ) -> Self {
        let indices = sampler.sample(dataset.len(), 0);
        Self {
            dataset,
            sampler,
            batch_size,
            drop_last,
            repeat,
            indices,
            position: StreamPosition::default(),
            _marker: PhantomData,
        }
    }

    pub fn position(&self) -> StreamPosition {
        self.position
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
    }

    /// Batches left before the current pass is exhausted.
    pub fn remaining_in_pass(&self) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        let left = self.indices.len().saturating_sub(self.position.offset);
        if self.drop_last {
            left / self.batch_size
        } else {
            left.div_ceil(self.batch_size)
        }
    }

    /// Moves the cursor to a previously recorded position.
    ///
    /// With a seeded or sequential sampler this reproduces the exact order the
    /// original stream would have continued with.
    pub fn seek(&mut self, position: StreamPosition) {
        if position.epoch != self.position.epoch {
            self.indices = self.sampler.sample(self.dataset.len(), position.epoch);
        }
        self.position = position;
    }

    fn take_batch(&mut self) -> Option<Vec<T>> {
        let range = next_batch_range(
            self.indices.len(),
            self.position.offset,
            self.batch_size,
            self.drop_last,
        )?;
        self.position.offset = range.end;
        self.position.batches += 1;
        Some(
            self.indices[range]
                .iter()
                .map(|&idx| self.dataset.get(idx))
                .collect(),
        )
    }
}

impl<D, T, C> Iterator for BatchStream<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    type Item = C::Output;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(batch) = self.take_batch() {
            return Some(C::collate(batch));
        }
        if !self.repeat {
            return None;
        }

        self.position.epoch += 1;
        self.position.offset = 0;
        self.indices = self.sampler.sample(self.dataset.len(), self.position.epoch);
        // a fresh pass that still yields nothing means the stream is empty
        self.take_batch().map(C::collate)
    }
}
