use super::backend::CollectiveBackend;
use crate::error::{Result, TrainError};
use crate::tensor::TensorElem;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::ops::Range;
use std::time::Duration;

/// A CPU collective backend for threads in one process.
///
/// Implements **Ring All-Reduce** over `crossbeam` channels: rank `r`
/// receives from `r - 1` and sends to `r + 1`. A reduction runs in two
/// phases of `world_size - 1` steps each (scatter-reduce, then all-gather),
/// so every rank sends and receives the same number of messages regardless
/// of buffer contents. After the all-gather each chunk on every rank is a
/// copy of the one fully reduced chunk, making results bit-identical
/// across ranks.
#[derive(Debug)]
pub struct CpuBackend<T> {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Vec<T>>, // Receive from rank - 1
    right_tx: Sender<Vec<T>>,  // Send to rank + 1
    timeout: Option<Duration>,
}

impl<T: TensorElem> CpuBackend<T> {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Vec<T>>,
        right_tx: Sender<Vec<T>>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
            timeout: None,
        }
    }

    /// Builds a connected ring of `world_size` endpoints, indexed by rank.
    pub fn ring(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(TrainError::invalid_config("a ring needs at least one rank"));
        }

        // link i carries rank i -> rank i + 1
        let (senders, mut receivers): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| channel::unbounded::<Vec<T>>()).unzip();
        receivers.rotate_right(1);

        Ok(senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (right_tx, left_rx))| Self::new(rank, world_size, left_rx, right_tx))
            .collect())
    }

    /// Fails a receive that waits longer than `timeout` instead of blocking forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn chunk(&self, index: usize, chunk_size: usize, len: usize) -> Range<usize> {
        let start = (index * chunk_size).min(len);
        let end = (start + chunk_size).min(len);
        start..end
    }

    fn ring_index(&self, offset: isize) -> usize {
        (self.rank as isize + offset).rem_euclid(self.world_size as isize) as usize
    }

    fn send(&self, data: Vec<T>) -> Result<()> {
        self.right_tx.send(data).map_err(|_| {
            TrainError::collective(format!("rank {} lost its right neighbour", self.rank))
        })
    }

    fn recv(&self) -> Result<Vec<T>> {
        match self.timeout {
            None => self.left_rx.recv().map_err(|_| {
                TrainError::collective(format!("rank {} lost its left neighbour", self.rank))
            }),
            Some(timeout) => self.left_rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => TrainError::collective(format!(
                    "rank {} timed out after {timeout:?} waiting for its left neighbour",
                    self.rank
                )),
                RecvTimeoutError::Disconnected => TrainError::collective(format!(
                    "rank {} lost its left neighbour",
                    self.rank
                )),
            }),
        }
    }
}

impl<T: TensorElem> CollectiveBackend<T> for CpuBackend<T> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, data: &mut [T]) -> Result<()> {
        let total_elements = data.len();
        let chunk_size = total_elements.div_ceil(self.world_size);
        // A length mismatch must not break lockstep, so it is reported after
        // both phases complete.
        let mut mismatch = None;

        // --- Phase 1: Scatter-Reduce ---
        // rank r sends chunk (r - step) and accumulates chunk (r - step - 1)
        for step in 0..self.world_size - 1 {
            let send_range = self.chunk(self.ring_index(-(step as isize)), chunk_size, total_elements);
            self.send(data[send_range].to_vec())?;

            let recv_range =
                self.chunk(self.ring_index(-(step as isize) - 1), chunk_size, total_elements);
            let recv_data = self.recv()?;
            if recv_data.len() == recv_range.len() {
                for (d, v) in data[recv_range].iter_mut().zip(recv_data) {
                    *d += v;
                }
            } else {
                mismatch.get_or_insert((recv_range.len(), recv_data.len()));
            }
        }

        // --- Phase 2: All-Gather ---
        // rank r now owns the reduced chunk (r + 1); pass reduced chunks around
        for step in 0..self.world_size - 1 {
            let send_range =
                self.chunk(self.ring_index(1 - step as isize), chunk_size, total_elements);
            self.send(data[send_range].to_vec())?;

            let recv_range = self.chunk(self.ring_index(-(step as isize)), chunk_size, total_elements);
            let recv_data = self.recv()?;
            if recv_data.len() == recv_range.len() {
                data[recv_range].copy_from_slice(&recv_data);
            } else {
                mismatch.get_or_insert((recv_range.len(), recv_data.len()));
            }
        }

        match mismatch {
            None => Ok(()),
            Some((expected, got)) => Err(TrainError::collective(format!(
                "rank {} expected a chunk of {expected} elements, received {got}",
                self.rank
            ))),
        }
    }
}
