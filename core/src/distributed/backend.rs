use crate::error::Result;
use crate::tensor::TensorElem;
use serde::{Deserialize, Serialize};

/// How values from every rank are combined.
///
/// A closed set chosen explicitly by the caller; nothing infers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Elementwise sum.
    Sum,
    /// Elementwise sum divided by the world size.
    Mean,
}

/// Abstraction for a collective communication backend.
///
/// One backend value is one rank's endpoint. Every rank must call the same
/// collectives in the same order with buffers of the same length.
pub trait CollectiveBackend<T: TensorElem>: Send + Sync {
    /// Returns the rank of this endpoint.
    fn rank(&self) -> usize;

    /// Returns the total number of ranks.
    fn world_size(&self) -> usize;

    /// Sums `buffer` across all ranks in place.
    ///
    /// Does not return on any rank until every rank has contributed, and
    /// every rank ends up with bit-identical contents.
    fn all_reduce_sum(&self, buffer: &mut [T]) -> Result<()>;

    /// Reduces `buffer` across all ranks with `op`.
    fn all_reduce(&self, buffer: &mut [T], op: ReduceOp) -> Result<()> {
        self.all_reduce_sum(buffer)?;
        if op == ReduceOp::Mean {
            let n = T::from_usize(self.world_size()).ok_or_else(|| {
                crate::error::TrainError::collective("world size not representable")
            })?;
            for v in buffer.iter_mut() {
                *v /= n;
            }
        }
        Ok(())
    }

    /// Blocks until every rank reaches the barrier.
    fn barrier(&self) -> Result<()> {
        let mut token = [T::zero()];
        self.all_reduce_sum(&mut token)
    }
}
