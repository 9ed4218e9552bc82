//! CPU kernels for `mirrored-rs`.
//!
//! Kernels operate on flat row-major slices plus explicit shapes so they stay
//! independent of the tensor type. Everything here is deterministic: the same
//! inputs always produce bit-identical outputs, which the mirrored training
//! loop relies on to keep replicas in lockstep.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_matmul;
pub mod cpu_reduce;
pub mod cpu_transpose;

pub use cpu_matmul::cpu_matmul;
pub use cpu_reduce::{cpu_accumulate, cpu_row_sums, cpu_sum_buffers};
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Empty input: {0}")]
    Empty(&'static str),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// Mirrors `TensorElem` in the core crate to avoid a circular dependency.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}
