//! Gradient aggregation across replicas.
//!
//! One training step issues exactly two collectives, in this order, on every
//! replica:
//!
//! 1. A small *step report* all-reduce carrying failure flags, a layout
//!    fingerprint and the step's loss/accuracy counters. Every replica takes
//!    part even when its local step failed, so peers never block waiting for
//!    it and everyone reaches the same abort/continue decision.
//! 2. Only if the report is clean, the flattened gradient bucket is
//!    all-reduced.

use super::backend::{CollectiveBackend, ReduceOp};
use crate::error::{Result, TrainError};
use crate::tensor::{Tensor, TensorElem, TensorError};

/// Gradients flattened into one contiguous buffer for a single collective.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientBucket<T> {
    data: Vec<T>,
    shapes: Vec<[usize; 2]>,
}

impl<T: TensorElem> GradientBucket<T> {
    pub fn from_tensors(tensors: &[Tensor<T, 2>]) -> Self {
        let mut data = Vec::with_capacity(tensors.iter().map(Tensor::size).sum());
        let mut shapes = Vec::with_capacity(tensors.len());
        for t in tensors {
            data.extend_from_slice(t.data());
            shapes.push(*t.shape());
        }
        Self { data, shapes }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn shapes(&self) -> &[[usize; 2]] {
        &self.shapes
    }

    pub fn is_finite(&self) -> bool {
        self.data
            .iter()
            .all(|x| x.to_f64().is_some_and(f64::is_finite))
    }

    /// Splits the buffer back into tensors with the original shapes.
    pub fn into_tensors(self) -> Result<Vec<Tensor<T, 2>>> {
        let expected: usize = self.shapes.iter().map(|[r, c]| r * c).sum();
        if expected != self.data.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![expected],
                got: vec![self.data.len()],
            }
            .into());
        }

        let mut rest = self.data.as_slice();
        let mut out = Vec::with_capacity(self.shapes.len());
        for shape in self.shapes {
            let (head, tail) = rest.split_at(shape[0] * shape[1]);
            out.push(Tensor::new(head.to_vec(), shape)?);
            rest = tail;
        }
        Ok(out)
    }
}

/// What one replica contributes to the step report.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalReport<T> {
    pub failed: bool,
    pub non_finite: bool,
    /// Layout fingerprint of the replica's parameters.
    pub fingerprint: u64,
    /// The replica's already-scaled partial loss.
    pub loss: T,
    pub correct: Option<usize>,
    pub examples: usize,
}

/// The step report after reduction. Identical on every replica.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalReport<T> {
    pub failed: usize,
    pub non_finite: usize,
    /// `true` when every replica reported the same fingerprint.
    pub consistent: bool,
    /// Sum of the partial losses.
    pub loss: T,
    /// `None` when no replica could score accuracy.
    pub correct: Option<usize>,
    pub examples: usize,
}

impl<T> GlobalReport<T> {
    pub fn is_healthy(&self) -> bool {
        self.failed == 0 && self.non_finite == 0 && self.consistent
    }
}

// Fingerprint residues are kept small so their squares summed over many
// replicas stay exact even in f32.
const RESIDUE_A: u64 = 251;
const RESIDUE_B: u64 = 241;
const REPORT_LEN: usize = 10;

fn residues(fingerprint: u64) -> [f64; 2] {
    [
        (fingerprint % RESIDUE_A + 1) as f64,
        ((fingerprint >> 32) % RESIDUE_B + 1) as f64,
    ]
}

fn cast<T: TensorElem>(v: f64) -> Result<T> {
    T::from_f64(v).ok_or_else(|| TrainError::collective(format!("{v} not representable")))
}

fn count<T: TensorElem>(v: T) -> usize {
    v.to_f64().map_or(0, |f| f.round().max(0.0) as usize)
}

/// Combines per-replica gradients into one aggregated gradient per parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientAggregator {
    op: ReduceOp,
}

impl Default for GradientAggregator {
    fn default() -> Self {
        Self::new(ReduceOp::Sum)
    }
}

impl GradientAggregator {
    pub const fn new(op: ReduceOp) -> Self {
        Self { op }
    }

    pub const fn op(&self) -> ReduceOp {
        self.op
    }

    /// All-reduces the step report. Every replica must call this once per step.
    pub fn exchange_report<T, B>(&self, backend: &B, local: &LocalReport<T>) -> Result<GlobalReport<T>>
    where
        T: TensorElem,
        B: CollectiveBackend<T> + ?Sized,
    {
        let [a, b] = residues(local.fingerprint);
        let flag = |on: bool| if on { 1.0 } else { 0.0 };
        let mut header: [T; REPORT_LEN] = [
            cast(flag(local.failed))?,
            cast(flag(local.non_finite))?,
            cast(a)?,
            cast(a * a)?,
            cast(b)?,
            cast(b * b)?,
            if local.failed || local.non_finite {
                T::zero()
            } else {
                local.loss
            },
            cast(local.correct.unwrap_or(0) as f64)?,
            cast(flag(local.correct.is_some()))?,
            cast(local.examples as f64)?,
        ];
        backend.all_reduce_sum(&mut header)?;

        let world = backend.world_size() as f64;
        // All residues equal iff R * sum(f^2) == (sum f)^2.
        let agrees = |sum: T, sum_sq: T| match (sum.to_f64(), sum_sq.to_f64()) {
            (Some(s), Some(sq)) => world * sq == s * s,
            _ => false,
        };

        Ok(GlobalReport {
            failed: count(header[0]),
            non_finite: count(header[1]),
            consistent: agrees(header[2], header[3]) && agrees(header[4], header[5]),
            loss: header[6],
            correct: (count(header[8]) > 0).then(|| count(header[7])),
            examples: count(header[9]),
        })
    }

    /// All-reduces `grads` as one bucket with this aggregator's op.
    pub fn reduce<T, B>(&self, backend: &B, grads: &[Tensor<T, 2>]) -> Result<Vec<Tensor<T, 2>>>
    where
        T: TensorElem,
        B: CollectiveBackend<T> + ?Sized,
    {
        let mut bucket = GradientBucket::from_tensors(grads);
        backend.all_reduce(bucket.data_mut(), self.op)?;
        bucket.into_tensors()
    }
}
