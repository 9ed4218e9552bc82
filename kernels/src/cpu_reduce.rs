//! Reductions used by gradient aggregation and loss computation.

use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Elementwise sum of equally sized buffers.
///
/// Buffers are added in slice order for every element, so the result is
/// independent of thread scheduling.
pub fn cpu_sum_buffers<T>(buffers: &[&[T]]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let first = buffers.first().ok_or(KernelError::Empty("no buffers to sum"))?;
    let len = first.len();
    if let Some(bad) = buffers.iter().find(|b| b.len() != len) {
        return Err(KernelError::ShapeMismatch {
            expected: vec![len],
            got: vec![bad.len()],
        });
    }

    let mut out = first.to_vec();
    for buffer in &buffers[1..] {
        cpu_accumulate(&mut out, buffer)?;
    }
    Ok(out)
}

/// `acc[i] += src[i]`.
pub fn cpu_accumulate<T>(acc: &mut [T], src: &[T]) -> Result<()>
where
    T: KernelElem,
{
    if acc.len() != src.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![acc.len()],
            got: vec![src.len()],
        });
    }
    acc.par_iter_mut().zip(src.par_iter()).for_each(|(a, &s)| {
        *a += s;
    });
    Ok(())
}

/// Sums each row of a row-major `[rows, cols]` matrix.
pub fn cpu_row_sums<T>(data: &[T], shape: [usize; 2]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let [rows, cols] = shape;
    if data.len() != rows * cols {
        return Err(KernelError::ShapeMismatch {
            expected: vec![rows * cols],
            got: vec![data.len()],
        });
    }
    if cols == 0 {
        return Ok(vec![T::zero(); rows]);
    }

    Ok(data
        .par_chunks(cols)
        .map(|row| row.iter().fold(T::zero(), |acc, &x| acc + x))
        .collect())
}
