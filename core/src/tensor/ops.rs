//! Tensor operations.
//!
//! Element-wise arithmetic requires identical shapes; the only broadcasts are
//! the explicit row/column helpers on rank-2 tensors that the autograd layer
//! needs for bias addition and per-example reductions. Work is parallelized
//! with `rayon`, but every reduction accumulates in a fixed order so that two
//! replicas fed the same inputs produce bit-identical outputs.
//!
//! ```rust
//! use mirrored_rs::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait (e.g. `Add`) for `&Tensor`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .par_iter_mut()
                    .zip(self.data.par_iter())
                    .zip(rhs.data.par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies `f` element-wise, producing a tensor of the same shape.
    ///
    /// ```rust
    /// use mirrored_rs::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// assert_eq!(t.map(|x| x * x).data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// In-place `self += other`.
    pub fn add_assign(&mut self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        mirrored_kernels::cpu_accumulate(&mut self.data, &other.data)?;
        Ok(())
    }

    /// Sums every element, left to right.
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// Returns `true` if no element is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.data
            .iter()
            .all(|x| x.to_f64().is_some_and(f64::is_finite))
    }
}

impl<T> Tensor<T, 2>
where
    T: TensorElem,
{
    /// Number of rows (the batch dimension for activations).
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Number of columns (the feature dimension for activations).
    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    /// Builds a `[rows.len(), width]` tensor from equally sized rows.
    pub fn from_rows(rows: &[&[T]], width: usize) -> Result<Self> {
        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![width],
                    got: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Tensor::new(data, [rows.len(), width])
    }

    /// Matrix multiplication `[m, k] x [k, n] -> [m, n]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let out = mirrored_kernels::cpu_matmul(&self.data, &rhs.data, self.shape, rhs.shape)?;
        Tensor::new(out, [self.shape[0], rhs.shape[1]])
    }

    /// Transpose `[m, n] -> [n, m]`.
    pub fn transpose(&self) -> Result<Self> {
        let out = mirrored_kernels::cpu_transpose(&self.data, self.shape)?;
        Tensor::new(out, [self.shape[1], self.shape[0]])
    }

    /// Adds a `[1, n]` row to every row of a `[m, n]` tensor.
    pub fn add_row(&self, row: &Self) -> Result<Self> {
        if row.shape != [1, self.shape[1]] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![1, self.shape[1]],
                got: row.shape.to_vec(),
            });
        }

        let mut out = self.clone();
        let cols = self.shape[1];
        if cols > 0 {
            out.data.par_chunks_mut(cols).for_each(|out_row| {
                for (o, &r) in out_row.iter_mut().zip(row.data.iter()) {
                    *o += r;
                }
            });
        }
        Ok(out)
    }

    /// Sums each row: `[m, n] -> [m, 1]`.
    pub fn sum_rows(&self) -> Result<Self> {
        let sums = mirrored_kernels::cpu_row_sums(&self.data, self.shape)?;
        Tensor::new(sums, [self.shape[0], 1])
    }

    /// Sums each column: `[m, n] -> [1, n]`.
    pub fn sum_cols(&self) -> Result<Self> {
        let cols = self.shape[1];
        let mut out = vec![T::zero(); cols];
        if cols > 0 {
            for row in self.data.chunks(cols) {
                for (o, &x) in out.iter_mut().zip(row) {
                    *o += x;
                }
            }
        }
        Tensor::new(out, [1, cols])
    }

    /// Repeats a `[m, 1]` column `n` times: `[m, 1] -> [m, n]`.
    pub fn broadcast_cols(&self, n: usize) -> Result<Self> {
        if self.shape[1] != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.shape[0], 1],
                got: self.shape.to_vec(),
            });
        }
        let data = self
            .data
            .iter()
            .flat_map(|&x| std::iter::repeat_n(x, n))
            .collect();
        Tensor::new(data, [self.shape[0], n])
    }

    /// Copies rows `start..end` into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.shape[0] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start, end],
                shape: self.shape.to_vec(),
            });
        }
        let cols = self.shape[1];
        Tensor::new(self.data[start * cols..end * cols].to_vec(), [end - start, cols])
    }

    /// Index of the largest element of each row. Ties resolve to the lowest index.
    pub fn argmax_rows(&self) -> Vec<usize> {
        let cols = self.shape[1];
        if cols == 0 {
            return vec![0; self.shape[0]];
        }
        self.data
            .chunks(cols)
            .map(|row| {
                let mut best = 0;
                for (i, x) in row.iter().enumerate().skip(1) {
                    if *x > row[best] {
                        best = i;
                    }
                }
                best
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t2(data: Vec<f32>, shape: [usize; 2]) -> Tensor<f32, 2> {
        Tensor::new(data, shape).unwrap()
    }

    #[test]
    fn test_binary_ops() {
        let a = t2(vec![1.0, 2.0, 3.0, 4.0], [2, 2]);
        let b = t2(vec![4.0, 3.0, 2.0, 1.0], [2, 2]);

        assert_eq!((&a + &b).unwrap().data(), &[5.0, 5.0, 5.0, 5.0]);
        assert_eq!((&a - &b).unwrap().data(), &[-3.0, -1.0, 1.0, 3.0]);
        assert_eq!((&a * &b).unwrap().data(), &[4.0, 6.0, 6.0, 4.0]);
        assert_eq!((&a / &b).unwrap().data(), &[0.25, 2.0 / 3.0, 1.5, 4.0]);
    }

    #[test]
    fn test_binary_op_shape_mismatch() {
        let a = t2(vec![1.0, 2.0], [1, 2]);
        let b = t2(vec![1.0, 2.0], [2, 1]);
        assert!(matches!(&a + &b, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_scale_sum_finite() {
        let a = t2(vec![1.0, 2.0, 3.0], [1, 3]);
        assert_eq!(a.scale(2.0).data(), &[2.0, 4.0, 6.0]);
        assert_eq!(a.sum(), 6.0);
        assert!(a.is_finite());

        let bad = t2(vec![1.0, f32::NAN], [1, 2]);
        assert!(!bad.is_finite());
        let inf = t2(vec![f32::INFINITY], [1, 1]);
        assert!(!inf.is_finite());
    }

    #[test]
    fn test_add_assign() {
        let mut a = t2(vec![1.0, 2.0], [1, 2]);
        a.add_assign(&t2(vec![0.5, 0.5], [1, 2])).unwrap();
        assert_eq!(a.data(), &[1.5, 2.5]);
        assert!(a.add_assign(&t2(vec![1.0], [1, 1])).is_err());
    }

    #[test]
    fn test_matmul_transpose() {
        let a = t2(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let at = a.transpose().unwrap();
        assert_eq!(at.shape(), &[3, 2]);

        let gram = a.matmul(&at).unwrap();
        assert_eq!(gram.shape(), &[2, 2]);
        assert_eq!(gram.data(), &[14.0, 32.0, 32.0, 77.0]);
    }

    #[test]
    fn test_add_row_and_sum_cols() {
        let a = t2(vec![1.0, 2.0, 3.0, 4.0], [2, 2]);
        let bias = t2(vec![10.0, 20.0], [1, 2]);

        let out = a.add_row(&bias).unwrap();
        assert_eq!(out.data(), &[11.0, 22.0, 13.0, 24.0]);
        assert_eq!(a.sum_cols().unwrap().data(), &[4.0, 6.0]);

        assert!(a.add_row(&t2(vec![1.0, 2.0, 3.0], [1, 3])).is_err());
    }

    #[test]
    fn test_sum_rows_and_broadcast() {
        let a = t2(vec![1.0, 2.0, 3.0, 4.0], [2, 2]);
        let rows = a.sum_rows().unwrap();
        assert_eq!(rows.shape(), &[2, 1]);
        assert_eq!(rows.data(), &[3.0, 7.0]);

        let wide = rows.broadcast_cols(3).unwrap();
        assert_eq!(wide.data(), &[3.0, 3.0, 3.0, 7.0, 7.0, 7.0]);
        assert!(a.broadcast_cols(2).is_err());
    }

    #[test]
    fn test_slice_rows() {
        let a = t2(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]);
        assert_eq!(a.slice_rows(1, 3).unwrap().data(), &[3.0, 4.0, 5.0, 6.0]);
        assert_eq!(a.slice_rows(2, 2).unwrap().shape(), &[0, 2]);
        assert!(a.slice_rows(2, 4).is_err());
    }

    #[test]
    fn test_from_rows() {
        let r0 = [1.0f32, 2.0];
        let r1 = [3.0f32, 4.0];
        let t = Tensor::from_rows(&[&r0[..], &r1[..]], 2).unwrap();
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.data(), &[1.0, 2.0, 3.0, 4.0]);

        let short = [1.0f32];
        assert!(Tensor::from_rows(&[&short[..]], 2).is_err());
    }

    #[test]
    fn test_argmax_rows() {
        let a = t2(vec![0.1, 0.9, 0.5, 0.5, 0.7, 0.2], [3, 2]);
        assert_eq!(a.argmax_rows(), vec![1, 0, 0]);
    }
}
