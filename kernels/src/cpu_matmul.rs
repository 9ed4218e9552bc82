use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Row-major matrix product `[m, k] x [k, n] -> [m, n]`.
///
/// The right-hand side is transposed once up front so the inner dot product
/// walks both operands sequentially. Output rows are computed in parallel,
/// but each element is accumulated in a fixed order, so results do not depend
/// on how rayon schedules the rows.
pub fn cpu_matmul<T>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: [usize; 2],
    rhs_shape: [usize; 2],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let [m, k] = lhs_shape;
    let [rhs_k, n] = rhs_shape;

    if k != rhs_k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k, n],
            got: rhs_shape.to_vec(),
        });
    }
    if lhs_data.len() != m * k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m * k],
            got: vec![lhs_data.len()],
        });
    }
    if rhs_data.len() != k * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k * n],
            got: vec![rhs_data.len()],
        });
    }

    let mut out_data = vec![T::zero(); m * n];
    if m == 0 || n == 0 {
        return Ok(out_data);
    }

    // [k, n] -> [n, k]
    let rhs_t = super::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;

    out_data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(row, out_row)| {
            let a_row = &lhs_data[row * k..(row + 1) * k];
            for (col, out_elem) in out_row.iter_mut().enumerate() {
                let b_col = &rhs_t[col * k..(col + 1) * k];
                let mut acc = T::zero();
                for (&a, &b) in a_row.iter().zip(b_col) {
                    acc += a * b;
                }
                *out_elem = acc;
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_square() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![5.0, 6.0, 7.0, 8.0];

        let result = cpu_matmul(&a, &b, [2, 2], [2, 2]).unwrap();
        // [1*5+2*7, 1*6+2*8]
        // [3*5+4*7, 3*6+4*8]
        assert_eq!(result, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_rectangular() {
        // [1, 3] x [3, 2]
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];

        let result = cpu_matmul(&a, &b, [1, 3], [3, 2]).unwrap();
        assert_eq!(result, vec![4.0, 5.0]);
    }

    #[test]
    fn test_matmul_empty_rows() {
        let a: Vec<f32> = vec![];
        let b = vec![1.0f32; 6];

        let result = cpu_matmul(&a, &b, [0, 3], [3, 2]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_matmul_inner_dim_mismatch() {
        let a = vec![1.0; 4];
        let b = vec![1.0; 6];

        let err = cpu_matmul(&a, &b, [2, 2], [3, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matmul_data_length_mismatch() {
        let a = vec![1.0; 3];
        let b = vec![1.0; 4];

        let err = cpu_matmul(&a, &b, [2, 2], [2, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
