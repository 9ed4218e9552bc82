use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Transposes a row-major `[m, n]` matrix into `[n, m]`.
pub fn cpu_transpose<T>(data: &[T], shape: [usize; 2]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let [m, n] = shape;
    if data.len() != m * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m * n],
            got: vec![data.len()],
        });
    }

    let mut out_data = vec![T::zero(); m * n];
    if m == 0 || n == 0 {
        return Ok(out_data);
    }

    // Output row `c` is input column `c`.
    out_data
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(c, out_row)| {
            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[r * n + c];
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_rectangular() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        let result = cpu_transpose(&data, [2, 3]).unwrap();
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_column_vector() {
        let data = vec![1.0, 2.0, 3.0];

        let result = cpu_transpose(&data, [3, 1]).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn test_transpose_length_mismatch() {
        let data = vec![1.0, 2.0, 3.0];
        assert!(cpu_transpose(&data, [2, 2]).is_err());
    }
}
