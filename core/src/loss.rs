//! Per-example losses and explicit reductions.
//!
//! A [`Loss`] never reduces: it maps `[batch, outputs]` predictions to a
//! `[batch, 1]` column of per-example losses. Turning that column into a
//! scalar is the caller's job and is always spelled out with a
//! [`Reduction`]. In mirrored training the only correct choice is
//! [`Reduction::SumOverGlobalBatch`]: each replica divides its local sum by
//! the size of the *global* batch, so summing the replica losses (and
//! gradients) reconstructs the full-batch mean.

use crate::autograd::Variable;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use std::fmt::Debug;

/// How a column of per-example losses becomes a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Plain sum.
    Sum,
    /// Sum divided by the global batch size.
    SumOverGlobalBatch(usize),
    /// Sum divided by the local batch size. Not valid across replicas.
    Mean,
    /// No reduction. Cannot produce a scalar loss.
    None,
}

impl Reduction {
    /// Whether summing this reduction across replicas yields the global mean.
    pub fn is_replica_safe(&self) -> bool {
        matches!(self, Reduction::Sum | Reduction::SumOverGlobalBatch(_))
    }

    /// Reduces `[batch, 1]` per-example losses to a scalar.
    pub fn apply<T>(&self, per_example: &Variable<T, 2>) -> Result<Variable<T, 0>>
    where
        T: TensorElem + 'static,
    {
        let total = per_example.sum_all()?;
        let denominator = match *self {
            Reduction::Sum => return Ok(total),
            Reduction::SumOverGlobalBatch(global) => global,
            Reduction::Mean => per_example.data.rows(),
            Reduction::None => {
                return Err(TensorError::Unsupported(
                    "Reduction::None does not produce a scalar loss".into(),
                ));
            }
        };
        if denominator == 0 {
            return Err(TensorError::Unsupported(
                "cannot average over an empty batch".into(),
            ));
        }
        let factor = T::from_f64(1.0 / denominator as f64)
            .ok_or_else(|| TensorError::Unsupported("loss scale not representable".into()))?;
        Ok(total.scale(factor))
    }
}

/// A loss that produces one value per example.
pub trait Loss<T: TensorElem>: Debug + Send + Sync {
    /// `[batch, outputs]` predictions and `[batch, k]` targets to `[batch, 1]` losses.
    fn per_example(&self, predictions: &Variable<T, 2>, targets: &Tensor<T, 2>) -> Result<Variable<T, 2>>;

    /// Number of correct predictions, for losses with a notion of accuracy.
    fn correct(&self, _predictions: &Tensor<T, 2>, _targets: &Tensor<T, 2>) -> Option<usize> {
        None
    }
}

/// Squared error averaged over output features (not over the batch).
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl<T> Loss<T> for MeanSquaredError
where
    T: TensorElem + 'static,
{
    fn per_example(&self, predictions: &Variable<T, 2>, targets: &Tensor<T, 2>) -> Result<Variable<T, 2>> {
        let diff = predictions.sub(&Variable::new(targets.clone()))?;
        let per_row = diff.mul(&diff)?.sum_rows()?;
        let cols = predictions.data.cols().max(1);
        let factor = T::from_f64(1.0 / cols as f64)
            .ok_or_else(|| TensorError::Unsupported("loss scale not representable".into()))?;
        Ok(per_row.scale(factor))
    }
}

/// Cross entropy over logits with integer class targets stored as `[batch, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseCategoricalCrossEntropy;

impl SparseCategoricalCrossEntropy {
    fn classes<T: TensorElem>(targets: &Tensor<T, 2>, num_classes: usize) -> Result<Vec<usize>> {
        if targets.cols() != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![targets.rows(), 1],
                got: targets.shape().to_vec(),
            });
        }
        targets
            .data()
            .iter()
            .map(|t| match t.to_usize() {
                Some(class) if class < num_classes => Ok(class),
                _ => Err(TensorError::IndexOutOfBounds {
                    index: vec![t.to_usize().unwrap_or(usize::MAX)],
                    shape: vec![num_classes],
                }),
            })
            .collect()
    }
}

impl<T> Loss<T> for SparseCategoricalCrossEntropy
where
    T: TensorElem + Float + 'static,
{
    fn per_example(&self, predictions: &Variable<T, 2>, targets: &Tensor<T, 2>) -> Result<Variable<T, 2>> {
        let [batch, num_classes] = *predictions.data.shape();
        if targets.rows() != batch {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, 1],
                got: targets.shape().to_vec(),
            });
        }

        let classes = Self::classes(targets, num_classes)?;
        let mut onehot = Tensor::zeros([batch, num_classes]);
        for (row, class) in classes.into_iter().enumerate() {
            onehot.data_mut()[row * num_classes + class] = T::one();
        }

        let picked = predictions
            .log_softmax()?
            .mul(&Variable::new(onehot))?
            .sum_rows()?;
        Ok(picked.scale(T::zero() - T::one()))
    }

    fn correct(&self, predictions: &Tensor<T, 2>, targets: &Tensor<T, 2>) -> Option<usize> {
        let classes = Self::classes(targets, predictions.cols()).ok()?;
        Some(
            predictions
                .argmax_rows()
                .into_iter()
                .zip(classes)
                .filter(|(p, t)| p == t)
                .count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn column(values: &[f64]) -> Variable<f64, 2> {
        Variable::new(Tensor::new(values.to_vec(), [values.len(), 1]).unwrap())
    }

    #[test]
    fn test_global_batch_scaling_scenario() {
        // [2, 3] and [4, 5] on two replicas, global batch of four
        let a = Reduction::SumOverGlobalBatch(4).apply(&column(&[2.0, 3.0])).unwrap();
        let b = Reduction::SumOverGlobalBatch(4).apply(&column(&[4.0, 5.0])).unwrap();

        assert_eq!(a.data.data()[0], 1.25);
        assert_eq!(b.data.data()[0], 2.25);
        assert_eq!(a.data.data()[0] + b.data.data()[0], 3.5);

        let full = Reduction::Mean.apply(&column(&[2.0, 3.0, 4.0, 5.0])).unwrap();
        assert_eq!(full.data.data()[0], 3.5);
    }

    #[test]
    fn test_local_mean_overcounts_across_replicas() {
        let a = Reduction::Mean.apply(&column(&[2.0, 3.0])).unwrap();
        let b = Reduction::Mean.apply(&column(&[4.0, 5.0])).unwrap();
        assert_eq!(a.data.data()[0] + b.data.data()[0], 7.0);
        assert!(!Reduction::Mean.is_replica_safe());
    }

    #[test]
    fn test_none_is_rejected() {
        assert!(Reduction::None.apply(&column(&[1.0])).is_err());
        assert!(!Reduction::None.is_replica_safe());
        assert!(Reduction::Sum.is_replica_safe());
        assert!(Reduction::SumOverGlobalBatch(8).is_replica_safe());
    }

    #[test]
    fn test_zero_global_batch_rejected() {
        assert!(Reduction::SumOverGlobalBatch(0).apply(&column(&[1.0])).is_err());
    }

    #[test]
    fn test_mse_per_example() {
        let preds = Variable::new(Tensor::new(vec![1.0, 3.0, 0.0, 0.0], [2, 2]).unwrap());
        let targets = Tensor::new(vec![0.0, 1.0, 0.0, 2.0], [2, 2]).unwrap();

        let losses = MeanSquaredError.per_example(&preds, &targets).unwrap();
        assert_eq!(losses.data.shape(), &[2, 1]);
        assert_eq!(losses.data.data(), &[2.5, 2.0]);
    }

    #[test]
    fn test_mse_gradient() {
        let preds = Variable::new(Tensor::new(vec![3.0], [1, 1]).unwrap());
        let targets = Tensor::new(vec![1.0], [1, 1]).unwrap();

        let loss = Reduction::Sum
            .apply(&MeanSquaredError.per_example(&preds, &targets).unwrap())
            .unwrap();
        loss.backward().unwrap();
        assert_eq!(preds.grad().unwrap().data(), &[4.0]);
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Variable::new(Tensor::<f64, 2>::zeros([2, 4]));
        let targets = Tensor::new(vec![0.0, 3.0], [2, 1]).unwrap();

        let losses = SparseCategoricalCrossEntropy
            .per_example(&logits, &targets)
            .unwrap();
        for &l in losses.data.data() {
            assert_relative_eq!(l, 4.0f64.ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cross_entropy_rejects_bad_class() {
        let logits = Variable::new(Tensor::<f64, 2>::zeros([1, 2]));
        let targets = Tensor::new(vec![5.0], [1, 1]).unwrap();
        assert!(SparseCategoricalCrossEntropy.per_example(&logits, &targets).is_err());
    }

    #[test]
    fn test_cross_entropy_correct_count() {
        let logits = Tensor::new(vec![2.0, 1.0, 0.0, 3.0, 5.0, -1.0], [3, 2]).unwrap();
        let targets = Tensor::new(vec![0.0, 1.0, 1.0], [3, 1]).unwrap();
        assert_eq!(
            Loss::<f64>::correct(&SparseCategoricalCrossEntropy, &logits, &targets),
            Some(2)
        );
        assert_eq!(Loss::<f64>::correct(&MeanSquaredError, &logits, &targets), None);
    }
}
