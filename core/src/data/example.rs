use crate::tensor::{Result, Tensor, TensorElem, TensorError};

/// One `(features, target)` pair.
///
/// For classification the target is a single class index stored as `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Example<T> {
    pub features: Vec<T>,
    pub target: Vec<T>,
}

impl<T> Example<T> {
    pub fn new(features: Vec<T>, target: Vec<T>) -> Self {
        Self { features, target }
    }
}

/// A collated sub-batch: `[b, features]` inputs and `[b, targets]` targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T: TensorElem> {
    pub inputs: Tensor<T, 2>,
    pub targets: Tensor<T, 2>,
}

impl<T: TensorElem> Batch<T> {
    /// Stacks examples row by row. All examples must share widths.
    pub fn collate(examples: &[Example<T>]) -> Result<Self> {
        let first = examples
            .first()
            .ok_or_else(|| TensorError::Unsupported("cannot collate an empty batch".into()))?;
        let feature_rows: Vec<&[T]> = examples.iter().map(|e| e.features.as_slice()).collect();
        let target_rows: Vec<&[T]> = examples.iter().map(|e| e.target.as_slice()).collect();

        Ok(Self {
            inputs: Tensor::from_rows(&feature_rows, first.features.len())?,
            targets: Tensor::from_rows(&target_rows, first.target.len())?,
        })
    }

    pub fn len(&self) -> usize {
        self.inputs.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
