use super::Model;
use crate::autograd::Variable;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rand::Rng;

/// Linear Layer: `y = x W + b`
///
/// - Weight shape: `[in_features, out_features]`
/// - Bias shape: `[1, out_features]`, broadcast over the batch.
///
/// The weight is stored input-major so the forward pass is a single matmul
/// with no transpose.
#[derive(Debug, Clone)]
pub struct Linear {
    pub name: String,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
        }
    }

    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }

    pub fn bias_name(&self) -> String {
        format!("{}.bias", self.name)
    }

    /// Glorot-uniform weights and zero bias.
    pub fn init_parameters<T, R>(&self, rng: &mut R) -> Result<Vec<(String, Tensor<T, 2>)>>
    where
        T: TensorElem,
        R: Rng,
    {
        let limit = (6.0 / (self.in_features + self.out_features).max(1) as f64).sqrt();
        let weight = (0..self.in_features * self.out_features)
            .map(|_| {
                T::from_f64(rng.random_range(-limit..=limit))
                    .ok_or_else(|| TensorError::Unsupported("element type cannot hold f64".into()))
            })
            .collect::<Result<Vec<T>>>()?;

        Ok(vec![
            (
                self.weight_name(),
                Tensor::new(weight, [self.in_features, self.out_features])?,
            ),
            (self.bias_name(), Tensor::zeros([1, self.out_features])),
        ])
    }

    /// Applies the layer with explicit weight and bias variables.
    pub fn apply<T>(
        &self,
        weight: &Variable<T, 2>,
        bias: &Variable<T, 2>,
        x: &Variable<T, 2>,
    ) -> Result<Variable<T, 2>>
    where
        T: TensorElem + 'static,
    {
        if x.data.cols() != self.in_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![x.data.rows(), self.in_features],
                got: x.data.shape().to_vec(),
            });
        }
        x.matmul(weight)?.add_row(bias)
    }
}

impl<T> Model<T> for Linear
where
    T: TensorElem + 'static,
{
    fn parameter_names(&self) -> Vec<String> {
        vec![self.weight_name(), self.bias_name()]
    }

    fn forward(&self, params: &[Variable<T, 2>], inputs: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        let [weight, bias] = params else {
            return Err(TensorError::ShapeMismatch {
                expected: vec![2],
                got: vec![params.len()],
            });
        };
        self.apply(weight, bias, inputs)
    }
}
