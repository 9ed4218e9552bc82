use super::{Linear, Model, ParameterSet};
use crate::autograd::Variable;
use crate::tensor::{Result, TensorElem, TensorError};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// A stack of [`Linear`] layers with ReLU between them.
///
/// The last layer has no activation, so the output is raw logits (or raw
/// regression predictions).
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// `sizes = [input, hidden.., output]`.
    pub fn new(sizes: &[usize]) -> Result<Self> {
        if sizes.len() < 2 {
            return Err(TensorError::Unsupported(
                "an MLP needs at least an input and an output size".into(),
            ));
        }
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| Linear::new(format!("dense_{i}"), pair[0], pair[1]))
            .collect();
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// Deterministic initial parameters. Every replica is later seeded from
    /// one call to this, never from its own.
    pub fn init_parameters<T: TensorElem>(&self, seed: u64) -> Result<ParameterSet<T>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = ParameterSet::new();
        for layer in &self.layers {
            for (name, tensor) in layer.init_parameters(&mut rng)? {
                params.push(name, tensor)?;
            }
        }
        Ok(params)
    }
}

impl<T> Model<T> for Mlp
where
    T: TensorElem + 'static,
{
    fn parameter_names(&self) -> Vec<String> {
        self.layers
            .iter()
            .flat_map(|l| [l.weight_name(), l.bias_name()])
            .collect()
    }

    fn forward(&self, params: &[Variable<T, 2>], inputs: &Variable<T, 2>) -> Result<Variable<T, 2>> {
        if params.len() != 2 * self.layers.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![2 * self.layers.len()],
                got: vec![params.len()],
            });
        }

        let last = self.layers.len() - 1;
        let mut x = inputs.clone();
        for (i, (layer, pair)) in self.layers.iter().zip(params.chunks(2)).enumerate() {
            x = layer.apply(&pair[0], &pair[1], &x)?;
            if i < last {
                x = x.relu();
            }
        }
        Ok(x)
    }
}
