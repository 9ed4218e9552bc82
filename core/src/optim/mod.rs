//! Optimizers and learning-rate schedules.
//!
//! Every replica owns its own optimizer instance built from the same
//! [`OptimizerConfig`]. Updates are pure functions of (parameter, aggregated
//! gradient, prior state), so replicas that start identical stay identical
//! without ever exchanging parameter values.

pub mod adamw;
pub mod scheduler;
pub mod sgd;

pub use adamw::AdamW;
pub use scheduler::{ConstantLr, CosineDecay, LRScheduler, LinearWarmup, StepDecay};
pub use sgd::Sgd;

use crate::nn::ParameterSet;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Flat snapshot of an optimizer's internal state, keyed by slot name.
///
/// Buffers are stored flat so they can be written next to the parameters in
/// a checkpoint without knowing their original shape.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState<T> {
    pub buffers: BTreeMap<String, Vec<T>>,
    pub counters: BTreeMap<String, u64>,
}

impl<T> Default for OptimizerState<T> {
    fn default() -> Self {
        Self {
            buffers: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }
}

impl<T> OptimizerState<T> {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.counters.is_empty()
    }
}

impl<T: TensorElem> OptimizerState<T> {
    /// Checks that every `slot.key` buffer names an existing parameter and
    /// holds exactly one value per element of it.
    pub fn check_against(&self, params: &ParameterSet<T>) -> Result<()> {
        let tensors = params.tensors();
        for (name, buffer) in &self.buffers {
            let (_, key) = parse_slot(name)?;
            let param = tensors.get(key).ok_or_else(|| {
                TensorError::Unsupported(format!(
                    "optimizer slot `{name}` refers to parameter {key}, only {} exist",
                    tensors.len()
                ))
            })?;
            check_state_len(param, buffer)?;
        }
        Ok(())
    }
}

/// A per-parameter state buffer must match the parameter element for element.
pub(crate) fn check_state_len<T: TensorElem>(param: &Tensor<T, 2>, buffer: &[T]) -> Result<()> {
    if buffer.len() != param.size() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![param.size()],
            got: vec![buffer.len()],
        });
    }
    Ok(())
}

/// Splits a slot name like `"m.3"` into `("m", 3)`.
pub(crate) fn parse_slot(name: &str) -> Result<(&str, usize)> {
    name.split_once('.')
        .and_then(|(kind, key)| key.parse().ok().map(|k| (kind, k)))
        .ok_or_else(|| TensorError::Unsupported(format!("malformed optimizer slot `{name}`")))
}

/// A trait for optimizers (e.g., SGD, AdamW).
///
/// Optimizers are responsible for updating model parameters based on computed gradients.
pub trait Optimizer<T: TensorElem>: Debug + Send + Sync {
    /// Updates one parameter in place. `key` identifies the parameter's state slot.
    fn apply(&mut self, key: usize, param: &mut Tensor<T, 2>, grad: &Tensor<T, 2>) -> Result<()>;

    fn learning_rate(&self) -> T;

    fn set_learning_rate(&mut self, learning_rate: T);

    fn state_dict(&self) -> OptimizerState<T>;

    fn load_state_dict(&mut self, state: OptimizerState<T>) -> Result<()>;

    /// Applies one gradient per parameter, in order.
    ///
    /// All shapes are checked before any parameter is touched, so a mismatch
    /// leaves `params` unchanged.
    fn apply_gradients(&mut self, params: &mut ParameterSet<T>, grads: &[Tensor<T, 2>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![params.len()],
                got: vec![grads.len()],
            });
        }
        for (param, grad) in params.tensors().iter().zip(grads) {
            check_shapes(param, grad)?;
        }
        for (key, (param, grad)) in params.tensors_mut().iter_mut().zip(grads).enumerate() {
            self.apply(key, param, grad)?;
        }
        Ok(())
    }
}

pub(crate) fn check_shapes<T: TensorElem>(param: &Tensor<T, 2>, grad: &Tensor<T, 2>) -> Result<()> {
    if param.shape() != grad.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: param.shape().to_vec(),
            got: grad.shape().to_vec(),
        });
    }
    Ok(())
}

/// Type of optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Stochastic Gradient Descent, with optional momentum.
    #[default]
    Sgd,
    /// Adam with decoupled weight decay.
    AdamW,
}

/// Serializable optimizer settings.
///
/// ```
/// use mirrored_rs::optim::OptimizerConfig;
///
/// let adam = OptimizerConfig::adamw(1e-3).with_weight_decay(0.01);
/// assert!(adam.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub momentum: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::sgd(0.01)
    }
}

impl OptimizerConfig {
    #[must_use]
    pub const fn sgd(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            learning_rate,
            momentum: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    #[must_use]
    pub const fn adamw(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate,
            momentum: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        }
    }

    #[must_use]
    pub const fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    #[must_use]
    pub const fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.learning_rate.is_finite()
            && self.learning_rate >= 0.0
            && (0.0..1.0).contains(&self.momentum)
            && (0.0..1.0).contains(&self.beta1)
            && (0.0..1.0).contains(&self.beta2)
            && self.epsilon > 0.0
            && self.weight_decay >= 0.0
    }

    /// Builds a fresh optimizer. Two calls yield identical optimizers.
    pub fn build<T>(&self) -> Result<Box<dyn Optimizer<T>>>
    where
        T: TensorElem + Float + 'static,
    {
        let cast = |v: f64| {
            T::from_f64(v)
                .ok_or_else(|| TensorError::Unsupported(format!("{v} not representable")))
        };
        Ok(match self.kind {
            OptimizerKind::Sgd => {
                Box::new(Sgd::new(cast(self.learning_rate)?).with_momentum(cast(self.momentum)?))
            }
            OptimizerKind::AdamW => Box::new(
                AdamW::new(cast(self.learning_rate)?)
                    .with_betas(cast(self.beta1)?, cast(self.beta2)?)
                    .with_epsilon(cast(self.epsilon)?)
                    .with_weight_decay(cast(self.weight_decay)?),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterSet<f64> {
        let mut p = ParameterSet::new();
        p.push("w", Tensor::new(vec![1.0, 2.0], [1, 2]).unwrap()).unwrap();
        p.push("b", Tensor::new(vec![0.0], [1, 1]).unwrap()).unwrap();
        p
    }

    #[test]
    fn test_apply_gradients() {
        let mut opt = OptimizerConfig::sgd(0.5).build::<f64>().unwrap();
        let mut p = params();
        let grads = vec![
            Tensor::new(vec![1.0, -1.0], [1, 2]).unwrap(),
            Tensor::new(vec![2.0], [1, 1]).unwrap(),
        ];

        opt.apply_gradients(&mut p, &grads).unwrap();
        assert_eq!(p.tensors()[0].data(), &[0.5, 2.5]);
        assert_eq!(p.tensors()[1].data(), &[-1.0]);
    }

    #[test]
    fn test_apply_gradients_is_all_or_nothing() {
        let mut opt = OptimizerConfig::sgd(0.5).build::<f64>().unwrap();
        let mut p = params();
        let before = p.clone();
        let grads = vec![
            Tensor::new(vec![1.0, -1.0], [1, 2]).unwrap(),
            Tensor::new(vec![2.0, 2.0], [1, 2]).unwrap(),
        ];

        assert!(opt.apply_gradients(&mut p, &grads).is_err());
        assert_eq!(p, before);
        assert!(opt.apply_gradients(&mut p, &grads[..1]).is_err());
        assert_eq!(p, before);
    }

    #[test]
    fn test_state_checked_against_parameters() {
        let p = params();
        let mut state = OptimizerState::default();
        state.buffers.insert("m.0".to_string(), vec![0.0, 0.0]);
        state.buffers.insert("m.1".to_string(), vec![0.0]);
        state.check_against(&p).unwrap();

        state.buffers.insert("v.0".to_string(), vec![0.0]);
        assert!(matches!(
            state.check_against(&p),
            Err(TensorError::ShapeMismatch { .. })
        ));

        let mut orphan = OptimizerState::default();
        orphan.buffers.insert("velocity.2".to_string(), vec![0.0]);
        assert!(orphan.check_against(&p).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(OptimizerConfig::sgd(0.1).is_valid());
        assert!(OptimizerConfig::adamw(1e-3).is_valid());
        assert!(!OptimizerConfig::sgd(-0.1).is_valid());
        assert!(!OptimizerConfig::sgd(0.1).with_momentum(1.0).is_valid());
        assert!(!OptimizerConfig::sgd(f64::NAN).is_valid());
    }

    #[test]
    fn test_config_serde() {
        let config = OptimizerConfig::adamw(0.002);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"adamw\""));
        let back: OptimizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: OptimizerConfig = serde_json::from_str(r#"{"kind":"sgd","momentum":0.9}"#).unwrap();
        assert_eq!(partial.momentum, 0.9);
        assert_eq!(partial.learning_rate, 0.01);
    }

    #[test]
    fn test_parse_slot() {
        assert_eq!(parse_slot("m.3").unwrap(), ("m", 3));
        assert!(parse_slot("m").is_err());
        assert!(parse_slot("m.x").is_err());
    }
}
