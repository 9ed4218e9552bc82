use super::{Optimizer, OptimizerState, check_shapes, check_state_len, parse_slot};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rayon::prelude::*;
use std::collections::HashMap;

/// Stochastic Gradient Descent (SGD) optimizer.
///
/// Updates parameters using the rule:
/// `v = momentum * v + grad; param = param - learning_rate * v`
///
/// With zero momentum no velocity is kept and this is plain SGD.
#[derive(Debug, Clone)]
pub struct Sgd<T: TensorElem> {
    pub learning_rate: T,
    pub momentum: T,
    velocity: HashMap<usize, Vec<T>>,
}

impl<T: TensorElem> Sgd<T> {
    pub fn new(learning_rate: T) -> Self {
        Self {
            learning_rate,
            momentum: T::zero(),
            velocity: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: T) -> Self {
        self.momentum = momentum;
        self
    }
}

impl<T: TensorElem> Optimizer<T> for Sgd<T> {
    fn apply(&mut self, key: usize, param: &mut Tensor<T, 2>, grad: &Tensor<T, 2>) -> Result<()> {
        check_shapes(param, grad)?;

        let lr = self.learning_rate;
        if self.momentum == T::zero() {
            param
                .data_mut()
                .par_iter_mut()
                .zip(grad.data().par_iter())
                .for_each(|(p, g)| {
                    *p -= lr * *g;
                });
            return Ok(());
        }

        let mu = self.momentum;
        let velocity = self
            .velocity
            .entry(key)
            .or_insert_with(|| vec![T::zero(); grad.size()]);
        check_state_len(param, velocity)?;
        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .zip(velocity.par_iter_mut())
            .for_each(|((p, g), v)| {
                *v = mu * *v + *g;
                *p -= lr * *v;
            });
        Ok(())
    }

    fn learning_rate(&self) -> T {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: T) {
        self.learning_rate = learning_rate;
    }

    fn state_dict(&self) -> OptimizerState<T> {
        let mut state = OptimizerState::default();
        for (key, v) in &self.velocity {
            state.buffers.insert(format!("velocity.{key}"), v.clone());
        }
        state
    }

    fn load_state_dict(&mut self, state: OptimizerState<T>) -> Result<()> {
        let mut velocity = HashMap::new();
        for (name, buffer) in state.buffers {
            match parse_slot(&name)? {
                ("velocity", key) => {
                    velocity.insert(key, buffer);
                }
                _ => {
                    return Err(TensorError::Unsupported(format!(
                        "unexpected SGD state slot `{name}`"
                    )));
                }
            }
        }
        self.velocity = velocity;
        Ok(())
    }
}
