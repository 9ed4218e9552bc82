use super::{Optimizer, OptimizerState, check_shapes, check_state_len, parse_slot};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rayon::prelude::*;
use std::collections::HashMap;

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
#[derive(Debug, Clone)]
pub struct AdamW<T: TensorElem> {
    pub learning_rate: T,
    pub beta1: T,
    pub beta2: T,
    pub epsilon: T,
    pub weight_decay: T,
    /// Key -> (m, v, step). Moments are flat so any shape fits.
    state: HashMap<usize, (Vec<T>, Vec<T>, u64)>,
}

impl<T: TensorElem + Float> AdamW<T> {
    /// Creates a new AdamW optimizer with betas `(0.9, 0.999)`, epsilon `1e-8`
    /// and weight decay `0.01`.
    pub fn new(learning_rate: T) -> Self {
        Self {
            learning_rate,
            beta1: T::from_f64(0.9).unwrap_or_else(T::zero),
            beta2: T::from_f64(0.999).unwrap_or_else(T::zero),
            epsilon: T::from_f64(1e-8).unwrap_or_else(T::epsilon),
            weight_decay: T::from_f64(0.01).unwrap_or_else(T::zero),
            state: HashMap::new(),
        }
    }

    pub fn with_betas(mut self, beta1: T, beta2: T) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: T) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: T) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl<T: TensorElem + Float> Optimizer<T> for AdamW<T> {
    fn apply(&mut self, key: usize, param: &mut Tensor<T, 2>, grad: &Tensor<T, 2>) -> Result<()> {
        check_shapes(param, grad)?;

        let size = param.size();
        let (m, v, step) = self
            .state
            .entry(key)
            .or_insert_with(|| (vec![T::zero(); size], vec![T::zero(); size], 0));
        check_state_len(param, m)?;
        check_state_len(param, v)?;
        *step += 1;

        let lr = self.learning_rate;
        let b1 = self.beta1;
        let b2 = self.beta2;
        let eps = self.epsilon;
        let lambda = self.weight_decay;
        let one = T::one();

        let t = i32::try_from(*step).unwrap_or(i32::MAX);
        let bias_correction1 = one - b1.powi(t);
        let bias_correction2 = one - b2.powi(t);

        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .zip(m.par_iter_mut())
            .zip(v.par_iter_mut())
            .for_each(|(((p, &g), m_elem), v_elem)| {
                *m_elem = b1 * *m_elem + (one - b1) * g;
                *v_elem = b2 * *v_elem + (one - b2) * g * g;

                let m_hat = *m_elem / bias_correction1;
                let v_hat = *v_elem / bias_correction2;

                *p = *p - lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
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
        for (key, (m, v, step)) in &self.state {
            state.buffers.insert(format!("m.{key}"), m.clone());
            state.buffers.insert(format!("v.{key}"), v.clone());
            state.counters.insert(format!("step.{key}"), *step);
        }
        state
    }

    fn load_state_dict(&mut self, state: OptimizerState<T>) -> Result<()> {
        let mut restored: HashMap<usize, (Vec<T>, Vec<T>, u64)> = HashMap::new();
        for (name, counter) in &state.counters {
            match parse_slot(name)? {
                ("step", key) => {
                    restored.entry(key).or_default().2 = *counter;
                }
                _ => {
                    return Err(TensorError::Unsupported(format!(
                        "unexpected AdamW counter `{name}`"
                    )));
                }
            }
        }
        for (name, buffer) in state.buffers {
            let (kind, key) = parse_slot(&name)?;
            let slot = restored.get_mut(&key).ok_or_else(|| {
                TensorError::Unsupported(format!("AdamW buffer `{name}` has no step counter"))
            })?;
            match kind {
                "m" => slot.0 = buffer,
                "v" => slot.1 = buffer,
                _ => {
                    return Err(TensorError::Unsupported(format!(
                        "unexpected AdamW state slot `{name}`"
                    )));
                }
            }
        }
        if let Some((key, _)) = restored
            .iter()
            .find(|(_, (m, v, _))| m.len() != v.len() || m.is_empty())
        {
            return Err(TensorError::Unsupported(format!(
                "incomplete AdamW state for parameter {key}"
            )));
        }
        self.state = restored;
        Ok(())
    }
}
