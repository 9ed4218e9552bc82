//! One model replica: a private parameter copy, optimizer and collective
//! endpoint.

use super::aggregator::{GlobalReport, GradientAggregator, LocalReport};
use super::backend::CollectiveBackend;
use crate::autograd::{self, Variable};
use crate::data::{Batch, Example};
use crate::error::{Result, TrainError};
use crate::loss::{Loss, Reduction};
use crate::nn::{Model, ParameterSet};
use crate::optim::{Optimizer, OptimizerState};
use crate::tensor::{Tensor, TensorElem};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug_span;

/// The result of a replica's local forward/backward pass, before any
/// communication.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStep<T: TensorElem> {
    /// Partial loss, already scaled by the reduction.
    pub loss: T,
    pub grads: Vec<Tensor<T, 2>>,
    pub correct: Option<usize>,
    pub examples: usize,
}

impl<T: TensorElem> LocalStep<T> {
    pub fn is_finite(&self) -> bool {
        self.loss.to_f64().is_some_and(f64::is_finite) && self.grads.iter().all(Tensor::is_finite)
    }
}

/// A step after the all-reduce. Identical on every replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedStep<T: TensorElem> {
    /// Global loss: the sum of all partial losses.
    pub loss: T,
    /// Aggregated gradients, ready to apply.
    pub grads: Vec<Tensor<T, 2>>,
    pub correct: Option<usize>,
    pub examples: usize,
}

struct Forward<T: TensorElem> {
    leaves: Vec<Variable<T, 2>>,
    per_example: Variable<T, 2>,
    correct: Option<usize>,
}

pub struct Replica<T: TensorElem, M> {
    id: usize,
    model: Arc<M>,
    params: ParameterSet<T>,
    optimizer: Box<dyn Optimizer<T>>,
    backend: Box<dyn CollectiveBackend<T>>,
    aggregator: GradientAggregator,
}

impl<T: TensorElem, M: fmt::Debug> fmt::Debug for Replica<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("parameters", &self.params.names())
            .field("optimizer", &self.optimizer)
            .finish_non_exhaustive()
    }
}

impl<T, M> Replica<T, M>
where
    T: TensorElem + 'static,
    M: Model<T>,
{
    pub fn new(
        model: Arc<M>,
        params: ParameterSet<T>,
        optimizer: Box<dyn Optimizer<T>>,
        backend: Box<dyn CollectiveBackend<T>>,
    ) -> Self {
        Self {
            id: backend.rank(),
            model,
            params,
            optimizer,
            backend,
            aggregator: GradientAggregator::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn parameters(&self) -> &ParameterSet<T> {
        &self.params
    }

    pub fn optimizer(&self) -> &dyn Optimizer<T> {
        self.optimizer.as_ref()
    }

    pub fn set_learning_rate(&mut self, learning_rate: T) {
        self.optimizer.set_learning_rate(learning_rate);
    }

    /// Overwrites parameters and optimizer state, e.g. from a checkpoint.
    ///
    /// Everything is checked before anything is written, so on error the
    /// replica keeps its previous parameters and optimizer state.
    pub fn load_state(&mut self, params: &ParameterSet<T>, optimizer: Option<OptimizerState<T>>) -> Result<()> {
        if params.fingerprint() != self.params.fingerprint() {
            return Err(TrainError::checkpoint(format!(
                "replica {} cannot load parameters {:?} into {:?}",
                self.id,
                params.names(),
                self.params.names()
            )));
        }
        if let Some(state) = optimizer {
            state.check_against(params)?;
            self.optimizer.load_state_dict(state)?;
        }
        self.params.copy_from(params)?;
        Ok(())
    }

    fn forward(&self, shard: &[Example<T>], loss: &(impl Loss<T> + ?Sized)) -> Result<Option<Forward<T>>> {
        if shard.is_empty() {
            return Ok(None);
        }
        let batch = Batch::collate(shard)?;
        let leaves = self.params.to_variables();
        let predictions = self.model.forward(&leaves, &Variable::new(batch.inputs))?;
        let per_example = loss.per_example(&predictions, &batch.targets)?;
        let correct = loss.correct(&predictions.data, &batch.targets);
        Ok(Some(Forward {
            leaves,
            per_example,
            correct,
        }))
    }

    /// Forward and backward pass on this replica's sub-batch.
    ///
    /// Touches no shared state. An empty shard contributes a zero loss and
    /// zero gradients.
    pub fn compute_local(
        &self,
        shard: &[Example<T>],
        loss: &(impl Loss<T> + ?Sized),
        reduction: Reduction,
    ) -> Result<LocalStep<T>> {
        if !reduction.is_replica_safe() {
            return Err(TrainError::invalid_config(format!(
                "{reduction:?} is not valid across replicas"
            )));
        }

        let Some(fwd) = self.forward(shard, loss)? else {
            return Ok(LocalStep {
                loss: T::zero(),
                grads: self.params.tensors().iter().map(Tensor::zeros_like).collect(),
                correct: None,
                examples: 0,
            });
        };

        let scalar = reduction.apply(&fwd.per_example)?;
        let grads = autograd::grad(&scalar, &fwd.leaves)?;
        Ok(LocalStep {
            loss: scalar.data.sum(),
            grads,
            correct: fwd.correct,
            examples: shard.len(),
        })
    }

    /// Runs this replica's part of one synchronous step.
    ///
    /// Every replica calls this concurrently with its own shard. The local
    /// step is isolated so that a failing or panicking replica still joins
    /// the step report, and either all replicas receive the aggregated
    /// gradients or all of them return an error.
    pub fn synchronize(
        &self,
        step: u64,
        shard: &[Example<T>],
        loss: &(impl Loss<T> + ?Sized),
        global_batch_size: usize,
    ) -> Result<ReducedStep<T>> {
        let span = debug_span!("replica_step", replica = self.id, step, examples = shard.len());
        let _guard = span.enter();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.compute_local(shard, loss, Reduction::SumOverGlobalBatch(global_batch_size))
        }));
        let (local, failure) = match outcome {
            Ok(Ok(local)) => (Some(local), None),
            Ok(Err(err)) => (None, Some(TrainError::replica_failed(self.id, err))),
            Err(_) => (None, Some(TrainError::ReplicaPanicked(self.id))),
        };
        let non_finite = local.as_ref().is_some_and(|l| !l.is_finite());

        let report = LocalReport {
            failed: failure.is_some(),
            non_finite,
            fingerprint: self.params.fingerprint(),
            loss: local.as_ref().map_or_else(T::zero, |l| l.loss),
            correct: local.as_ref().and_then(|l| l.correct),
            examples: local.as_ref().map_or(0, |l| l.examples),
        };
        let global = self.aggregator.exchange_report(self.backend.as_ref(), &report)?;

        if let Some(err) = failure {
            return Err(err);
        }
        if non_finite {
            return Err(TrainError::NonFinite { step, replica: self.id });
        }
        if !global.consistent {
            return Err(TrainError::divergence(format!(
                "parameter layout on replica {} differs from its peers",
                self.id
            )));
        }
        let Some(local) = local.filter(|_| global.is_healthy()) else {
            return Err(TrainError::Aborted { replica: self.id });
        };

        let grads = self.aggregator.reduce(self.backend.as_ref(), &local.grads)?;
        // Reduced buffers are bitwise identical, so every replica agrees here.
        if !grads.iter().all(Tensor::is_finite) {
            return Err(TrainError::NonFinite { step, replica: self.id });
        }

        Ok(ReducedStep {
            loss: global.loss,
            grads,
            correct: global.correct,
            examples: global.examples,
        })
    }

    /// Applies aggregated gradients to this replica's parameters.
    pub fn apply(&mut self, grads: &[Tensor<T, 2>]) -> Result<()> {
        self.optimizer.apply_gradients(&mut self.params, grads)?;
        Ok(())
    }

    /// Forward-only pass. The returned report carries the summed loss over
    /// every replica's shard (scaled by `Reduction::Sum`).
    pub fn evaluate(&self, step: u64, shard: &[Example<T>], loss: &(impl Loss<T> + ?Sized)) -> Result<GlobalReport<T>> {
        let _guard = debug_span!("replica_eval", replica = self.id, examples = shard.len()).entered();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<LocalStep<T>> {
            Ok(match self.forward(shard, loss)? {
                Some(fwd) => LocalStep {
                    loss: fwd.per_example.data.sum(),
                    grads: Vec::new(),
                    correct: fwd.correct,
                    examples: shard.len(),
                },
                None => LocalStep {
                    loss: T::zero(),
                    grads: Vec::new(),
                    correct: None,
                    examples: 0,
                },
            })
        }));
        let (local, failure) = match outcome {
            Ok(Ok(local)) => (Some(local), None),
            Ok(Err(err)) => (None, Some(TrainError::replica_failed(self.id, err))),
            Err(_) => (None, Some(TrainError::ReplicaPanicked(self.id))),
        };
        let non_finite = local.as_ref().is_some_and(|l| !l.is_finite());

        let report = LocalReport {
            failed: failure.is_some(),
            non_finite,
            fingerprint: self.params.fingerprint(),
            loss: local.as_ref().map_or_else(T::zero, |l| l.loss),
            correct: local.as_ref().and_then(|l| l.correct),
            examples: local.as_ref().map_or(0, |l| l.examples),
        };
        let global = self.aggregator.exchange_report(self.backend.as_ref(), &report)?;

        match failure {
            Some(err) => Err(err),
            None if non_finite => Err(TrainError::NonFinite { step, replica: self.id }),
            None if !global.is_healthy() => Err(TrainError::Aborted { replica: self.id }),
            None => Ok(global),
        }
    }
}
