//! The epoch/step driver.
//!
//! Each call to [`Trainer::train_step`] is one synchronous tick:
//!
//! 1. split the global batch into one contiguous shard per replica;
//! 2. every replica, on its own scoped thread, runs forward/backward with
//!    its loss scaled by the global batch size;
//! 3. the replicas exchange a step report and, if all are healthy, sum their
//!    gradients with a ring all-reduce;
//! 4. only once every replica holds the reduced gradients does any of them
//!    apply an update.
//!
//! A failure anywhere in 2 or 3 returns an error before step 4, so parameters
//! and optimizer state are never partially updated.

use super::config::TrainingConfig;
use super::metrics::TrainMetrics;
use crate::checkpoint::{Checkpoint, CheckpointElem, CheckpointManager, CheckpointStore};
use crate::data::{DataLoader, Dataset, Example, StreamPosition};
use crate::distributed::{GlobalReport, MirroredStrategy, ReducedStep, Replica};
use crate::error::{Result, TrainError};
use crate::loss::Loss;
use crate::nn::{Model, ParameterSet};
use crate::optim::scheduler::LRScheduler;
use num_traits::Float;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, debug_span, info, warn};

/// The outcome of one completed training step, identical on every replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// 1-based index of this step since training began.
    pub step: u64,
    /// Global mean loss over the step's batch.
    pub loss: f64,
    pub correct: Option<usize>,
    pub examples: usize,
    pub learning_rate: f64,
}

/// What happened during one epoch of [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// 1-based epoch number.
    pub epoch: u64,
    pub steps: usize,
    pub examples: usize,
    pub learning_rate: f64,
    /// Metric values at epoch end, before the reset.
    pub metrics: Vec<(String, f64)>,
    pub checkpoint: Option<PathBuf>,
    pub duration_secs: f64,
}

impl EpochSummary {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

/// Result of a distributed forward-only pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: Option<f64>,
    pub examples: usize,
}

/// Picks the error to report for a failed step: a root cause rather than a
/// peer's abort echo.
fn first_cause<R>(results: Vec<Result<R>>) -> Result<Vec<R>> {
    let mut ok = Vec::with_capacity(results.len());
    let mut cause: Option<TrainError> = None;
    for result in results {
        match result {
            Ok(value) => ok.push(value),
            Err(err) => match &cause {
                Some(existing) if !existing.is_abort() || err.is_abort() => {}
                _ => cause = Some(err),
            },
        }
    }
    match cause {
        Some(err) => Err(err),
        None => Ok(ok),
    }
}

fn cast<T: CheckpointElem>(value: f64) -> Result<T> {
    T::from_f64(value).ok_or_else(|| TrainError::invalid_config(format!("{value} not representable")))
}

fn as_f64<T: CheckpointElem>(value: T) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// Drives mirrored training of one model over `num_replicas` replicas.
pub struct Trainer<T, M, L>
where
    T: CheckpointElem + Float + 'static,
    M: Model<T>,
    L: Loss<T>,
{
    config: TrainingConfig,
    strategy: MirroredStrategy,
    loss: L,
    replicas: Vec<Replica<T, M>>,
    scheduler: Box<dyn LRScheduler>,
    checkpoints: Option<CheckpointManager>,
    learning_rate: f64,
    step: u64,
    epoch: u64,
    position: Option<StreamPosition>,
}

impl<T, M, L> std::fmt::Debug for Trainer<T, M, L>
where
    T: CheckpointElem + Float + 'static,
    M: Model<T>,
    L: Loss<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("strategy", &self.strategy)
            .field("loss", &self.loss)
            .field("step", &self.step)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl<T, M, L> Trainer<T, M, L>
where
    T: CheckpointElem + Float + 'static,
    M: Model<T>,
    L: Loss<T>,
{
    /// Builds one replica per configured device, each starting from a copy
    /// of `initial`.
    pub fn new(model: M, initial: ParameterSet<T>, loss: L, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let strategy = config.strategy()?;

        let expected = model.parameter_names();
        if expected.as_slice() != initial.names() {
            return Err(TrainError::invalid_config(format!(
                "model expects parameters {expected:?}, got {:?}",
                initial.names()
            )));
        }

        let model = Arc::new(model);
        let mut replicas = Vec::with_capacity(strategy.num_replicas());
        for backend in strategy.backends::<T>()? {
            replicas.push(Replica::new(
                Arc::clone(&model),
                initial.clone(),
                config.optimizer.build::<T>()?,
                Box::new(backend),
            ));
        }

        let checkpoints = config
            .checkpoint_dir
            .as_ref()
            .map(|dir| CheckpointManager::new(dir, config.max_to_keep))
            .transpose()?;

        let mut trainer = Self {
            scheduler: config.scheduler(),
            learning_rate: config.optimizer.learning_rate,
            config,
            strategy,
            loss,
            replicas,
            checkpoints,
            step: 0,
            epoch: 0,
            position: None,
        };
        trainer.set_learning_rate(trainer.scheduler.get_lr(0))?;
        info!(
            replicas = trainer.strategy.num_replicas(),
            parameters = initial.num_elements(),
            global_batch_size = trainer.config.global_batch_size(),
            "trainer ready"
        );
        Ok(trainer)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn strategy(&self) -> &MirroredStrategy {
        &self.strategy
    }

    pub fn replicas(&self) -> &[Replica<T, M>] {
        &self.replicas
    }

    /// Completed steps.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Completed epochs.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Where [`fit`](Self::fit) left the data stream.
    pub fn position(&self) -> Option<StreamPosition> {
        self.position
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// The current parameters. All replicas hold the same values.
    pub fn parameters(&self) -> &ParameterSet<T> {
        self.replicas[0].parameters()
    }

    /// Whether every replica holds identical parameters and optimizer state.
    pub fn replicas_in_sync(&self) -> bool {
        let first = &self.replicas[0];
        let state = first.optimizer().state_dict();
        self.replicas[1..]
            .iter()
            .all(|r| r.parameters() == first.parameters() && r.optimizer().state_dict() == state)
    }

    /// Sets the learning rate on every replica.
    pub fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()> {
        let lr = cast::<T>(learning_rate)?;
        for replica in &mut self.replicas {
            replica.set_learning_rate(lr);
        }
        self.learning_rate = learning_rate;
        Ok(())
    }

    /// A loader over `dataset` yielding global batches as configured.
    pub fn data_loader<D>(&self, dataset: D) -> DataLoader<D, Example<T>>
    where
        D: Dataset<Example<T>> + 'static,
    {
        let loader = DataLoader::new(dataset, self.config.global_batch_size()).drop_last(self.config.drop_last);
        if self.config.shuffle {
            loader.shuffle_seeded(self.config.seed)
        } else {
            loader
        }
    }

    /// Runs one synchronous step over `global_batch`.
    pub fn train_step(&mut self, global_batch: &[Example<T>]) -> Result<StepOutput> {
        if global_batch.is_empty() {
            return Err(TrainError::invalid_config("global batch is empty"));
        }
        let step = self.step + 1;
        let span = debug_span!("train_step", step, examples = global_batch.len());
        let _guard = span.enter();

        let shards = self.strategy.split_batch(global_batch);
        let global_batch_size = global_batch.len();
        let loss = &self.loss;
        let replicas = &self.replicas;
        let results: Vec<Result<ReducedStep<T>>> = thread::scope(|s| {
            let handles: Vec<_> = replicas
                .iter()
                .zip(shards)
                .map(|(replica, shard)| s.spawn(move || replica.synchronize(step, shard, loss, global_batch_size)))
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(id, h)| h.join().unwrap_or(Err(TrainError::ReplicaPanicked(id))))
                .collect()
        });

        let reduced = first_cause(results).inspect_err(|err| {
            warn!(step, error = %err, "step aborted, parameters unchanged");
        })?;

        self.replicas
            .par_iter_mut()
            .zip(reduced.par_iter())
            .try_for_each(|(replica, r)| replica.apply(&r.grads))?;
        self.step = step;

        let reduced = &reduced[0];
        let output = StepOutput {
            step,
            loss: as_f64(reduced.loss),
            correct: reduced.correct,
            examples: reduced.examples,
            learning_rate: self.learning_rate,
        };
        debug!(loss = output.loss, "step complete");
        Ok(output)
    }

    /// Runs up to `n` steps from `batches`, feeding each into `metrics`.
    ///
    /// Fewer than `n` steps run only when `batches` ends. The iterator is
    /// borrowed, so a second call continues from where this one stopped.
    pub fn run_steps<I>(&mut self, batches: &mut I, n: usize, metrics: &mut TrainMetrics) -> Result<Vec<StepOutput>>
    where
        I: Iterator<Item = Vec<Example<T>>>,
    {
        let mut outputs = Vec::with_capacity(n);
        for batch in batches.take(n) {
            let output = self.train_step(&batch)?;
            metrics.update(&output);
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Trains from the current epoch up to `config.epochs`.
    ///
    /// Metrics are reset at the end of every epoch, after their values are
    /// copied into that epoch's summary. A restored trainer resumes from the
    /// recorded stream position.
    pub fn fit<D>(&mut self, loader: &DataLoader<D, Example<T>>, metrics: &mut TrainMetrics) -> Result<Vec<EpochSummary>>
    where
        D: Dataset<Example<T>> + 'static,
    {
        if loader.num_batches() == 0 {
            return Err(TrainError::invalid_config("data loader yields no batches"));
        }
        let mut stream = loader.stream(true);
        if let Some(position) = self.position {
            stream.seek(position);
        }

        let total = self.config.epochs as u64;
        let mut summaries = Vec::new();
        while self.epoch < total {
            let started = Instant::now();
            let epoch_index = usize::try_from(self.epoch).unwrap_or(usize::MAX);
            self.set_learning_rate(self.scheduler.get_lr(epoch_index))?;

            let steps = match self.config.steps_per_epoch {
                Some(steps) => steps,
                None => match stream.remaining_in_pass() {
                    0 => loader.num_batches(),
                    left => left,
                },
            };
            let mut outputs = Vec::with_capacity(steps);
            for _ in 0..steps {
                let Some(batch) = stream.next() else { break };
                let output = self.train_step(&batch)?;
                // a failed step leaves the position on its batch
                self.position = Some(stream.position());
                metrics.update(&output);
                outputs.push(output);
            }
            self.epoch += 1;
            self.position = Some(stream.position());

            let due = self.epoch % self.config.checkpoint_every_epochs as u64 == 0;
            let checkpoint = if due && self.checkpoints.is_some() {
                Some(self.save_checkpoint()?)
            } else {
                None
            };

            let summary = EpochSummary {
                epoch: self.epoch,
                steps: outputs.len(),
                examples: outputs.iter().map(|o| o.examples).sum(),
                learning_rate: self.learning_rate,
                metrics: metrics.results(),
                checkpoint,
                duration_secs: started.elapsed().as_secs_f64(),
            };
            info!(
                epoch = summary.epoch,
                steps = summary.steps,
                loss = summary.metric("loss"),
                accuracy = summary.metric("accuracy"),
                lr = summary.learning_rate,
                "epoch complete"
            );
            metrics.reset();
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Distributed forward-only pass over one epoch of `loader`.
    pub fn evaluate<D>(&self, loader: &DataLoader<D, Example<T>>) -> Result<Evaluation>
    where
        D: Dataset<Example<T>> + 'static,
    {
        let mut loss_sum = 0.0;
        let mut correct: Option<usize> = None;
        let mut examples = 0;

        for batch in loader.iter() {
            let shards = self.strategy.split_batch(&batch);
            let loss = &self.loss;
            let step = self.step;
            let results: Vec<Result<GlobalReport<T>>> = thread::scope(|s| {
                let handles: Vec<_> = self
                    .replicas
                    .iter()
                    .zip(shards)
                    .map(|(replica, shard)| s.spawn(move || replica.evaluate(step, shard, loss)))
                    .collect();
                handles
                    .into_iter()
                    .enumerate()
                    .map(|(id, h)| h.join().unwrap_or(Err(TrainError::ReplicaPanicked(id))))
                    .collect()
            });
            let reports = first_cause(results)?;
            let Some(report) = reports.first() else {
                continue;
            };
            loss_sum += as_f64(report.loss);
            if let Some(c) = report.correct {
                *correct.get_or_insert(0) += c;
            }
            examples += report.examples;
        }

        if examples == 0 {
            return Err(TrainError::invalid_config("evaluation data is empty"));
        }
        Ok(Evaluation {
            loss: loss_sum / examples as f64,
            accuracy: correct.map(|c| c as f64 / examples as f64),
            examples,
        })
    }

    /// Snapshot of the training state, taken from the first replica.
    pub fn checkpoint(&self) -> Checkpoint<T> {
        let first = &self.replicas[0];
        Checkpoint {
            params: first.parameters().clone(),
            optimizer: Some(first.optimizer().state_dict()),
            step: self.step,
            epoch: self.epoch,
            position: self.position,
        }
    }

    /// Writes a checkpoint to the configured directory.
    pub fn save_checkpoint(&mut self) -> Result<PathBuf> {
        let checkpoint = self.checkpoint();
        let manager = self
            .checkpoints
            .as_mut()
            .ok_or_else(|| TrainError::invalid_config("no checkpoint_dir configured"))?;
        manager.save(self.step, &checkpoint)
    }

    /// Loads `checkpoint` into every replica.
    pub fn restore(&mut self, checkpoint: Checkpoint<T>) -> Result<()> {
        if checkpoint.params.fingerprint() != self.parameters().fingerprint() {
            return Err(TrainError::checkpoint(format!(
                "checkpoint parameters {:?} do not match the model's {:?}",
                checkpoint.params.names(),
                self.parameters().names()
            )));
        }
        if let Some(state) = &checkpoint.optimizer {
            state.check_against(&checkpoint.params)?;
            // dry run on a scratch optimizer before any replica is written
            self.config.optimizer.build::<T>()?.load_state_dict(state.clone())?;
        }
        for replica in &mut self.replicas {
            replica.load_state(&checkpoint.params, checkpoint.optimizer.clone())?;
        }
        self.step = checkpoint.step;
        self.epoch = checkpoint.epoch;
        self.position = checkpoint.position;
        info!(step = self.step, epoch = self.epoch, "restored checkpoint");
        Ok(())
    }

    /// Restores the newest checkpoint in the configured directory, if any.
    pub fn restore_latest(&mut self) -> Result<bool> {
        let Some(manager) = &self.checkpoints else {
            return Ok(false);
        };
        let Some(path) = manager.latest()? else {
            return Ok(false);
        };
        let checkpoint = manager.load(&path)?;
        self.restore(checkpoint)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::{MeanSquaredError, SparseCategoricalCrossEntropy};
    use crate::nn::{Linear, Mlp};
    use crate::optim::OptimizerConfig;
    use crate::tensor::Tensor;
    use approx::assert_relative_eq;

    fn scalar_params(w: f64) -> ParameterSet<f64> {
        let mut p = ParameterSet::new();
        p.push("dense.weight", Tensor::new(vec![w], [1, 1]).unwrap()).unwrap();
        p.push("dense.bias", Tensor::new(vec![0.0], [1, 1]).unwrap()).unwrap();
        p
    }

    fn linear_trainer(replicas: usize) -> Trainer<f64, Linear, MeanSquaredError> {
        let config = TrainingConfig::new(1)
            .with_replicas(replicas)
            .with_batch_size(2)
            .with_optimizer(OptimizerConfig::sgd(0.1))
            .without_shuffle();
        Trainer::new(Linear::new("dense", 1, 1), scalar_params(0.0), MeanSquaredError, config).unwrap()
    }

    fn examples(pairs: &[(f64, f64)]) -> Vec<Example<f64>> {
        pairs.iter().map(|&(x, y)| Example::new(vec![x], vec![y])).collect()
    }

    #[test]
    fn test_first_cause_prefers_root_error() {
        let results: Vec<Result<()>> = vec![
            Err(TrainError::Aborted { replica: 0 }),
            Err(TrainError::NonFinite { step: 1, replica: 1 }),
            Err(TrainError::Aborted { replica: 2 }),
        ];
        assert!(matches!(
            first_cause(results),
            Err(TrainError::NonFinite { replica: 1, .. })
        ));
        assert_eq!(first_cause(vec![Ok(1), Ok(2)]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_step_loss_is_global_mean() {
        let mut trainer = linear_trainer(2);
        // Zero predictions, so the loss is the mean of y^2.
        let out = trainer
            .train_step(&examples(&[(1.0, 2.0), (1.0, 3.0), (1.0, 4.0), (1.0, 5.0)]))
            .unwrap();
        assert_relative_eq!(out.loss, (4.0 + 9.0 + 16.0 + 25.0) / 4.0);
        assert_eq!(out.step, 1);
        assert_eq!(trainer.step(), 1);
        assert!(trainer.replicas_in_sync());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let mut trainer = linear_trainer(2);
        assert!(matches!(
            trainer.train_step(&[]),
            Err(TrainError::InvalidConfig(_))
        ));
        assert_eq!(trainer.step(), 0);
    }

    #[test]
    fn test_mismatched_parameters_rejected() {
        let config = TrainingConfig::new(1);
        let err = Trainer::new(Mlp::new(&[1, 2, 1]).unwrap(), scalar_params(0.0), MeanSquaredError, config)
            .unwrap_err();
        assert!(matches!(err, TrainError::InvalidConfig(_)));
    }

    #[test]
    fn test_fit_resets_metrics_each_epoch() {
        let config = TrainingConfig::new(3)
            .with_replicas(2)
            .with_batch_size(2)
            .with_optimizer(OptimizerConfig::sgd(0.01))
            .without_shuffle();
        let mut trainer = Trainer::new(Linear::new("dense", 1, 1), scalar_params(0.0), MeanSquaredError, config).unwrap();
        let data = examples(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 4.0), (5.0, 5.0)]);
        let loader = trainer.data_loader(data);
        let mut metrics = TrainMetrics::standard();

        let summaries = trainer.fit(&loader, &mut metrics).unwrap();
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.steps == 2 && s.examples == 5));
        // y = x is learnable, so the epoch loss falls.
        assert!(summaries[2].metric("loss").unwrap() < summaries[0].metric("loss").unwrap());
        assert!(metrics.results().is_empty());
        assert_eq!(trainer.epoch(), 3);
        assert_eq!(trainer.step(), 6);

        // Already at the configured epoch count.
        assert!(trainer.fit(&loader, &mut metrics).unwrap().is_empty());
    }

    #[test]
    fn test_fit_resumes_after_a_failed_step_without_replaying() {
        let config = TrainingConfig::new(1)
            .with_batch_size(1)
            .with_optimizer(OptimizerConfig::sgd(0.01))
            .without_shuffle();
        let mut trainer = Trainer::new(Linear::new("dense", 1, 1), scalar_params(0.0), MeanSquaredError, config).unwrap();
        let poisoned = trainer.data_loader(examples(&[(1.0, 1.0), (2.0, 2.0), (3.0, f64::NAN), (4.0, 4.0)]));

        let err = trainer.fit(&poisoned, &mut TrainMetrics::standard()).unwrap_err();
        assert!(matches!(err, TrainError::NonFinite { step: 3, replica: 0 }));
        assert_eq!(trainer.step(), 2);
        assert_eq!(trainer.epoch(), 0);
        assert_eq!(trainer.position().map(|p| p.offset), Some(2));

        let clean = trainer.data_loader(examples(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 4.0)]));
        let summaries = trainer.fit(&clean, &mut TrainMetrics::standard()).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].steps, 2);
        assert_eq!(trainer.step(), 4);
        assert_eq!(trainer.epoch(), 1);
    }

    #[test]
    fn test_evaluate_classifier() {
        let model = Mlp::new(&[2, 2]).unwrap();
        let params = model.init_parameters::<f32>(3).unwrap();
        let config = TrainingConfig::new(1).with_replicas(3).with_batch_size(1);
        let trainer = Trainer::new(model, params, SparseCategoricalCrossEntropy, config).unwrap();

        let data: Vec<Example<f32>> = (0..7)
            .map(|i| Example::new(vec![i as f32, 1.0], vec![(i % 2) as f32]))
            .collect();
        let eval = trainer.evaluate(&DataLoader::new(data, 3)).unwrap();
        assert_eq!(eval.examples, 7);
        assert!(eval.loss.is_finite() && eval.loss > 0.0);
        let accuracy = eval.accuracy.unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
    }

    #[test]
    fn test_learning_rate_follows_schedule() {
        use crate::train::LearningRateSchedule;
        let config = TrainingConfig::new(4)
            .with_batch_size(1)
            .with_optimizer(OptimizerConfig::sgd(0.1))
            .with_lr_schedule(LearningRateSchedule::Step {
                factor: 0.5,
                step_size: 1,
            })
            .without_shuffle();
        let mut trainer = Trainer::new(Linear::new("dense", 1, 1), scalar_params(0.0), MeanSquaredError, config).unwrap();
        let loader = trainer.data_loader(examples(&[(1.0, 1.0)]));
        let summaries = trainer.fit(&loader, &mut TrainMetrics::new()).unwrap();
        let rates: Vec<f64> = summaries.iter().map(|s| s.learning_rate).collect();
        assert_eq!(rates, vec![0.1, 0.05, 0.025, 0.0125]);
    }
}
