//! Training configuration.

use crate::distributed::MirroredStrategy;
use crate::error::{Result, TrainError};
use crate::optim::OptimizerConfig;
use crate::optim::scheduler::{ConstantLr, CosineDecay, LRScheduler, LinearWarmup, StepDecay};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a mirrored training run.
///
/// # Example
///
/// ```
/// use mirrored_rs::train::TrainingConfig;
///
/// let config = TrainingConfig::new(5).with_replicas(4).with_batch_size(8);
/// assert_eq!(config.global_batch_size(), 32);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of training epochs.
    pub epochs: usize,

    /// Examples per replica per step. The global batch is this times
    /// `num_replicas`.
    pub per_replica_batch_size: usize,

    pub num_replicas: usize,

    pub optimizer: OptimizerConfig,

    /// Learning rate schedule, evaluated once per epoch.
    pub lr_schedule: LearningRateSchedule,

    /// Whether to reshuffle the data each epoch.
    pub shuffle: bool,

    /// Seed for parameter initialization and shuffling.
    pub seed: u64,

    /// Drop the last global batch of an epoch if it is short.
    pub drop_last: bool,

    /// Where to write checkpoints. `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,

    /// Epochs between checkpoints.
    pub checkpoint_every_epochs: usize,

    /// Checkpoints kept on disk (0 = all).
    pub max_to_keep: usize,

    /// Cap on steps per epoch. `None` runs each epoch to the end of the data.
    pub steps_per_epoch: Option<usize>,

    /// Upper bound on how long a replica waits for a peer inside a collective.
    pub collective_timeout_ms: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

impl TrainingConfig {
    #[must_use]
    pub const fn new(epochs: usize) -> Self {
        Self {
            epochs,
            per_replica_batch_size: 32,
            num_replicas: 1,
            optimizer: OptimizerConfig::sgd(0.01),
            lr_schedule: LearningRateSchedule::Constant,
            shuffle: true,
            seed: 0,
            drop_last: false,
            checkpoint_dir: None,
            checkpoint_every_epochs: 1,
            max_to_keep: 3,
            steps_per_epoch: None,
            collective_timeout_ms: None,
        }
    }

    #[must_use]
    pub const fn with_batch_size(mut self, per_replica_batch_size: usize) -> Self {
        self.per_replica_batch_size = per_replica_batch_size;
        self
    }

    #[must_use]
    pub const fn with_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    #[must_use]
    pub const fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    #[must_use]
    pub const fn with_lr_schedule(mut self, schedule: LearningRateSchedule) -> Self {
        self.lr_schedule = schedule;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub const fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    #[must_use]
    pub fn with_checkpoints(mut self, dir: impl Into<PathBuf>, every_epochs: usize) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self.checkpoint_every_epochs = every_epochs;
        self
    }

    #[must_use]
    pub const fn with_steps_per_epoch(mut self, steps: usize) -> Self {
        self.steps_per_epoch = Some(steps);
        self
    }

    pub const fn global_batch_size(&self) -> usize {
        self.per_replica_batch_size * self.num_replicas
    }

    /// Checks every field, naming the first bad one.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(TrainError::invalid_config(msg));
        if self.epochs == 0 {
            return fail("epochs must be positive");
        }
        if self.num_replicas == 0 {
            return fail("num_replicas must be positive");
        }
        if self.per_replica_batch_size == 0 {
            return fail("per_replica_batch_size must be positive");
        }
        if self.checkpoint_every_epochs == 0 {
            return fail("checkpoint_every_epochs must be positive");
        }
        if self.steps_per_epoch == Some(0) {
            return fail("steps_per_epoch must be positive when set");
        }
        if !self.optimizer.is_valid() {
            return Err(TrainError::invalid_config(format!(
                "invalid optimizer settings: {:?}",
                self.optimizer
            )));
        }
        self.lr_schedule.validate()
    }

    /// The strategy described by this config.
    pub fn strategy(&self) -> Result<MirroredStrategy> {
        let mut builder = MirroredStrategy::builder().num_replicas(self.num_replicas);
        if let Some(ms) = self.collective_timeout_ms {
            builder = builder.collective_timeout(Duration::from_millis(ms));
        }
        builder.build()
    }

    /// Learning rate scheduler indexed by epoch.
    pub fn scheduler(&self) -> Box<dyn LRScheduler> {
        self.lr_schedule
            .scheduler(self.optimizer.learning_rate, self.epochs)
    }

    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            _ => {
                return Err(TrainError::invalid_config(format!(
                    "{}: expected a .toml or .json file",
                    path.display()
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }
}

/// Learning rate schedules over epochs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LearningRateSchedule {
    /// The optimizer's base rate throughout.
    #[default]
    Constant,
    /// Multiply by `factor` every `step_size` epochs.
    Step { factor: f64, step_size: usize },
    /// Linear warmup over `warmup_epochs`, then linear decay to `min_lr`.
    LinearWarmup { warmup_epochs: usize, min_lr: f64 },
    /// Optional warmup, then half-cosine decay to `min_lr`.
    Cosine {
        #[serde(default)]
        warmup_epochs: usize,
        min_lr: f64,
    },
}

impl LearningRateSchedule {
    fn validate(&self) -> Result<()> {
        let ok = match *self {
            Self::Constant => true,
            Self::Step { factor, step_size } => factor > 0.0 && step_size > 0,
            Self::LinearWarmup { min_lr, .. } | Self::Cosine { min_lr, .. } => min_lr >= 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(TrainError::invalid_config(format!("invalid lr_schedule: {self:?}")))
        }
    }

    pub fn scheduler(&self, base_lr: f64, total_epochs: usize) -> Box<dyn LRScheduler> {
        match *self {
            Self::Constant => Box::new(ConstantLr { lr: base_lr }),
            Self::Step { factor, step_size } => Box::new(StepDecay {
                base_lr,
                factor,
                step_size,
            }),
            Self::LinearWarmup {
                warmup_epochs,
                min_lr,
            } => Box::new(LinearWarmup::new(base_lr, warmup_epochs, total_epochs).with_min_lr(min_lr)),
            Self::Cosine {
                warmup_epochs,
                min_lr,
            } => Box::new(CosineDecay::new(base_lr, warmup_epochs, total_epochs).with_min_lr(min_lr)),
        }
    }
}
