//! Training configuration, metrics and the epoch/step driver.

pub mod config;
pub mod metrics;
pub mod trainer;

pub use config::{LearningRateSchedule, TrainingConfig};
pub use metrics::{Accuracy, MeanLoss, Metric, TrainMetrics};
pub use trainer::{EpochSummary, Evaluation, StepOutput, Trainer};
