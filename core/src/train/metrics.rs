//! Streaming training metrics.
//!
//! Metrics are plain accumulators owned by the caller and passed into the
//! trainer; nothing is tracked globally. The trainer feeds each completed
//! [`StepOutput`] to every metric and resets them at epoch end.

use super::trainer::StepOutput;
use std::fmt::Debug;

/// An accumulator over training steps.
pub trait Metric: Debug + Send {
    fn name(&self) -> &str;

    fn update(&mut self, step: &StepOutput);

    /// Current value, or `None` before the first contributing step.
    fn result(&self) -> Option<f64>;

    fn reset(&mut self);
}

/// Example-weighted mean of the global step loss.
#[derive(Debug, Clone, Default)]
pub struct MeanLoss {
    weighted_sum: f64,
    examples: usize,
}

impl Metric for MeanLoss {
    fn name(&self) -> &str {
        "loss"
    }

    fn update(&mut self, step: &StepOutput) {
        self.weighted_sum += step.loss * step.examples as f64;
        self.examples += step.examples;
    }

    fn result(&self) -> Option<f64> {
        (self.examples > 0).then(|| self.weighted_sum / self.examples as f64)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Fraction of correctly classified examples. Steps without a correct count
/// (regression losses) are ignored.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: usize,
    examples: usize,
}

impl Metric for Accuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn update(&mut self, step: &StepOutput) {
        if let Some(correct) = step.correct {
            self.correct += correct;
            self.examples += step.examples;
        }
    }

    fn result(&self) -> Option<f64> {
        (self.examples > 0).then(|| self.correct as f64 / self.examples as f64)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A named collection of metrics updated together.
#[derive(Debug, Default)]
pub struct TrainMetrics {
    metrics: Vec<Box<dyn Metric>>,
}

impl TrainMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean loss and accuracy.
    pub fn standard() -> Self {
        Self::new().with(MeanLoss::default()).with(Accuracy::default())
    }

    #[must_use]
    pub fn with(mut self, metric: impl Metric + 'static) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    pub fn update(&mut self, step: &StepOutput) {
        for metric in &mut self.metrics {
            metric.update(step);
        }
    }

    pub fn reset(&mut self) {
        for metric in &mut self.metrics {
            metric.reset();
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|m| m.name() == name)
            .and_then(|m| m.result())
    }

    /// `(name, value)` for every metric that has a value.
    pub fn results(&self) -> Vec<(String, f64)> {
        self.metrics
            .iter()
            .filter_map(|m| m.result().map(|v| (m.name().to_string(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn step(loss: f64, correct: Option<usize>, examples: usize) -> StepOutput {
        StepOutput {
            step: 0,
            loss,
            correct,
            examples,
            learning_rate: 0.1,
        }
    }

    #[test]
    fn test_mean_loss_weights_by_examples() {
        let mut m = MeanLoss::default();
        assert_eq!(m.result(), None);
        m.update(&step(1.0, None, 4));
        m.update(&step(4.0, None, 2));
        assert_relative_eq!(m.result().unwrap(), 2.0);
        m.reset();
        assert_eq!(m.result(), None);
    }

    #[test]
    fn test_accuracy_skips_unscored_steps() {
        let mut m = Accuracy::default();
        m.update(&step(0.0, Some(3), 4));
        m.update(&step(0.0, None, 100));
        m.update(&step(0.0, Some(1), 4));
        assert_relative_eq!(m.result().unwrap(), 0.5);
    }

    #[test]
    fn test_collection() {
        let mut metrics = TrainMetrics::standard();
        metrics.update(&step(2.0, None, 2));
        assert_eq!(metrics.results(), vec![("loss".to_string(), 2.0)]);
        assert_eq!(metrics.get("accuracy"), None);

        metrics.reset();
        assert!(metrics.results().is_empty());
    }
}
