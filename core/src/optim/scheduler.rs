//! Learning Rate Schedulers.
//!
//! Schedules are indexed by a zero-based counter. The trainer advances it
//! once per epoch and pushes the result into every replica's optimizer, so
//! all replicas see the same rate for the same epoch.

use std::f64::consts::PI;
use std::fmt::Debug;

/// A trait for learning rate schedulers.
pub trait LRScheduler: Debug + Send + Sync {
    /// Calculates the learning rate for a given step.
    fn get_lr(&self, step: usize) -> f64;
}

/// Constant learning rate.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLr {
    pub lr: f64,
}

impl LRScheduler for ConstantLr {
    fn get_lr(&self, _step: usize) -> f64 {
        self.lr
    }
}

/// Multiplies the rate by `factor` every `step_size` steps.
#[derive(Debug, Clone, Copy)]
pub struct StepDecay {
    pub base_lr: f64,
    pub factor: f64,
    pub step_size: usize,
}

impl LRScheduler for StepDecay {
    fn get_lr(&self, step: usize) -> f64 {
        let decays = step / self.step_size.max(1);
        self.base_lr * self.factor.powi(i32::try_from(decays).unwrap_or(i32::MAX))
    }
}

/// Linear Warmup with optional Linear Decay.
///
/// Increases LR linearly to `max_lr` over the first `warmup_steps` steps
/// (the first step already runs at `max_lr / warmup_steps`).
/// Then decays linearly to `min_lr` over `total_steps - warmup_steps`.
#[derive(Debug, Clone, Copy)]
pub struct LinearWarmup {
    pub max_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LinearWarmup {
    pub fn new(max_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            max_lr,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LRScheduler for LinearWarmup {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            self.max_lr * ((step + 1) as f64 / self.warmup_steps as f64)
        } else if step < self.total_steps {
            let decay_steps = self.total_steps - self.warmup_steps;
            let current_decay_step = step - self.warmup_steps;
            let progress = current_decay_step as f64 / decay_steps as f64;
            self.max_lr - (self.max_lr - self.min_lr) * progress
        } else {
            self.min_lr
        }
    }
}

/// Cosine Decay with Warmup.
///
/// Same warmup as [`LinearWarmup`], then follows a half cosine to `min_lr`.
#[derive(Debug, Clone, Copy)]
pub struct CosineDecay {
    pub max_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineDecay {
    pub fn new(max_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            max_lr,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LRScheduler for CosineDecay {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            self.max_lr * ((step + 1) as f64 / self.warmup_steps as f64)
        } else if step < self.total_steps {
            let decay_steps = self.total_steps - self.warmup_steps;
            let current_decay_step = step - self.warmup_steps;
            let progress = current_decay_step as f64 / decay_steps as f64;
            let cosine_decay = 0.5 * (1.0 + (progress * PI).cos());
            self.min_lr + (self.max_lr - self.min_lr) * cosine_decay
        } else {
            self.min_lr
        }
    }
}
