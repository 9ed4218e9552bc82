//! Mirrored training demo.
//!
//! Trains a small MLP classifier on a synthetic two-class dataset, split
//! across in-process replicas.
//!
//! Usage:
//!   mirrored-train [OPTIONS]
//!
//! Examples:
//!   # Four replicas, five epochs
//!   mirrored-train --replicas 4 --epochs 5
//!
//!   # Settings from a file, checkpointing into ./ckpts
//!   mirrored-train --config train.toml --checkpoint-dir ./ckpts

use clap::Parser;
use mirrored_rs::data::Example;
use mirrored_rs::distributed::WorkerContext;
use mirrored_rs::loss::SparseCategoricalCrossEntropy;
use mirrored_rs::nn::Mlp;
use mirrored_rs::optim::OptimizerConfig;
use mirrored_rs::train::{TrainMetrics, Trainer, TrainingConfig};
use mirrored_rs::{Result, TrainError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mirrored-train")]
#[command(about = "Synchronous mirrored data-parallel training on CPU replicas")]
#[command(version)]
struct Args {
    /// TOML or JSON training config
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of replicas (overrides the config)
    #[arg(short = 'r', long)]
    replicas: Option<usize>,

    /// Number of epochs (overrides the config)
    #[arg(short = 'e', long)]
    epochs: Option<usize>,

    /// Directory for checkpoints (overrides the config)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Examples in the synthetic training set
    #[arg(long, default_value = "512")]
    examples: usize,

    /// Resume from the newest checkpoint in the checkpoint directory
    #[arg(long)]
    resume: bool,
}

/// Two Gaussian blobs, class 0 around (-1, -1) and class 1 around (1, 1).
fn two_blobs(n: usize, seed: u64) -> Vec<Example<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let class = (i % 2) as f32;
            let center = 2.0 * class - 1.0;
            let x = center + rng.random_range(-0.9..0.9);
            let y = center + rng.random_range(-0.9..0.9);
            Example::new(vec![x, y], vec![class])
        })
        .collect()
}

fn load_config(args: &Args) -> Result<TrainingConfig> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => TrainingConfig::new(5)
            .with_batch_size(16)
            .with_optimizer(OptimizerConfig::sgd(0.1).with_momentum(0.9)),
    };
    if let Some(replicas) = args.replicas {
        config.num_replicas = replicas;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let worker = WorkerContext::from_env("MIRRORED_CLUSTER")?;
    if worker.num_workers > 1 {
        return Err(TrainError::invalid_config(
            "this demo runs a single worker; unset MIRRORED_CLUSTER",
        ));
    }

    let model = Mlp::new(&[2, 16, 2])?;
    let params = model.init_parameters::<f32>(config.seed)?;
    let mut trainer = Trainer::new(model, params, SparseCategoricalCrossEntropy, config)?;
    if args.resume && trainer.restore_latest()? {
        info!(epoch = trainer.epoch(), step = trainer.step(), "resuming");
    }

    let train = trainer.data_loader(two_blobs(args.examples, trainer.config().seed));
    let summaries = trainer.fit(&train, &mut TrainMetrics::standard())?;
    for s in &summaries {
        println!(
            "epoch {:>3}  steps {:>4}  loss {:.4}  accuracy {:.3}  lr {:.5}  {:.2}s",
            s.epoch,
            s.steps,
            s.metric("loss").unwrap_or(f64::NAN),
            s.metric("accuracy").unwrap_or(f64::NAN),
            s.learning_rate,
            s.duration_secs,
        );
    }

    let held_out = trainer.data_loader(two_blobs(args.examples / 4, trainer.config().seed + 1));
    let eval = trainer.evaluate(&held_out)?;
    println!(
        "held-out loss {:.4}  accuracy {:.3}  ({} examples, {} replicas)",
        eval.loss,
        eval.accuracy.unwrap_or(f64::NAN),
        eval.examples,
        trainer.strategy().num_replicas(),
    );
    Ok(())
}
