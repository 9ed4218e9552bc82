//! # mirrored-rs
//!
//! `mirrored-rs` is a pure Rust implementation of synchronous mirrored
//! data-parallel training: every replica holds the full model, each global
//! batch is split across replicas, and gradients are summed with a ring
//! all-reduce before every replica applies the same update.
//!
//! Like its tensors, it currently runs on **CPU only**; replicas are threads.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Core N-dimensional tensor implementation.
//! - [`autograd`]: Reverse-mode differentiation.
//! - [`nn`]: Layers and parameter containers.
//! - [`loss`]: Per-example losses and explicit reductions.
//! - [`optim`]: Optimizers and learning rate schedules.
//! - [`data`]: Datasets, samplers, loaders and resumable batch streams.
//! - [`distributed`]: Replicas, collectives and the mirrored strategy.
//! - [`train`]: Configuration, metrics and the epoch/step driver.
//! - [`checkpoint`]: Atomic `safetensors` checkpoints.
//!
//! ## Example
//!
//! ```rust
//! use mirrored_rs::data::Example;
//! use mirrored_rs::loss::MeanSquaredError;
//! use mirrored_rs::nn::Mlp;
//! use mirrored_rs::train::{TrainMetrics, Trainer, TrainingConfig};
//!
//! let model = Mlp::new(&[1, 4, 1]).unwrap();
//! let params = model.init_parameters::<f32>(0).unwrap();
//! let config = TrainingConfig::new(2).with_replicas(2).with_batch_size(2);
//! let mut trainer = Trainer::new(model, params, MeanSquaredError, config).unwrap();
//!
//! let data: Vec<Example<f32>> = (0..8)
//!     .map(|i| Example::new(vec![i as f32 / 8.0], vec![i as f32 / 4.0]))
//!     .collect();
//! let loader = trainer.data_loader(data);
//! let summaries = trainer.fit(&loader, &mut TrainMetrics::standard()).unwrap();
//! assert_eq!(summaries.len(), 2);
//! assert!(trainer.replicas_in_sync());
//! ```

pub mod autograd;
pub mod checkpoint;
pub mod data;
pub mod distributed;
pub mod error;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;

pub use autograd::Variable;
pub use error::{Result, TrainError};
pub use tensor::{Tensor, TensorElem, TensorError};
