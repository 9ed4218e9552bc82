//! # Mirrored Data Parallelism
//!
//! Every replica holds a full copy of the model. A global batch is split into
//! contiguous sub-batches, each replica computes a loss scaled by the
//! *global* batch size, and the gradients are summed with a ring all-reduce.
//! Because each partial loss is already divided by the global batch size,
//! the sum is exactly the gradient of the full-batch mean, and every replica
//! applies the same update.
//!
//! ## Module Contents
//!
//! *   [`MirroredStrategy`]: replica count and batch splitting.
//! *   [`CollectiveBackend`]: the communication interface, with
//!     [`CpuBackend`] implementing ring all-reduce over channels.
//! *   [`GradientAggregator`]: step report exchange plus gradient reduction.
//! *   [`Replica`]: one model copy with its own optimizer.
//! *   [`WorkerContext`]: which data shard this process trains on.

pub mod aggregator;
pub mod backend;
pub mod cpu_backend;
pub mod replica;
pub mod strategy;
pub mod worker;

pub use aggregator::{GlobalReport, GradientAggregator, GradientBucket, LocalReport};
pub use backend::{CollectiveBackend, ReduceOp};
pub use cpu_backend::CpuBackend;
pub use replica::{LocalStep, ReducedStep, Replica};
pub use strategy::{MirroredStrategy, MirroredStrategyBuilder};
pub use worker::WorkerContext;
