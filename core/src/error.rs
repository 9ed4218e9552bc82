//! Error types for mirrored training.

use crate::tensor::TensorError;
use thiserror::Error;

/// Errors that can occur while configuring or running mirrored training.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Invalid configuration, detected before any batch is processed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Replicas disagree on parameter shapes or ordering.
    #[error("replicas diverged: {0}")]
    ReplicaDivergence(String),

    /// A tensor operation failed (shape mismatch, bad index, ...).
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// NaN or infinity in a replica's loss or gradients.
    #[error("non-finite loss or gradient at step {step} on replica {replica}")]
    NonFinite { step: u64, replica: usize },

    /// A single replica failed during its local step.
    #[error("replica {replica} failed: {source}")]
    ReplicaFailed {
        replica: usize,
        #[source]
        source: Box<TrainError>,
    },

    /// A healthy replica gave up the step because a peer failed.
    #[error("replica {replica} aborted the step because a peer failed")]
    Aborted { replica: usize },

    /// Collective communication broke down (peer vanished, length mismatch).
    #[error("collective communication failed: {0}")]
    Collective(String),

    /// A replica thread panicked.
    #[error("replica {0} panicked")]
    ReplicaPanicked(usize),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Config or metadata could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TrainError {
    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates a replica divergence error.
    #[must_use]
    pub fn divergence(reason: impl Into<String>) -> Self {
        Self::ReplicaDivergence(reason.into())
    }

    /// Creates a collective error.
    #[must_use]
    pub fn collective(reason: impl Into<String>) -> Self {
        Self::Collective(reason.into())
    }

    /// Creates a checkpoint error.
    #[must_use]
    pub fn checkpoint(reason: impl Into<String>) -> Self {
        Self::Checkpoint(reason.into())
    }

    /// Wraps an error raised inside replica `replica`'s local step.
    #[must_use]
    pub fn replica_failed(replica: usize, source: TrainError) -> Self {
        Self::ReplicaFailed {
            replica,
            source: Box::new(source),
        }
    }

    /// Whether this is the echo of another replica's failure rather than a root cause.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TrainError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for TrainError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Self::Checkpoint(err.to_string())
    }
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;
