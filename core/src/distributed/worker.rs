use crate::error::{Result, TrainError};
use serde::Deserialize;

/// Identity of this process among the workers of a multi-worker job.
///
/// Each worker trains on its own [`ShardedDataset`](crate::data::ShardedDataset)
/// and runs its own replicas; the worker index picks the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    pub worker_index: usize,
    pub num_workers: usize,
}

#[derive(Deserialize)]
struct ClusterSpec {
    cluster: Cluster,
    task: Task,
}

#[derive(Deserialize)]
struct Cluster {
    worker: Vec<String>,
}

#[derive(Deserialize)]
struct Task {
    #[serde(rename = "type")]
    kind: String,
    index: usize,
}

impl WorkerContext {
    pub fn new(worker_index: usize, num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(TrainError::invalid_config("num_workers must be positive"));
        }
        if worker_index >= num_workers {
            return Err(TrainError::invalid_config(format!(
                "worker_index {worker_index} out of range for {num_workers} workers"
            )));
        }
        Ok(Self {
            worker_index,
            num_workers,
        })
    }

    /// The only worker of a single-process job.
    pub const fn single() -> Self {
        Self {
            worker_index: 0,
            num_workers: 1,
        }
    }

    /// Parses a cluster description:
    ///
    /// ```
    /// use mirrored_rs::distributed::WorkerContext;
    ///
    /// let ctx = WorkerContext::from_json(
    ///     r#"{"cluster":{"worker":["a:2222","b:2222"]},"task":{"type":"worker","index":1}}"#,
    /// ).unwrap();
    /// assert_eq!(ctx.worker_index, 1);
    /// assert_eq!(ctx.num_workers, 2);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: ClusterSpec = serde_json::from_str(json)?;
        if spec.task.kind != "worker" {
            return Err(TrainError::invalid_config(format!(
                "unsupported task type `{}`",
                spec.task.kind
            )));
        }
        Self::new(spec.task.index, spec.cluster.worker.len())
    }

    /// Reads a cluster description from environment variable `var`.
    /// An unset variable means a single-worker job.
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(json) => Self::from_json(&json),
            Err(std::env::VarError::NotPresent) => Ok(Self::single()),
            Err(e) => Err(TrainError::invalid_config(format!("{var}: {e}"))),
        }
    }

    pub const fn is_chief(&self) -> bool {
        self.worker_index == 0
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(WorkerContext::new(0, 1).is_ok());
        assert!(matches!(
            WorkerContext::new(0, 0),
            Err(TrainError::InvalidConfig(_))
        ));
        assert!(matches!(
            WorkerContext::new(3, 3),
            Err(TrainError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"cluster":{"worker":["h0:1","h1:1","h2:1"]},"task":{"type":"worker","index":2}}"#;
        let ctx = WorkerContext::from_json(json).unwrap();
        assert_eq!(ctx, WorkerContext::new(2, 3).unwrap());
        assert!(!ctx.is_chief());
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        let ps = r#"{"cluster":{"worker":["h0:1"]},"task":{"type":"ps","index":0}}"#;
        assert!(matches!(
            WorkerContext::from_json(ps),
            Err(TrainError::InvalidConfig(_))
        ));

        let out_of_range = r#"{"cluster":{"worker":["h0:1"]},"task":{"type":"worker","index":1}}"#;
        assert!(WorkerContext::from_json(out_of_range).is_err());

        assert!(matches!(
            WorkerContext::from_json("{"),
            Err(TrainError::Serialization(_))
        ));
    }

    #[test]
    fn test_from_env_unset_is_single() {
        let ctx = WorkerContext::from_env("MIRRORED_RS_TEST_UNSET_CLUSTER").unwrap();
        assert_eq!(ctx, WorkerContext::single());
    }
}
