//! Checkpointing and Serialization.
//!
//! A [`Checkpoint`] is stored as one `safetensors` file: parameters under
//! `param/<name>`, optimizer buffers under `optim/<slot>`, and the training
//! counters in the file's string metadata. Files are written to a temporary
//! sibling and renamed into place, so a reader never sees a partial file.

use crate::data::StreamPosition;
use crate::error::{Result, TrainError};
use crate::nn::ParameterSet;
use crate::optim::OptimizerState;
use crate::tensor::{Tensor, TensorElem};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PARAM_PREFIX: &str = "param/";
const OPTIM_PREFIX: &str = "optim/";
const FORMAT: &str = "mirrored-rs/1";

/// Element types that can be written to a checkpoint.
pub trait CheckpointElem: TensorElem {
    const DTYPE: Dtype;

    fn extend_le_bytes(values: &[Self], out: &mut Vec<u8>);

    fn from_le_bytes(bytes: &[u8]) -> Option<Vec<Self>>;
}

macro_rules! impl_checkpoint_elem {
    ($ty:ty, $dtype:expr) => {
        impl CheckpointElem for $ty {
            const DTYPE: Dtype = $dtype;

            fn extend_le_bytes(values: &[Self], out: &mut Vec<u8>) {
                out.reserve(std::mem::size_of_val(values));
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }

            fn from_le_bytes(bytes: &[u8]) -> Option<Vec<Self>> {
                const WIDTH: usize = std::mem::size_of::<$ty>();
                if bytes.len() % WIDTH != 0 {
                    return None;
                }
                bytes
                    .chunks_exact(WIDTH)
                    .map(|chunk| chunk.try_into().ok().map(<$ty>::from_le_bytes))
                    .collect()
            }
        }
    };
}

impl_checkpoint_elem!(f32, Dtype::F32);
impl_checkpoint_elem!(f64, Dtype::F64);

/// Everything needed to continue training exactly where it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint<T: TensorElem> {
    pub params: ParameterSet<T>,
    pub optimizer: Option<OptimizerState<T>>,
    /// Completed optimizer steps.
    pub step: u64,
    /// Completed epochs.
    pub epoch: u64,
    /// Data stream cursor at save time.
    pub position: Option<StreamPosition>,
}

impl<T: CheckpointElem> Checkpoint<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for (name, tensor) in self.params.iter() {
            let mut bytes = Vec::new();
            T::extend_le_bytes(tensor.data(), &mut bytes);
            entries.push((format!("{PARAM_PREFIX}{name}"), tensor.shape().to_vec(), bytes));
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), FORMAT.to_string());
        metadata.insert("step".to_string(), self.step.to_string());
        metadata.insert("epoch".to_string(), self.epoch.to_string());
        metadata.insert("param_order".to_string(), serde_json::to_string(self.params.names())?);
        if let Some(position) = &self.position {
            metadata.insert("position".to_string(), serde_json::to_string(position)?);
        }
        if let Some(state) = &self.optimizer {
            for (slot, values) in &state.buffers {
                let mut bytes = Vec::new();
                T::extend_le_bytes(values, &mut bytes);
                entries.push((format!("{OPTIM_PREFIX}{slot}"), vec![values.len()], bytes));
            }
            metadata.insert("optim_counters".to_string(), serde_json::to_string(&state.counters)?);
        }

        let mut views = Vec::with_capacity(entries.len());
        for (name, shape, bytes) in &entries {
            views.push((name.as_str(), TensorView::new(T::DTYPE, shape.clone(), bytes)?));
        }
        Ok(safetensors::serialize(views, Some(metadata))?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| TrainError::checkpoint("missing metadata"))?;
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| TrainError::checkpoint(format!("missing metadata field `{key}`")))
        };
        if field("format")? != FORMAT {
            return Err(TrainError::checkpoint(format!("unsupported format `{}`", field("format")?)));
        }
        let parse_u64 = |key: &str| -> Result<u64> {
            field(key)?
                .parse()
                .map_err(|e| TrainError::checkpoint(format!("bad `{key}`: {e}")))
        };
        let step = parse_u64("step")?;
        let epoch = parse_u64("epoch")?;
        let order: Vec<String> = serde_json::from_str(field("param_order")?)?;
        let position = metadata
            .get("position")
            .map(|p| serde_json::from_str(p))
            .transpose()?;

        let tensors = SafeTensors::deserialize(bytes)?;
        let read = |name: &str| -> Result<(Vec<usize>, Vec<T>)> {
            let view = tensors.tensor(name)?;
            if view.dtype() != T::DTYPE {
                return Err(TrainError::checkpoint(format!(
                    "`{name}` is {:?}, expected {:?}",
                    view.dtype(),
                    T::DTYPE
                )));
            }
            let values = T::from_le_bytes(view.data())
                .ok_or_else(|| TrainError::checkpoint(format!("`{name}` has a truncated buffer")))?;
            Ok((view.shape().to_vec(), values))
        };

        let mut params = ParameterSet::new();
        for name in order {
            let (shape, values) = read(&format!("{PARAM_PREFIX}{name}"))?;
            let [rows, cols] = shape[..] else {
                return Err(TrainError::checkpoint(format!("`{name}` is not a matrix")));
            };
            params.push(name, Tensor::new(values, [rows, cols])?)?;
        }

        let optimizer = match metadata.get("optim_counters") {
            None => None,
            Some(counters) => {
                let mut state = OptimizerState {
                    counters: serde_json::from_str::<BTreeMap<String, u64>>(counters)?,
                    ..OptimizerState::default()
                };
                for name in tensors.names() {
                    if let Some(slot) = name.strip_prefix(OPTIM_PREFIX) {
                        let (_, values) = read(name)?;
                        state.buffers.insert(slot.to_string(), values);
                    }
                }
                Some(state)
            }
        };

        Ok(Self {
            params,
            optimizer,
            step,
            epoch,
            position,
        })
    }
}

/// Writes `checkpoint` to `path`, replacing any existing file atomically.
pub fn save_checkpoint<T: CheckpointElem>(path: impl AsRef<Path>, checkpoint: &Checkpoint<T>) -> Result<()> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TrainError::checkpoint(format!("{} is not a file path", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let bytes = checkpoint.to_bytes()?;
    let written = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(err) = written {
        // the write error is reported, not a failed cleanup
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }

    debug!(path = %path.display(), bytes = bytes.len(), "wrote checkpoint");
    Ok(())
}

/// Reads a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint<T: CheckpointElem>(path: impl AsRef<Path>) -> Result<Checkpoint<T>> {
    let bytes = fs::read(path)?;
    Checkpoint::from_bytes(&bytes)
}

/// Somewhere checkpoints can be saved to and loaded from.
pub trait CheckpointStore<T: CheckpointElem> {
    type Handle;

    fn save(&mut self, step: u64, checkpoint: &Checkpoint<T>) -> Result<Self::Handle>;

    fn load(&self, handle: &Self::Handle) -> Result<Checkpoint<T>>;
}

/// Keeps `ckpt-<step>.safetensors` files in one directory and prunes old ones.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    /// `max_to_keep == 0` keeps every checkpoint.
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_to_keep })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("ckpt-{step}.safetensors"))
    }

    /// Saved checkpoints ordered by step.
    pub fn checkpoints(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("ckpt-"))
                .and_then(|n| n.strip_suffix(".safetensors"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(step) = step {
                found.push((step, path));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.checkpoints()?.pop().map(|(_, path)| path))
    }

    fn prune(&self) -> Result<()> {
        if self.max_to_keep == 0 {
            return Ok(());
        }
        let all = self.checkpoints()?;
        let excess = all.len().saturating_sub(self.max_to_keep);
        for (step, path) in &all[..excess] {
            fs::remove_file(path)?;
            debug!(step, "pruned checkpoint");
        }
        Ok(())
    }
}

impl<T: CheckpointElem> CheckpointStore<T> for CheckpointManager {
    type Handle = PathBuf;

    fn save(&mut self, step: u64, checkpoint: &Checkpoint<T>) -> Result<PathBuf> {
        let path = self.path_for(step);
        save_checkpoint(&path, checkpoint)?;
        self.prune()?;
        info!(step, path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    fn load(&self, handle: &PathBuf) -> Result<Checkpoint<T>> {
        load_checkpoint(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint<f32> {
        let mut params = ParameterSet::new();
        params.push("dense_1.weight", Tensor::new(vec![1.0, -2.0, 3.5, 0.25], [2, 2]).unwrap()).unwrap();
        params.push("dense_0.bias", Tensor::new(vec![0.5, 0.0], [1, 2]).unwrap()).unwrap();

        let mut state = OptimizerState::default();
        state.buffers.insert("m.0".to_string(), vec![0.1, 0.2, 0.3, 0.4]);
        state.counters.insert("step.0".to_string(), 4);

        Checkpoint {
            params,
            optimizer: Some(state),
            step: 12,
            epoch: 3,
            position: Some(StreamPosition {
                epoch: 3,
                offset: 4,
                batches: 12,
            }),
        }
    }

    #[test]
    fn test_bytes_roundtrip_keeps_parameter_order() {
        let ckpt = sample();
        let restored = Checkpoint::<f32>::from_bytes(&ckpt.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, ckpt);
        assert_eq!(restored.params.names(), &["dense_1.weight", "dense_0.bias"]);
    }

    #[test]
    fn test_without_optimizer() {
        let mut ckpt = sample();
        ckpt.optimizer = None;
        ckpt.position = None;
        let restored = Checkpoint::<f32>::from_bytes(&ckpt.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, ckpt);
    }

    #[test]
    fn test_dtype_mismatch() {
        let bytes = sample().to_bytes().unwrap();
        assert!(matches!(
            Checkpoint::<f64>::from_bytes(&bytes),
            Err(TrainError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let mut ckpt = sample();
        save_checkpoint(&path, &ckpt).unwrap();
        ckpt.step = 13;
        save_checkpoint(&path, &ckpt).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1, "temporary file left behind: {names:?}");
        assert_eq!(load_checkpoint::<f32>(&path).unwrap().step, 13);
    }

    #[test]
    fn test_failed_rename_removes_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        // a non-empty directory cannot be replaced by a file
        let path = dir.path().join("model.safetensors");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        assert!(matches!(save_checkpoint(&path, &sample()), Err(TrainError::Io(_))));
        assert!(!dir.path().join(".model.safetensors.tmp").exists());
        assert!(path.join("keep").exists());
    }

    #[test]
    fn test_manager_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path().join("ckpts"), 2).unwrap();
        let mut ckpt = sample();
        for step in [5, 10, 15] {
            ckpt.step = step;
            manager.save(step, &ckpt).unwrap();
        }

        let steps: Vec<u64> = manager.checkpoints().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![10, 15]);

        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest, manager.path_for(15));
        let loaded: Checkpoint<f32> = manager.load(&latest).unwrap();
        assert_eq!(loaded.step, 15);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        fs::write(&path, b"not a checkpoint").unwrap();
        assert!(load_checkpoint::<f32>(&path).is_err());
    }
}
