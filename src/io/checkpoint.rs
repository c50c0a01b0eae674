//! Checkpoint weight files: resolution, sharded reading and writing

use crate::nn::state::{total_size, StateDict, StateTensor};
use crate::{Error, Result};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const WEIGHTS_NAME: &str = "pytorch_model.bin";
pub const WEIGHTS_INDEX_NAME: &str = "pytorch_model.bin.index.json";
pub const SAFE_WEIGHTS_NAME: &str = "model.safetensors";
pub const SAFE_WEIGHTS_INDEX_NAME: &str = "model.safetensors.index.json";

/// Shard threshold used when saving
pub const DEFAULT_MAX_SHARD_SIZE: usize = 10 * 1024 * 1024 * 1024;

/// Weight files in the order they are looked for
const RESOLUTION_ORDER: [&str; 4] = [
    WEIGHTS_NAME,
    WEIGHTS_INDEX_NAME,
    SAFE_WEIGHTS_NAME,
    SAFE_WEIGHTS_INDEX_NAME,
];

/// Located weights of one checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointFiles {
    Single(PathBuf),
    Sharded { index: PathBuf, shards: Vec<PathBuf> },
}

impl CheckpointFiles {
    pub fn is_sharded(&self) -> bool {
        matches!(self, CheckpointFiles::Sharded { .. })
    }

    pub fn paths(&self) -> Vec<&Path> {
        match self {
            CheckpointFiles::Single(p) => vec![p.as_path()],
            CheckpointFiles::Sharded { shards, .. } => {
                shards.iter().map(PathBuf::as_path).collect()
            }
        }
    }
}

/// `model.safetensors.index.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardIndex {
    pub metadata: ShardMetadata,
    pub weight_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub total_size: usize,
}

impl ShardIndex {
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Distinct shard file names, in first-use order
    pub fn shard_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for file in self.weight_map.values() {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
        files
    }
}

fn is_pickle(name: &str) -> bool {
    name.starts_with("pytorch_model.bin")
}

/// Find the weights of a checkpoint directory.
///
/// A directory holding only pickle weights has the file but not a variant
/// this crate can read, which is reported apart from a missing file.
pub fn resolve_checkpoint(dir: &Path) -> Result<CheckpointFiles> {
    let found: Vec<&str> = RESOLUTION_ORDER
        .iter()
        .copied()
        .filter(|name| dir.join(name).is_file())
        .collect();
    let Some(first) = found.first() else {
        return Err(Error::CheckpointNotFound {
            path: dir.display().to_string(),
            file: RESOLUTION_ORDER.join(", "),
        });
    };
    let Some(readable) = found.iter().find(|name| !is_pickle(name)) else {
        return Err(Error::CheckpointVariantMissing {
            path: dir.display().to_string(),
            found: first.to_string(),
            expected: format!("{SAFE_WEIGHTS_NAME} or {SAFE_WEIGHTS_INDEX_NAME}"),
        });
    };
    if is_pickle(first) {
        tracing::debug!(skipped = %first, using = %readable, "pickle weights ignored");
    }

    if *readable == SAFE_WEIGHTS_INDEX_NAME {
        let index_path = dir.join(readable);
        let index = ShardIndex::from_file(&index_path)?;
        let shards = index.shard_files().into_iter().map(|f| dir.join(f)).collect();
        Ok(CheckpointFiles::Sharded {
            index: index_path,
            shards,
        })
    } else {
        Ok(CheckpointFiles::Single(dir.join(readable)))
    }
}

fn read_safetensors(path: &Path, out: &mut StateDict) -> Result<()> {
    let bytes = std::fs::read(path).map_err(|_| Error::CheckpointNotFound {
        path: path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        file: path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default(),
    })?;
    let tensors = SafeTensors::deserialize(&bytes)?;
    for (name, view) in tensors.tensors() {
        let tensor = StateTensor::from_view(&name, &view)?;
        out.insert(name, tensor);
    }
    Ok(())
}

/// Read every tensor of a single or sharded checkpoint
pub fn read_state_dict(files: &CheckpointFiles) -> Result<StateDict> {
    let mut dict = StateDict::new();
    for path in files.paths() {
        read_safetensors(path, &mut dict)?;
    }
    Ok(dict)
}

fn write_safetensors(path: &Path, dict: &StateDict, keys: &[&String]) -> Result<()> {
    let buffers: Vec<(&str, Vec<u8>, &StateTensor)> = keys
        .iter()
        .filter_map(|k| dict.get(*k).map(|t| (k.as_str(), t.to_le_bytes(), t)))
        .collect();
    let views = buffers
        .iter()
        .map(|(name, bytes, t)| {
            TensorView::new(t.safetensors_dtype(), t.shape.clone(), bytes).map(|v| (*name, v))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut metadata = std::collections::HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    let serialized = safetensors::serialize(views, &Some(metadata))?;
    std::fs::write(path, serialized)?;
    Ok(())
}

/// Split keys, in order, into shards no larger than `max_shard_size`; a
/// single oversized tensor gets a shard of its own
fn plan_shards(dict: &StateDict, max_shard_size: usize) -> Vec<Vec<&String>> {
    let mut shards: Vec<Vec<&String>> = vec![Vec::new()];
    let mut current = 0usize;
    for (key, tensor) in dict {
        let size = tensor.nbytes();
        let last_len = shards.last().map_or(0, Vec::len);
        if last_len > 0 && current + size > max_shard_size {
            shards.push(Vec::new());
            current = 0;
        }
        if let Some(last) = shards.last_mut() {
            last.push(key);
        }
        current += size;
    }
    shards
}

/// Write a state dict as `model.safetensors`, or as numbered shards plus an
/// index when it exceeds `max_shard_size`. Returns the written weight files.
pub fn write_state_dict(
    dir: &Path,
    dict: &StateDict,
    max_shard_size: usize,
) -> Result<Vec<PathBuf>> {
    let shards = plan_shards(dict, max_shard_size);
    if shards.len() == 1 {
        let path = dir.join(SAFE_WEIGHTS_NAME);
        write_safetensors(&path, dict, &shards[0])?;
        return Ok(vec![path]);
    }

    let total = shards.len();
    let mut index = ShardIndex {
        metadata: ShardMetadata {
            total_size: total_size(dict),
        },
        weight_map: BTreeMap::new(),
    };
    let mut written = Vec::with_capacity(total);
    for (i, keys) in shards.iter().enumerate() {
        let file = format!("model-{:05}-of-{:05}.safetensors", i + 1, total);
        let path = dir.join(&file);
        write_safetensors(&path, dict, keys)?;
        for key in keys {
            index.weight_map.insert((*key).clone(), file.clone());
        }
        written.push(path);
    }
    std::fs::write(
        dir.join(SAFE_WEIGHTS_INDEX_NAME),
        serde_json::to_string_pretty(&index)?,
    )?;
    tracing::info!(
        shards = total,
        total_size = index.metadata.total_size,
        "checkpoint sharded"
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamDtype;
    use tempfile::TempDir;

    fn dict() -> StateDict {
        let mut d = StateDict::new();
        d.insert(
            "a.weight".into(),
            StateTensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0], ParamDtype::F32),
        );
        d.insert("b.qweight".into(), StateTensor::u8(vec![1, 4], vec![1, 2, 3, 4]));
        d.insert(
            "b.scales".into(),
            StateTensor::from_f32(vec![1, 2], &[0.5, 0.25], ParamDtype::F16),
        );
        d
    }

    #[test]
    fn test_single_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let written = write_state_dict(dir.path(), &dict(), DEFAULT_MAX_SHARD_SIZE).unwrap();
        assert_eq!(written, vec![dir.path().join(SAFE_WEIGHTS_NAME)]);
        let files = resolve_checkpoint(dir.path()).unwrap();
        assert!(!files.is_sharded());
        assert_eq!(read_state_dict(&files).unwrap(), dict());
    }

    #[test]
    fn test_sharded_round_trip_writes_index() {
        let dir = TempDir::new().unwrap();
        let written = write_state_dict(dir.path(), &dict(), 7).unwrap();
        assert_eq!(written.len(), 3);
        let index = ShardIndex::from_file(&dir.path().join(SAFE_WEIGHTS_INDEX_NAME)).unwrap();
        assert_eq!(index.metadata.total_size, 16 + 4 + 4);
        assert_eq!(index.weight_map["a.weight"], "model-00001-of-00003.safetensors");

        let files = resolve_checkpoint(dir.path()).unwrap();
        assert!(files.is_sharded());
        assert_eq!(read_state_dict(&files).unwrap(), dict());
    }

    #[test]
    fn test_empty_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = resolve_checkpoint(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound { .. }));
    }

    #[test]
    fn test_pickle_only_is_variant_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(WEIGHTS_NAME), b"not a safetensors file").unwrap();
        let err = resolve_checkpoint(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CheckpointVariantMissing { .. }));
    }

    #[test]
    fn test_pickle_next_to_safetensors_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_state_dict(dir.path(), &dict(), DEFAULT_MAX_SHARD_SIZE).unwrap();
        std::fs::write(dir.path().join(WEIGHTS_NAME), b"pickle").unwrap();
        assert_eq!(
            resolve_checkpoint(dir.path()).unwrap(),
            CheckpointFiles::Single(dir.path().join(SAFE_WEIGHTS_NAME))
        );
    }
}
