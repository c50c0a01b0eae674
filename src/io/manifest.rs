//! Checkpoint key manifest (`all_checkpoint_keys.json`)

use crate::nn::state::StateDict;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_NAME: &str = "all_checkpoint_keys.json";

/// Ordered list of every key of a saved state dict
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub all_checkpoint_keys: Vec<String>,
}

impl CheckpointManifest {
    pub fn from_state_dict(dict: &StateDict) -> Self {
        Self {
            all_checkpoint_keys: dict.keys().cloned().collect(),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(MANIFEST_NAME), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read the manifest of `dir`; absent manifests are empty
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_NAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.all_checkpoint_keys.iter().any(|k| k == key)
    }

    /// Prefixes of keys ending in `.{param}`
    pub fn layers_with(&self, param: &str) -> Vec<&str> {
        let suffix = format!(".{param}");
        self.all_checkpoint_keys
            .iter()
            .filter_map(|k| k.strip_suffix(suffix.as_str()))
            .collect()
    }
}
