//! Checkpoint resolution from the HuggingFace Hub
//!
//! A model argument naming a local directory is used as-is. Anything else is
//! taken as an `org/name` repository id: `config.json`, the sidecar JSON
//! files, the tokenizer files and the safetensors weights (single or sharded) are fetched into the
//! hub cache and the snapshot directory is returned.

use crate::calibration::TOKENIZER_FILES;
use crate::io::{
    ShardIndex, SAFE_WEIGHTS_INDEX_NAME, SAFE_WEIGHTS_NAME, WEIGHTS_INDEX_NAME, WEIGHTS_NAME,
};
use crate::nn::{CONFIG_NAME, GENERATION_CONFIG_NAME};
use crate::{Error, Result};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};

/// Small files fetched when present; none of them is required
const OPTIONAL_FILES: [&str; 3] = [
    GENERATION_CONFIG_NAME,
    crate::config::QUANT_CONFIG_NAME,
    crate::io::MANIFEST_NAME,
];

/// Fetches checkpoints into the local hub cache
#[derive(Debug, Clone)]
pub struct HubResolver {
    token: Option<String>,
    cache_dir: PathBuf,
    revision: String,
}

impl Default for HubResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HubResolver {
    /// Resolver using `HF_TOKEN` (or `~/.huggingface/token`) and the default
    /// cache directory
    pub fn new() -> Self {
        Self {
            token: Self::resolve_token(),
            cache_dir: Self::default_cache_dir(),
            revision: "main".to_string(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// `HF_TOKEN`, then `~/.huggingface/token`
    pub fn resolve_token() -> Option<String> {
        if let Ok(token) = std::env::var("HF_TOKEN") {
            if !token.is_empty() {
                return Some(token);
            }
        }
        let path = dirs::home_dir()?.join(".huggingface").join("token");
        let token = std::fs::read_to_string(path).ok()?.trim().to_string();
        (!token.is_empty()).then_some(token)
    }

    fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("huggingface")
            .join("hub")
    }

    fn validate_repo_id(repo_id: &str) -> Result<()> {
        match repo_id.split_once('/') {
            Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(())
            }
            _ => Err(Error::InvalidParameter(format!(
                "`{repo_id}` is neither a local directory nor an `org/name` repository id"
            ))),
        }
    }

    fn repo(&self, repo_id: &str) -> Result<ApiRepo> {
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .with_token(self.token.clone())
            .build()
            .map_err(|e| Error::ConfigError(format!("failed to initialize the hub client: {e}")))?;
        Ok(api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            self.revision.clone(),
        )))
    }

    /// Local directory holding the checkpoint named by `model`
    pub fn resolve(&self, model: &str) -> Result<PathBuf> {
        let local = Path::new(model);
        if local.is_dir() {
            return Ok(local.to_path_buf());
        }
        Self::validate_repo_id(model)?;
        let repo = self.repo(model)?;

        let not_found = |file: &str| Error::CheckpointNotFound {
            path: model.to_string(),
            file: file.to_string(),
        };
        let config = repo.get(CONFIG_NAME).map_err(|_| not_found(CONFIG_NAME))?;
        let snapshot = config
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| not_found(CONFIG_NAME))?;

        for &file in OPTIONAL_FILES.iter().chain(TOKENIZER_FILES) {
            if let Err(e) = repo.get(file) {
                tracing::debug!(file, error = %e, "optional file not fetched");
            }
        }

        if repo.get(SAFE_WEIGHTS_NAME).is_ok() {
            tracing::info!("Fetched {model} into {}", snapshot.display());
            return Ok(snapshot);
        }
        if let Ok(index_path) = repo.get(SAFE_WEIGHTS_INDEX_NAME) {
            let index = ShardIndex::from_file(&index_path)?;
            for shard in index.shard_files() {
                repo.get(&shard).map_err(|_| not_found(&shard))?;
            }
            tracing::info!("Fetched sharded {model} into {}", snapshot.display());
            return Ok(snapshot);
        }
        for pickle in [WEIGHTS_NAME, WEIGHTS_INDEX_NAME] {
            if repo.get(pickle).is_ok() {
                return Err(Error::CheckpointVariantMissing {
                    path: model.to_string(),
                    found: pickle.to_string(),
                    expected: format!("{SAFE_WEIGHTS_NAME} or {SAFE_WEIGHTS_INDEX_NAME}"),
                });
            }
        }
        Err(not_found(SAFE_WEIGHTS_NAME))
    }
}
