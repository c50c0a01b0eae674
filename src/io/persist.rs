//! Save strategies attached to a loaded model
//!
//! A model carries one [`Persister`]; `CausalLm::save_pretrained` goes through
//! it. Low-bit saving re-lays out packed layers for export and then writes the
//! tree with the plain persister directly, so it never re-enters itself.

use super::checkpoint::{write_state_dict, DEFAULT_MAX_SHARD_SIZE};
use super::manifest::CheckpointManifest;
use crate::calibration::copy_tokenizer_files;
use crate::nn::{CausalLm, GENERATION_CONFIG_NAME};
use crate::replace::recover_export_model;
use crate::{Error, Result};
use std::fmt::Debug;
use std::path::Path;

/// How a model is written to a directory
pub trait Persister: Debug + Send + Sync {
    fn save(&self, model: &CausalLm, dir: &Path) -> Result<()>;

    fn name(&self) -> &'static str;
}

fn prepare_dir(dir: &Path) -> Result<()> {
    if dir.is_file() {
        return Err(Error::InvalidParameter(format!(
            "Provided path ({}) should be a directory, not a file",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// `config.json`, weights and generation config, nothing quantization specific
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainPersister {
    pub max_shard_size: usize,
}

impl Default for PlainPersister {
    fn default() -> Self {
        Self {
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
        }
    }
}

impl Persister for PlainPersister {
    fn save(&self, model: &CausalLm, dir: &Path) -> Result<()> {
        prepare_dir(dir)?;
        let mut config = model.config.clone();
        config.quantization_config = model
            .quantization_config
            .as_ref()
            .map(|qc| qc.to_dict())
            .transpose()?;
        config.save(dir)?;
        write_state_dict(dir, &model.root.state_dict(), self.max_shard_size)?;
        if let Some(generation) = &model.generation_config {
            std::fs::write(
                dir.join(GENERATION_CONFIG_NAME),
                serde_json::to_string_pretty(generation)?,
            )?;
        }
        if let Some(source) = &model.source_dir {
            let copied = copy_tokenizer_files(source, dir)?;
            tracing::debug!(files = ?copied, "tokenizer files carried over");
        }
        tracing::debug!(dir = %dir.display(), "model saved");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}

/// Bound onto quantized models; see [`save_low_bit`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LowBitPersister {
    pub plain: PlainPersister,
}

impl Persister for LowBitPersister {
    fn save(&self, model: &CausalLm, dir: &Path) -> Result<()> {
        save_low_bit_with(model, dir, self.plain)
    }

    fn name(&self) -> &'static str {
        "low_bit"
    }
}

/// Save a quantized model so that it reloads without calibration.
///
/// Packed layers are exported (integer dtypes to the portable layout), the
/// key manifest and a stripped `quantization_config.json` are written next to
/// the weights. The caller's model is left untouched.
pub fn save_low_bit(model: &CausalLm, dir: impl AsRef<Path>) -> Result<()> {
    save_low_bit_with(model, dir.as_ref(), PlainPersister::default())
}

fn save_low_bit_with(model: &CausalLm, dir: &Path, plain: PlainPersister) -> Result<()> {
    let Some(qc) = &model.quantization_config else {
        return Err(Error::NotLowBit);
    };
    prepare_dir(dir)?;

    let mut export = model.clone();
    let mut stripped = qc.clone();
    stripped.remove_redundant_parameters();
    export.quantization_config = Some(stripped.clone());
    let exported = recover_export_model(&mut export.root)?;
    tracing::debug!(layers = exported.len(), "packed layers exported");

    plain.save(&export, dir)?;
    CheckpointManifest::from_state_dict(&export.root.state_dict()).write(dir)?;
    stripped.to_json_file(dir)?;
    tracing::info!(
        "Saved low-bit {} model to {}",
        stripped.method(),
        dir.display()
    );
    Ok(())
}
