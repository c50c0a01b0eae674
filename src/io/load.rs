//! Dense and low-bit model loading

use super::checkpoint::{read_state_dict, resolve_checkpoint};
use super::manifest::CheckpointManifest;
use super::persist::LowBitPersister;
use crate::config::{Device, HostCapabilities, ParamDtype, QuantizationConfig, QUANT_CONFIG_NAME};
use crate::nn::{
    CausalLm, Int8Linear, Layer, LoadReport, Module, ModelConfig, ModelFactory, CONFIG_NAME,
    GENERATION_CONFIG_NAME,
};
use crate::quant::{QuantSpec, Rtn};
use crate::replace::{
    build_woq_model, replace_linear, ExclusionPredicate, ReplaceMode, ReplaceOptions,
};
use crate::{Error, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

fn log_report(report: &LoadReport) {
    if !report.missing.is_empty() {
        tracing::warn!(
            "Some weights of the model checkpoint were not used: missing keys {:?}",
            report.missing
        );
    }
    if !report.unexpected.is_empty() {
        tracing::warn!("Unexpected keys in the checkpoint: {:?}", report.unexpected);
    }
}

/// Best effort; an absent or unreadable file is no generation config
fn read_generation_config(dir: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(dir.join(GENERATION_CONFIG_NAME)).ok()?;
    serde_json::from_str(&text).ok()
}

/// Quantization config embedded in `config.json`, else the sibling file
fn read_quantization_config(
    dir: &Path,
    config: &ModelConfig,
) -> Result<Option<QuantizationConfig>> {
    if let Some(raw) = &config.quantization_config {
        return QuantizationConfig::from_dict(raw).map(Some);
    }
    let path = dir.join(QUANT_CONFIG_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let raw: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    QuantizationConfig::from_dict(&raw).map(Some)
}

/// Load a dense checkpoint as-is; parameters are allocated in `dtype` or the
/// config's `torch_dtype`
pub fn load_pretrained(
    dir: impl AsRef<Path>,
    factory: &dyn ModelFactory,
    dtype: Option<ParamDtype>,
) -> Result<CausalLm> {
    let dir = dir.as_ref();
    let config = ModelConfig::from_file(dir.join(CONFIG_NAME))?;
    let dtype = dtype.unwrap_or_else(|| config.param_dtype());
    let mut root = factory.build(&config, dtype)?;
    let dict = read_state_dict(&resolve_checkpoint(dir)?)?;
    let report = root.load_state_dict(&dict)?;
    log_report(&report);
    root.cast(dtype);

    let mut model = CausalLm::new(config, root, dtype);
    model.generation_config = read_generation_config(dir);
    model.source_dir = Some(dir.to_path_buf());
    if report.missing.iter().any(|k| k == "lm_head.weight") {
        model.tie_weights();
    }
    Ok(model)
}

/// Swap every dense linear that the manifest shows as int8 for an empty
/// [`Int8Linear`] with the same activation layout
fn int8_skeleton(root: &mut Module, manifest: &CheckpointManifest) -> Result<usize> {
    let mut replaced = 0;
    for name in root.linear_names() {
        if !manifest.contains(&format!("{name}.weight_scale")) {
            continue;
        }
        let Some(Module {
            layer: Layer::Linear(linear),
            ..
        }) = root.get(&name)
        else {
            continue;
        };
        let skeleton = Int8Linear::empty(
            linear.in_features,
            linear.out_features,
            manifest.contains(&format!("{name}.bias")),
            manifest.contains(&format!("{name}.act_scale")),
            manifest.contains(&format!("{name}.smooth_scale")),
        );
        root.replace(&name, Module::new(Layer::Int8(skeleton)))?;
        replaced += 1;
    }
    Ok(replaced)
}

/// Rebuild a model saved with `save_low_bit`, without calibration.
///
/// The skeleton follows the on-disk layout: integer dtypes were exported to
/// the portable layout and are repacked into the compact one after binding;
/// codebook dtypes are bound directly in the compact layout.
pub fn load_low_bit(
    dir: impl AsRef<Path>,
    factory: &dyn ModelFactory,
    device: Device,
    caps: HostCapabilities,
) -> Result<CausalLm> {
    let dir = dir.as_ref();
    let config = ModelConfig::from_file(dir.join(CONFIG_NAME))?;
    let mut qc = read_quantization_config(dir, &config)?.ok_or(Error::NotLowBit)?;
    let model_dtype = config.param_dtype();
    let weight_dtype = qc.resolve_for_reload(model_dtype, device, caps)?;
    let manifest = CheckpointManifest::read(dir)?;

    let mut root = factory.build(&config, model_dtype)?;
    let mut repack = None;
    if let (Some(weight_dtype), Some(weight)) = (weight_dtype, qc.weight_only()) {
        let sym = qc.sym().unwrap_or(weight.sym);
        let spec = QuantSpec::from_params(weight, sym)?;
        let compute = weight.resolved_compute_dtype()?;
        let exclusion = ExclusionPredicate::with_extra(
            weight.modules_to_not_convert.iter().cloned(),
        );
        if weight_dtype.is_excluded() {
            let opts = ReplaceOptions::compact(spec, compute);
            let names = replace_linear(&mut root, &opts, &exclusion, ReplaceMode::Skeleton)?;
            for name in names {
                if !manifest.contains(&format!("{name}.g_idx")) {
                    continue;
                }
                if let Some(Module {
                    layer: Layer::Packed(p),
                    ..
                }) = root.get_mut(&name)
                {
                    p.ensure_g_idx();
                }
            }
        } else {
            build_woq_model(&mut root, &spec, compute, &exclusion)?;
            repack = Some((ReplaceOptions::compact(spec, compute), exclusion));
        }
    } else if qc.method().is_activation_quant() {
        let n = int8_skeleton(&mut root, &manifest)?;
        tracing::debug!(layers = n, "int8 skeleton built");
    }

    let dict = read_state_dict(&resolve_checkpoint(dir)?)?;
    let report = root.load_state_dict(&dict)?;
    log_report(&report);

    if let Some((opts, exclusion)) = repack {
        replace_linear(&mut root, &opts, &exclusion, ReplaceMode::Eager(&mut Rtn))?;
    }

    let mut dtype = model_dtype;
    if model_dtype == ParamDtype::F16 || (model_dtype == ParamDtype::Bf16 && !caps.bf16) {
        root.cast(ParamDtype::F32);
        dtype = ParamDtype::F32;
    }

    let mut model = CausalLm::new(config, root, dtype);
    model.device = device;
    model.generation_config = read_generation_config(dir);
    model.source_dir = Some(dir.to_path_buf());
    tracing::info!("Loaded low-bit {} model from {}", qc.method(), dir.display());
    model.quantization_config = Some(qc);
    model.freeze();
    model.set_persister(Arc::new(LowBitPersister::default()));
    Ok(model)
}
