//! SmoothQuant, static, dynamic and quantization-aware training paths

use super::{Context, LoadedModel};
use crate::calibration::{BatchBuilder, PastKeyValues};
use crate::config::{CalibrationParams, ParamDtype, QuantizationConfig};
use crate::io::LowBitPersister;
use crate::nn::CausalLm;
use crate::ptq::PtqConf;
use crate::qat::{default_train_fn, train_batches, CompressionManager, QatConf};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

/// Architectures the LLM graph optimization knows, with `_` spelled `-`
pub const IPEX_OPT_LLM_SUPPORTED: [&str; 7] =
    ["gptj", "opt", "llama", "falcon", "chatglm", "baichuan", "gpt-neox"];

/// Whether the LLM graph optimization runs before SmoothQuant.
///
/// llama never takes it; otherwise an explicit choice wins and `None` means
/// "when the architecture is supported".
pub fn resolve_ipex_opt_llm(model_type: &str, requested: Option<bool>) -> bool {
    if model_type == "llama" {
        return false;
    }
    requested.unwrap_or_else(|| {
        IPEX_OPT_LLM_SUPPORTED.contains(&model_type.replace('_', "-").as_str())
    })
}

/// Mark the model as graph-optimized for generation and return the
/// beam-aware past-key-value layout its traced forward expects
pub fn optimize_for_llm(model: &mut CausalLm, num_beams: usize) -> PastKeyValues {
    let config = &mut model.config;
    config.set_extra("ipex_opt_llm", Value::Bool(true));
    config.set_extra("num_beams", Value::from(num_beams));
    PastKeyValues {
        beams: num_beams.max(1),
        ..PastKeyValues::new(
            config.num_hidden_layers,
            config.num_attention_heads(),
            config.head_dim(),
        )
    }
}

fn past_key_values(model: &CausalLm) -> PastKeyValues {
    let c = &model.config;
    PastKeyValues::new(c.num_hidden_layers, c.num_attention_heads(), c.head_dim())
}

fn calibration_builder(
    model: &CausalLm,
    params: &CalibrationParams,
    past: PastKeyValues,
) -> BatchBuilder {
    BatchBuilder::new(
        model.config.model_type.clone(),
        params.calib_len,
        params.calib_padding,
        params.calib_pad_val,
    )
    .with_past_key_values(past)
}

/// Tag the model and bind the low-bit persister
fn finish(mut model: CausalLm, mut qc: QuantizationConfig) -> LoadedModel {
    qc.remove_redundant_parameters();
    model.quantization_config = Some(qc);
    model.set_persister(Arc::new(LowBitPersister::default()));
    LoadedModel::Graph(model)
}

fn wrong_config(qc: &QuantizationConfig) -> Error {
    Error::UnsupportedMethod(format!("unexpected `{}` config", qc.method()))
}

pub(super) fn smooth_quant(cx: Context<'_>, qc: QuantizationConfig) -> Result<LoadedModel> {
    let QuantizationConfig::SmoothQuant(sq) = &qc else {
        return Err(wrong_config(&qc));
    };
    let conf = PtqConf::from_config(&qc)?;
    let mut model = cx.load_dense(Some(ParamDtype::F32))?;
    model.config.set_extra("torchscript", Value::Bool(true));
    tracing::info!("Applying SmoothQuant.");

    let past = if resolve_ipex_opt_llm(&model.config.model_type, sq.ipex_opt_llm) {
        optimize_for_llm(&mut model, sq.num_beams)
    } else {
        past_key_values(&model)
    };
    let params = sq.calibration.clone().unwrap_or_default();
    let builder = calibration_builder(&model, &params, past);
    let (calib, example) = cx.request.calibration.resolve(&params, &builder)?;
    if let Some(example) = &example {
        tracing::debug!(
            tokens = example.len(),
            "example inputs taken from the first calibration batch"
        );
    }

    let converted = cx.dispatcher.ptq().fit(&mut model, &conf, Some(&calib))?;
    tracing::debug!(layers = converted.len(), "SmoothQuant layers converted");
    tracing::info!("SmoothQuant done.");
    Ok(finish(model, qc))
}

pub(super) fn static_quant(cx: Context<'_>, qc: QuantizationConfig) -> Result<LoadedModel> {
    let QuantizationConfig::Static(sc) = &qc else {
        return Err(wrong_config(&qc));
    };
    let conf = PtqConf::from_config(&qc)?;
    let mut model = cx.load_dense(Some(ParamDtype::F32))?;
    let params = sc.calibration.clone().unwrap_or_default();
    let builder = calibration_builder(&model, &params, past_key_values(&model));
    let (calib, example) = cx.request.calibration.resolve(&params, &builder)?;
    if conf.backend == "ipex" && example.is_none() {
        return Err(Error::MissingCalibrationInputs(
            "the ipex backend needs example_inputs".to_string(),
        ));
    }

    tracing::info!("Applying StaticQuant.");
    cx.dispatcher.ptq().fit(&mut model, &conf, Some(&calib))?;
    tracing::info!("StaticQuant done.");
    Ok(finish(model, qc))
}

pub(super) fn dynamic_quant(cx: Context<'_>, qc: QuantizationConfig) -> Result<LoadedModel> {
    let conf = PtqConf::from_config(&qc)?;
    let mut model = cx.load_dense(Some(ParamDtype::F32))?;
    tracing::info!("Applying DynamicQuant.");
    cx.dispatcher.ptq().fit(&mut model, &conf, None)?;
    tracing::info!("DynamicQuant done.");
    Ok(finish(model, qc))
}

pub(super) fn quant_aware_training(cx: Context<'_>, qc: QuantizationConfig) -> Result<LoadedModel> {
    let QuantizationConfig::Qat(c) = &qc else {
        return Err(wrong_config(&qc));
    };
    let conf = QatConf::from_config(c);
    let mut model = cx.load_dense(Some(ParamDtype::F32))?;
    tracing::info!("Applying QuantAwareTraining.");

    let train_fn = match &cx.request.train_fn {
        Some(f) => f.clone(),
        None => {
            let batches = train_batches(
                &cx.request.calibration,
                &conf.training,
                &model.config.model_type,
            )?;
            default_train_fn(batches, conf.training.train_iters)
        }
    };
    let mut manager = CompressionManager::new(conf);
    manager.prepare(&mut model)?;
    let converted = manager.fit(&mut model, &train_fn)?;
    tracing::debug!(layers = converted.len(), "QAT layers finalized");
    tracing::info!("Quant Aware Training done.");
    Ok(finish(model, qc))
}
