//! Weight-only paths: RTN, AWQ, TEQ, GPTQ and AutoRound

use super::{Context, LoadedModel, RuntimeModel};
use crate::calibration::{BatchBuilder, CalibrationInputs};
use crate::config::{Device, ParamDtype, QuantMethod, QuantizationConfig};
use crate::io::LowBitPersister;
use crate::nn::{CausalLm, Layer, Module, ModelFactory};
use crate::ptq::MAX_CALIB_ROWS;
use crate::quant::{
    autoround_quantize, awq_search, gptq_quantize, rtn_quantize, teq_quantize, AutoRoundOptions,
    AwqOptions, GptqOptions, HessianAccumulator, InputCapture, Precomputed, QuantSpec, Rtn,
    TeqOptions,
};
use crate::replace::{replace_linear, Exclusion, ExclusionPredicate, ReplaceMode, ReplaceOptions};
use crate::{Error, Result};
use ndarray::Array1;
use serde_json::Value;
use std::sync::Arc;

pub(super) fn weight_only(cx: Context<'_>, mut qc: QuantizationConfig) -> Result<LoadedModel> {
    tracing::info!("Applying Weight Only Quantization.");
    if cx.fast_runtime {
        if qc.method() != QuantMethod::Rtn {
            tracing::error!("Only Supports RTN Quantization in the fast runtime.");
            return Err(Error::UnsupportedCombination(format!(
                "only RTN quantization is supported by the fast runtime, got `{}`",
                qc.method()
            )));
        }
        tracing::info!("Quantize model by the fast runtime with RTN Algorithm.");
        qc.post_init_runtime()?;
        let model = RuntimeModel::quantize_checkpoint(&cx.request.model_dir, cx.config, &qc)?;
        return Ok(LoadedModel::Runtime(model));
    }

    match cx.request.device {
        Device::Cpu => qc.post_init_cpu(cx.request.caps)?,
        Device::Xpu => qc.post_init_xpu()?,
        Device::Cuda => {
            return Err(Error::UnsupportedCombination(
                "weight-only quantization targets cpu or xpu; use load_in_4bit/load_in_8bit on cuda"
                    .to_string(),
            ))
        }
    }

    let mut model = cx.load_dense(None)?;
    model.config.set_extra("low_cpu_mem_usage", Value::Bool(true));
    if model.config.model_type == "chatglm" {
        model.root.cast(ParamDtype::F32);
        model.dtype = ParamDtype::F32;
    }

    let converted = convert(
        &mut model,
        &qc,
        cx.dispatcher.factory(),
        &cx.request.calibration,
    )?;
    tracing::debug!(layers = converted.len(), method = %qc.method(), "linears packed");

    qc.remove_redundant_parameters();
    model.quantization_config = Some(qc);
    model.set_persister(Arc::new(LowBitPersister::default()));
    tracing::info!("WeightOnlyQuant done.");
    Ok(LoadedModel::Graph(model))
}

/// Quantize every eligible linear of `model` into the compact layout
pub(crate) fn convert(
    model: &mut CausalLm,
    qc: &QuantizationConfig,
    factory: &dyn ModelFactory,
    inputs: &CalibrationInputs,
) -> Result<Vec<String>> {
    let weight = qc
        .weight_only()
        .ok_or_else(|| Error::UnsupportedMethod(format!("`{}` is not weight-only", qc.method())))?;
    let spec = QuantSpec::from_params(weight, qc.sym().unwrap_or(weight.sym))?;
    let exclusion = ExclusionPredicate::with_extra(weight.modules_to_not_convert.iter().cloned());
    let opts = ReplaceOptions::compact(spec, weight.resolved_compute_dtype()?);

    if qc.method() == QuantMethod::Rtn {
        return replace_linear(&mut model.root, &opts, &exclusion, ReplaceMode::Eager(&mut Rtn));
    }
    let mut precomputed = calibrate(model, qc, &spec, &exclusion, factory, inputs)?;
    replace_linear(&mut model.root, &opts, &exclusion, ReplaceMode::Eager(&mut precomputed))
}

fn fold_into_norm(root: &mut Module, norm: &str, scale: &Array1<f32>) -> Result<()> {
    match root.get_mut(norm) {
        Some(Module {
            layer: Layer::LayerNorm(n),
            ..
        }) => {
            n.fold_scale(scale);
            Ok(())
        }
        _ => Err(Error::ModuleNotFound(format!("`{norm}` is not a layer norm"))),
    }
}

/// Run the calibrated algorithm over every target layer.
///
/// Channel scales found by AWQ and TEQ are folded into the preceding
/// normalization as each layer is processed; layers that saw no calibration
/// input fall back to RTN.
fn calibrate(
    model: &mut CausalLm,
    qc: &QuantizationConfig,
    spec: &QuantSpec,
    exclusion: &dyn Exclusion,
    factory: &dyn ModelFactory,
    inputs: &CalibrationInputs,
) -> Result<Precomputed> {
    let targets: Vec<String> = model
        .root
        .named_modules()
        .into_iter()
        .filter(|(name, module)| {
            !name.is_empty()
                && matches!(module.layer, Layer::Linear(_))
                && !exclusion.excludes(name)
        })
        .map(|(name, _)| name)
        .collect();

    let params = qc.calibration().cloned().unwrap_or_default();
    let (seq_len, max_rows) = match qc {
        QuantizationConfig::Gptq(_) => (params.max_input_length, params.nsamples),
        _ => (params.calib_len, MAX_CALIB_ROWS),
    };
    let builder = BatchBuilder::new(
        model.config.model_type.clone(),
        seq_len,
        params.calib_padding,
        params.calib_pad_val,
    );
    let (calib, _) = inputs.resolve(&params, &builder)?;
    let mut capture = InputCapture::only(targets.iter().cloned(), max_rows);
    calib(&*model, &mut capture)?;

    let mut out = Precomputed::new();
    for name in &targets {
        let Some(Module {
            layer: Layer::Linear(linear),
            ..
        }) = model.root.get(name)
        else {
            continue;
        };
        let weight = linear.weight.clone();
        let Some(x) = capture.inputs(name) else {
            tracing::warn!(
                layer = %name,
                "no calibration input reached the layer, falling back to RTN"
            );
            out.insert(name.clone(), rtn_quantize(&weight, spec));
            continue;
        };

        let q = match qc {
            QuantizationConfig::Awq(c) => {
                let norm = factory.foldable_norm(name);
                let opts = AwqOptions {
                    auto_scale: c.auto_scale,
                    mse_range: c.mse_range,
                };
                let plan = awq_search(&weight, &x, spec, &opts, norm.is_some());
                if let (Some(scale), Some(norm)) = (&plan.scale, &norm) {
                    fold_into_norm(&mut model.root, norm, scale)?;
                }
                plan.quantize(&weight, spec)
            }
            QuantizationConfig::Teq(c) => match factory.foldable_norm(name) {
                Some(norm) => {
                    let opts = TeqOptions {
                        lr: c.lr,
                        iters: params.calib_iters,
                    };
                    let result = teq_quantize(&weight, &x, spec, &opts);
                    tracing::debug!(layer = %name, loss = result.loss, "TEQ scales trained");
                    fold_into_norm(&mut model.root, &norm, &result.scale)?;
                    result.quantized
                }
                None => rtn_quantize(&weight, spec),
            },
            QuantizationConfig::Gptq(c) => {
                let mut hessian =
                    HessianAccumulator::new(weight.ncols()).with_max_samples(params.nsamples);
                hessian.add_batch(x.view());
                let opts = GptqOptions {
                    damp_percent: c.damp_percent,
                    blocksize: c.blocksize,
                    desc_act: c.desc_act,
                    static_groups: c.static_groups,
                };
                gptq_quantize(&weight, hessian.hessian(), spec, &opts)?
            }
            QuantizationConfig::AutoRound(c) => {
                let opts = AutoRoundOptions {
                    iters: params.calib_iters,
                    lr: c.lr,
                    minmax_lr: c.minmax_lr,
                };
                autoround_quantize(&weight, &x, spec, &opts)
            }
            _ => rtn_quantize(&weight, spec),
        };
        out.insert(name.clone(), q);
    }
    Ok(out)
}
