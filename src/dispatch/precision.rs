//! 4/8-bit load flags, bitsandbytes passthrough and mixed precision

use super::{Context, LoadedModel};
use crate::config::{
    BitsAndBytesConfig, Device, HostCapabilities, ParamDtype, QuantizationConfig, RtnConfig,
    WeightDtype, WeightOnlyParams,
};
use crate::{Error, Result};
use serde_json::Value;

/// RTN config standing in for a 4/8-bit load off CUDA
pub fn flags_to_rtn(
    load_in_4bit: bool,
    device: Device,
    dtype: ParamDtype,
    fast_runtime: bool,
    caps: HostCapabilities,
) -> QuantizationConfig {
    let host_compute = if caps.bf16 { "bf16" } else { "fp32" };
    let model_compute = if device == Device::Cpu && !caps.bf16 && dtype == ParamDtype::Bf16 {
        "fp32"
    } else {
        dtype.short_name()
    };
    let weight = match (load_in_4bit, fast_runtime) {
        (true, true) => WeightOnlyParams::default()
            .with_weight_dtype(WeightDtype::Nf4)
            .with_compute_dtype("fp32"),
        (true, false) => {
            let dtype = if device == Device::Cpu {
                WeightDtype::Nf4
            } else {
                WeightDtype::Int4Fullrange
            };
            WeightOnlyParams::default()
                .with_bits(4)
                .with_weight_dtype(dtype)
                .with_compute_dtype(model_compute)
        }
        (false, true) => WeightOnlyParams::default()
            .with_bits(8)
            .with_weight_dtype(WeightDtype::Int8)
            .with_compute_dtype(host_compute),
        (false, false) => WeightOnlyParams::default()
            .with_bits(8)
            .with_weight_dtype(WeightDtype::Int8)
            .with_compute_dtype(model_compute),
    };
    QuantizationConfig::Rtn(RtnConfig { weight })
}

/// The config the request resolves to, after the 4/8-bit flags and the
/// bitsandbytes passthrough rule; `None` is a plain load
pub(super) fn resolve_request_config(cx: &Context<'_>) -> Result<Option<QuantizationConfig>> {
    let request = cx.request;
    if request.load_in_4bit && request.load_in_8bit {
        return Err(Error::ConfigError(
            "load_in_4bit and load_in_8bit are mutually exclusive".to_string(),
        ));
    }
    let cuda = request.device == Device::Cuda;
    let to_rtn = |four: bool| {
        flags_to_rtn(four, request.device, cx.model_dtype(), cx.fast_runtime, request.caps)
    };

    match &request.quantization_config {
        Some(QuantizationConfig::BitsAndBytes(bnb)) if !cuda => {
            tracing::info!("bitsandbytes needs cuda, quantizing with RTN instead");
            Ok(Some(to_rtn(!bnb.load_in_8bit)))
        }
        Some(qc) => {
            if request.load_in_4bit || request.load_in_8bit {
                tracing::debug!(
                    method = %qc.method(),
                    "explicit quantization config wins over load flags"
                );
            }
            Ok(Some(qc.clone()))
        }
        None if !(request.load_in_4bit || request.load_in_8bit) => Ok(None),
        None if cuda => Ok(Some(QuantizationConfig::BitsAndBytes(BitsAndBytesConfig {
            load_in_4bit: request.load_in_4bit,
            load_in_8bit: request.load_in_8bit,
            ..BitsAndBytesConfig::default()
        }))),
        None => Ok(Some(to_rtn(request.load_in_4bit))),
    }
}

pub(super) fn bits_and_bytes(cx: Context<'_>, qc: QuantizationConfig) -> Result<LoadedModel> {
    if cx.request.device != Device::Cuda {
        return Err(Error::UnsupportedCombination(
            "bitsandbytes quantization requires a cuda device".to_string(),
        ));
    }
    let mut model = cx.load_dense(None)?;
    model.quantization_config = Some(qc);
    tracing::info!("WeightOnlyQuant bitsandbytes done.");
    Ok(LoadedModel::Graph(model))
}

pub(super) fn mixed_precision(cx: Context<'_>, qc: QuantizationConfig) -> Result<LoadedModel> {
    let QuantizationConfig::MixedPrecision(mp) = &qc else {
        return Err(Error::UnsupportedMethod(qc.method().to_string()));
    };
    let dtype = mp.param_dtype();
    let low_cpu_mem_usage = cx.dispatcher.factory().supports_low_cpu_mem_usage(&cx.config);
    if !low_cpu_mem_usage {
        tracing::warn!(
            "Failed to load models with `low_cpu_mem_usage` specified, \
             will fall to traditional load method with higher memory consumption."
        );
    }
    let mut model = cx.load_dense(Some(dtype))?;
    model.config.torch_dtype = dtype.as_str().to_string();
    model.config.set_extra("low_cpu_mem_usage", Value::Bool(low_cpu_mem_usage));
    model.config.set_extra("device", Value::String(Device::Cpu.as_str().to_string()));
    model.quantization_config = Some(qc);
    tracing::info!("Mixed Precision done.");
    Ok(LoadedModel::Graph(model))
}

#[cfg(test)]
mod tests {
    use super::super::{Dispatcher, LoadRequest};
    use super::*;
    use crate::config::MixedPrecisionConfig;
    use crate::nn::{CausalLm, Layer, MlpLmFactory, ModelConfig, ModelFactory, Module};
    use crate::Result;
    use tempfile::TempDir;

    fn saved_dense(dtype: ParamDtype) -> TempDir {
        let dir = TempDir::new().unwrap();
        let mut config = ModelConfig::new("mlp", 16, 8, 1);
        config.intermediate_size = Some(16);
        config.torch_dtype = dtype.as_str().to_string();
        let root = MlpLmFactory.build(&config, dtype).unwrap();
        let mut lm = CausalLm::new(config, root, dtype);
        lm.randomize(2);
        lm.save_pretrained(dir.path()).unwrap();
        dir
    }

    fn request(dir: &TempDir) -> LoadRequest {
        LoadRequest::new(dir.path())
            .with_fast_runtime(false)
            .with_capabilities(HostCapabilities::new(false))
    }

    #[test]
    fn test_flags_follow_device_and_host() {
        let caps = HostCapabilities::new(false);
        let cpu4 = flags_to_rtn(true, Device::Cpu, ParamDtype::Bf16, false, caps);
        let w = cpu4.weight_only().unwrap();
        assert_eq!(
            (w.weight_dtype, w.compute_dtype.as_deref()),
            (Some(WeightDtype::Nf4), Some("fp32"))
        );

        let xpu4 = flags_to_rtn(true, Device::Xpu, ParamDtype::F16, false, caps);
        let w = xpu4.weight_only().unwrap();
        assert_eq!(
            (w.weight_dtype, w.compute_dtype.as_deref()),
            (Some(WeightDtype::Int4Fullrange), Some("fp16"))
        );

        let fast8 = flags_to_rtn(
            false,
            Device::Cpu,
            ParamDtype::F32,
            true,
            HostCapabilities::new(true),
        );
        let w = fast8.weight_only().unwrap();
        assert_eq!((w.bits, w.compute_dtype.as_deref()), (8, Some("bf16")));
    }

    #[test]
    fn test_load_in_4bit_on_cpu_quantizes_with_nf4() {
        let dir = saved_dense(ParamDtype::F32);
        let model = Dispatcher::new(MlpLmFactory)
            .load(&request(&dir).load_in_4bit())
            .unwrap()
            .into_graph()
            .unwrap();
        let Some(Module {
            layer: Layer::Packed(p),
            ..
        }) = model.root.get("model.layers.0.mlp.up_proj")
        else {
            panic!("up_proj should be packed");
        };
        assert_eq!(p.weight_dtype, WeightDtype::Nf4);
    }

    #[test]
    fn test_bitsandbytes_passes_through_on_cuda_only() {
        let dir = saved_dense(ParamDtype::F32);
        let dispatcher = Dispatcher::new(MlpLmFactory);
        let cuda = dispatcher
            .load(&request(&dir).on_device(Device::Cuda).load_in_8bit())
            .unwrap()
            .into_graph()
            .unwrap();
        assert!(matches!(
            cuda.quantization_config,
            Some(QuantizationConfig::BitsAndBytes(BitsAndBytesConfig { load_in_8bit: true, .. }))
        ));
        assert!(matches!(
            cuda.root.get("model.layers.0.mlp.up_proj").unwrap().layer,
            Layer::Linear(_)
        ));

        let cpu = dispatcher
            .load(&request(&dir).with_config(BitsAndBytesConfig::default()))
            .unwrap()
            .into_graph()
            .unwrap();
        assert!(matches!(cpu.quantization_config, Some(QuantizationConfig::Rtn(_))));
    }

    #[test]
    fn test_both_flags_are_rejected() {
        let dir = saved_dense(ParamDtype::F32);
        let err = Dispatcher::new(MlpLmFactory)
            .load(&request(&dir).load_in_4bit().load_in_8bit())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    struct NoLowMemFactory;

    impl ModelFactory for NoLowMemFactory {
        fn build(&self, config: &ModelConfig, dtype: ParamDtype) -> Result<Module> {
            MlpLmFactory.build(config, dtype)
        }

        fn supports_low_cpu_mem_usage(&self, _config: &ModelConfig) -> bool {
            false
        }
    }

    #[test]
    fn test_mixed_precision_records_the_load_strategy() {
        let dir = saved_dense(ParamDtype::F32);
        let qc = MixedPrecisionConfig {
            dtype: "float16".to_string(),
        };
        let model = Dispatcher::new(NoLowMemFactory)
            .load(&request(&dir).with_config(qc))
            .unwrap()
            .into_graph()
            .unwrap();
        assert_eq!(model.dtype, ParamDtype::F16);
        assert_eq!(model.config.torch_dtype, "float16");
        assert_eq!(model.config.extra.get("low_cpu_mem_usage"), Some(&Value::Bool(false)));
        assert_eq!(model.config.extra.get("device"), Some(&Value::String("cpu".to_string())));
    }

    #[test]
    fn test_mixed_precision_model_reloads_in_its_dtype() {
        let dir = saved_dense(ParamDtype::F32);
        let model = Dispatcher::new(MlpLmFactory)
            .load(&request(&dir).with_config(MixedPrecisionConfig::default()))
            .unwrap()
            .into_graph()
            .unwrap();
        let out = TempDir::new().unwrap();
        model.save_pretrained(out.path()).unwrap();

        let back = Dispatcher::new(MlpLmFactory)
            .load(&request(&out))
            .unwrap()
            .into_graph()
            .unwrap();
        assert_eq!(back.dtype, ParamDtype::Bf16);
        assert!(matches!(back.quantization_config, Some(QuantizationConfig::MixedPrecision(_))));
    }
}
