//! Fast runtime: flat low-bit tensors without a module graph
//!
//! The runtime consumes checkpoint tensors directly. RTN is the only method
//! it can apply itself; models quantized by other weight-only methods reach
//! it through a saved low-bit checkpoint.

use crate::config::{Device, HostCapabilities, ParamDtype, QuantMethod, QuantizationConfig};
use crate::io::{load_low_bit, read_state_dict, resolve_checkpoint};
use crate::nn::{CausalLm, Layer, ModelConfig, ModelFactory, StateDict, StateTensor};
use crate::quant::{rtn_quantize, QuantSpec, QuantizedWeight};
use crate::replace::{Exclusion, ExclusionPredicate};
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Architectures the runtime can execute
pub const RUNTIME_MODEL_TYPES: [&str; 19] = [
    "llama", "gptj", "mpt", "opt", "gptneox", "dolly", "polyglot", "starcoder", "falcon", "bloom",
    "chatglm2", "chatglm", "baichuan", "mistral", "qwen", "phi", "whisper", "qwen2", "gemma",
];

/// Architectures whose GPTQ checkpoints the runtime understands
pub const GPTQ_RUNTIME_MODEL_TYPES: [&str; 10] = [
    "llama", "gptj", "mpt", "falcon", "chatglm2", "chatglm", "baichuan", "mistral", "qwen", "phi",
];

/// Token and position tables stay dense on the runtime
const DENSE_TABLES: [&str; 3] = ["embed", "wte", "wpe"];

/// Whether a model type (and, for GPTQ, its checkpoint) can run on the
/// fast runtime
pub fn runtime_supports(model_type: &str, method: Option<QuantMethod>) -> bool {
    if !RUNTIME_MODEL_TYPES.contains(&model_type) {
        return false;
    }
    match method {
        Some(QuantMethod::Gptq) => GPTQ_RUNTIME_MODEL_TYPES.contains(&model_type),
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeTensor {
    Dense(StateTensor),
    Quantized { spec: QuantSpec, weight: QuantizedWeight },
}

impl RuntimeTensor {
    pub fn nbytes(&self) -> usize {
        match self {
            RuntimeTensor::Dense(t) => t.nbytes(),
            RuntimeTensor::Quantized { spec, weight } => {
                let codes = (weight.codes.len() * spec.bits() as usize).div_ceil(8);
                let zeros = weight.zeros.as_ref().map_or(0, |z| z.len());
                codes + weight.scales.len() * spec.scale_dtype.param_dtype().size_of() + zeros
            }
        }
    }

    /// `[out, in]` weight in f32
    pub fn to_array2(&self) -> Result<Array2<f32>> {
        match self {
            RuntimeTensor::Dense(t) => t.to_array2(),
            RuntimeTensor::Quantized { spec, weight } => Ok(weight.dequantize(spec)),
        }
    }
}

/// Weights prepared for the fast runtime, keyed by parameter name
#[derive(Debug, Clone)]
pub struct RuntimeModel {
    pub config: ModelConfig,
    pub quantization_config: Option<QuantizationConfig>,
    tensors: BTreeMap<String, RuntimeTensor>,
}

fn dense_f32(tensor: &StateTensor) -> Result<RuntimeTensor> {
    if !tensor.is_floating() {
        return Ok(RuntimeTensor::Dense(tensor.clone()));
    }
    let values = tensor.to_f32_vec()?;
    Ok(RuntimeTensor::Dense(StateTensor::from_f32(
        tensor.shape.clone(),
        &values,
        ParamDtype::F32,
    )))
}

fn quantizable(key: &str, tensor: &StateTensor, exclusion: &dyn Exclusion) -> bool {
    let Some(layer) = key.strip_suffix(".weight") else {
        return false;
    };
    tensor.shape.len() == 2
        && tensor.is_floating()
        && !exclusion.excludes(layer)
        && !DENSE_TABLES.iter().any(|t| layer.contains(t))
}

impl RuntimeModel {
    fn read_checkpoint(dir: &Path) -> Result<StateDict> {
        read_state_dict(&resolve_checkpoint(dir)?)
    }

    /// Every floating tensor of a dense checkpoint, upcast to fp32
    pub fn from_dense_checkpoint(dir: impl AsRef<Path>, config: ModelConfig) -> Result<Self> {
        let dict = Self::read_checkpoint(dir.as_ref())?;
        let tensors = dict
            .iter()
            .map(|(k, t)| Ok((k.clone(), dense_f32(t)?)))
            .collect::<Result<_>>()?;
        Ok(Self {
            config,
            quantization_config: None,
            tensors,
        })
    }

    /// RTN-quantize the 2-D weights of a dense checkpoint
    pub fn quantize_checkpoint(
        dir: impl AsRef<Path>,
        config: ModelConfig,
        qc: &QuantizationConfig,
    ) -> Result<Self> {
        let weight = match qc {
            QuantizationConfig::Rtn(c) => &c.weight,
            other => {
                return Err(Error::UnsupportedCombination(format!(
                    "only RTN quantization is supported by the fast runtime, got `{}`",
                    other.method()
                )))
            }
        };
        let spec = QuantSpec::from_params(weight, weight.sym)?;
        let exclusion = ExclusionPredicate::with_extra(
            weight.modules_to_not_convert.iter().cloned(),
        );

        let dict = Self::read_checkpoint(dir.as_ref())?;
        let mut tensors = BTreeMap::new();
        let mut quantized = 0usize;
        for (key, tensor) in &dict {
            let entry = if quantizable(key, tensor, &exclusion) {
                quantized += 1;
                RuntimeTensor::Quantized {
                    spec,
                    weight: rtn_quantize(&tensor.to_array2()?, &spec),
                }
            } else {
                dense_f32(tensor)?
            };
            tensors.insert(key.clone(), entry);
        }
        tracing::debug!(
            tensors = quantized,
            weight_dtype = %spec.weight_dtype,
            "checkpoint quantized for the fast runtime"
        );
        Ok(Self {
            config,
            quantization_config: Some(qc.clone()),
            tensors,
        })
    }

    /// Reload a saved low-bit checkpoint and flatten it
    pub fn from_low_bit(
        dir: impl AsRef<Path>,
        factory: &dyn ModelFactory,
        caps: HostCapabilities,
    ) -> Result<Self> {
        let model = load_low_bit(dir, factory, Device::Cpu, caps)?;
        Self::from_graph(&model)
    }

    /// Flatten a module graph: packed layers keep their codes, everything
    /// else becomes fp32
    pub fn from_graph(model: &CausalLm) -> Result<Self> {
        let mut tensors = BTreeMap::new();
        let mut packed = BTreeSet::new();
        for (name, module) in model.root.named_modules() {
            let Layer::Packed(p) = &module.layer else {
                continue;
            };
            tensors.insert(
                format!("{name}.weight"),
                RuntimeTensor::Quantized {
                    spec: p.spec(),
                    weight: p.unpack()?,
                },
            );
            if let Some(bias) = &p.bias {
                tensors.insert(
                    format!("{name}.bias"),
                    RuntimeTensor::Dense(StateTensor::from_array1(bias, ParamDtype::F32)),
                );
            }
            packed.insert(name);
        }
        for (key, tensor) in &model.root.state_dict() {
            let owner = key.rsplit_once('.').map_or("", |(owner, _)| owner);
            if packed.contains(owner) {
                continue;
            }
            tensors.insert(key.clone(), dense_f32(tensor)?);
        }
        Ok(Self {
            config: model.config.clone(),
            quantization_config: model.quantization_config.clone(),
            tensors,
        })
    }

    pub fn get(&self, key: &str) -> Option<&RuntimeTensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn quantized_names(&self) -> impl Iterator<Item = &str> {
        self.tensors
            .iter()
            .filter(|(_, t)| matches!(t, RuntimeTensor::Quantized { .. }))
            .map(|(k, _)| k.as_str())
    }

    pub fn nbytes(&self) -> usize {
        self.tensors.values().map(RuntimeTensor::nbytes).sum()
    }

    /// `x · Wᵀ` through the weight stored under `key`
    pub fn matmul(&self, key: &str, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let w = self
            .get(key)
            .ok_or_else(|| Error::ModuleNotFound(key.to_string()))?
            .to_array2()?;
        if w.ncols() != x.ncols() {
            return Err(Error::ShapeMismatch {
                name: key.to_string(),
                expected: vec![x.nrows(), w.ncols()],
                got: x.shape().to_vec(),
            });
        }
        Ok(x.dot(&w.t()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RtnConfig, WeightDtype, WeightOnlyParams};
    use crate::io::save_low_bit;
    use crate::nn::MlpLmFactory;
    use crate::quant::Rtn;
    use crate::replace::{replace_linear, ReplaceMode, ReplaceOptions};
    use ndarray::Array2;
    use tempfile::TempDir;

    fn dense() -> CausalLm {
        let mut config = ModelConfig::new("llama", 16, 8, 1);
        config.intermediate_size = Some(16);
        let root = MlpLmFactory.build(&config, ParamDtype::F32).unwrap();
        let mut lm = CausalLm::new(config, root, ParamDtype::F32);
        lm.randomize(8);
        lm
    }

    #[test]
    fn test_runtime_model_lists() {
        assert!(runtime_supports("llama", Some(QuantMethod::Gptq)));
        assert!(runtime_supports("opt", Some(QuantMethod::Rtn)));
        assert!(!runtime_supports("opt", Some(QuantMethod::Gptq)));
        assert!(!runtime_supports("gpt2", None));
    }

    #[test]
    fn test_quantize_checkpoint_skips_tables_and_heads() {
        let dir = TempDir::new().unwrap();
        let lm = dense();
        lm.save_pretrained(dir.path()).unwrap();
        let mut qc = QuantizationConfig::Rtn(RtnConfig {
            weight: WeightOnlyParams::default().with_group_size(4),
        });
        qc.post_init_runtime().unwrap();

        let runtime = RuntimeModel::quantize_checkpoint(
            dir.path(),
            lm.config.clone(),
            &qc,
        )
        .unwrap();
        let names: Vec<&str> = runtime.quantized_names().collect();
        assert_eq!(
            names,
            vec!["model.layers.0.mlp.down_proj.weight", "model.layers.0.mlp.up_proj.weight"]
        );
        assert!(runtime.nbytes() < lm.root.state_dict().values().map(StateTensor::nbytes).sum());

        let x = Array2::from_elem((2, 8), 0.5f32);
        let y = runtime.matmul("model.layers.0.mlp.up_proj.weight", x.view()).unwrap();
        assert_eq!(y.dim(), (2, 16));
        assert!(runtime.matmul("lm_head.weight", Array2::zeros((1, 3)).view()).is_err());
    }

    #[test]
    fn test_non_rtn_config_is_refused() {
        let dir = TempDir::new().unwrap();
        let qc = QuantizationConfig::Gptq(Default::default());
        let err = RuntimeModel::quantize_checkpoint(dir.path(), dense().config, &qc).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCombination(_)));
    }

    #[test]
    fn test_low_bit_checkpoint_flattens_to_the_same_weights() {
        let dir = TempDir::new().unwrap();
        let mut lm = dense();
        let mut qc = QuantizationConfig::Rtn(RtnConfig {
            weight: WeightOnlyParams::default()
                .with_weight_dtype(WeightDtype::Int8)
                .with_group_size(4),
        });
        qc.post_init_cpu(HostCapabilities::new(false)).unwrap();
        let w = qc.weight_only().unwrap();
        let spec = QuantSpec::from_params(w, w.sym).unwrap();
        let opts = ReplaceOptions::compact(spec, w.resolved_compute_dtype().unwrap());
        replace_linear(
            &mut lm.root,
            &opts,
            &ExclusionPredicate::default(),
            ReplaceMode::Eager(&mut Rtn),
        )
        .unwrap();
        lm.quantization_config = Some(qc);
        save_low_bit(&lm, dir.path()).unwrap();

        let runtime = RuntimeModel::from_low_bit(
            dir.path(),
            &MlpLmFactory,
            HostCapabilities::new(false),
        )
        .unwrap();
        let Layer::Packed(p) = &lm.root.get("model.layers.0.mlp.up_proj").unwrap().layer else {
            panic!("up_proj should be packed");
        };
        let flat = runtime.get("model.layers.0.mlp.up_proj.weight").unwrap();
        assert_eq!(flat.to_array2().unwrap(), p.dequantize().unwrap());
        assert!(runtime.get("model.layers.0.mlp.up_proj.qweight").is_none());
        assert!(matches!(runtime.get("lm_head.weight"), Some(RuntimeTensor::Dense(_))));
    }
}
