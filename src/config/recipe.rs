//! YAML quantization recipe accepted by `cuantizar quantize --recipe`

use super::quantization::QuantizationConfig;
use super::dtype::Device;
use crate::Result;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct RawRecipe {
    quantization_config: Value,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    dataset_root: Option<PathBuf>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
}

/// A quantization config plus the load options that travel with it
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub quantization_config: QuantizationConfig,
    pub device: Option<Device>,
    pub dataset_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl Recipe {
    /// Parse a recipe document.
    ///
    /// The `quantization_config` mapping goes through
    /// [`QuantizationConfig::from_dict`], so unknown methods and weight
    /// dtypes fail the same way as a persisted config would.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawRecipe = serde_yaml::from_str(text)?;
        Ok(Self {
            quantization_config: QuantizationConfig::from_dict(&raw.quantization_config)?,
            device: raw.device.as_deref().map(str::parse).transpose()?,
            dataset_root: raw.dataset_root,
            output_dir: raw.output_dir,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantMethod;
    use crate::Error;

    #[test]
    fn test_gptq_recipe() {
        let recipe = Recipe::from_yaml(
            r#"
quantization_config:
  quant_method: gptq
  bits: 4
  group_size: 32
  desc_act: true
device: cpu
dataset_root: ./datasets
"#,
        )
        .unwrap();
        assert_eq!(recipe.quantization_config.method(), QuantMethod::Gptq);
        let QuantizationConfig::Gptq(gptq) = &recipe.quantization_config else {
            panic!("expected gptq");
        };
        assert!(gptq.desc_act);
        assert_eq!(gptq.weight.group_size, 32);
        assert_eq!(recipe.device, Some(Device::Cpu));
        assert_eq!(recipe.dataset_root, Some(PathBuf::from("./datasets")));
        assert!(recipe.output_dir.is_none());
    }

    #[test]
    fn test_unknown_method_is_unsupported() {
        let err = Recipe::from_yaml("quantization_config:\n  quant_method: hqq\n").unwrap_err();
        assert!(matches!(err, Error::UnsupportedMethod(_)));
    }

    #[test]
    fn test_unknown_weight_dtype_is_rejected() {
        let err = Recipe::from_yaml(
            "quantization_config:\n  quant_method: rtn\n  weight_dtype: int3\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidWeightDtype(_)));
    }

    #[test]
    fn test_malformed_yaml_is_a_serialization_error() {
        let err = Recipe::from_yaml("quantization_config: [").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
