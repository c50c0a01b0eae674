//! Quantization configuration
//!
//! One tagged [`QuantizationConfig`] variant per method, the dtype enums it
//! refers to, the host capability detection, an optional YAML recipe file and the
//! command-line schema of the `cuantizar` binary.
//!
//! # Example recipe
//!
//! ```yaml
//! quantization_config:
//!   quant_method: gptq
//!   bits: 4
//!   group_size: 128
//!   desc_act: true
//! device: cpu
//! dataset_root: ./datasets
//! ```

mod cli;
mod dtype;
mod quantization;
mod recipe;

pub use cli::{parse_args, BenchmarkArgs, Cli, Command, LoadArgs, QuantizeArgs, WoqAlgo};
pub use dtype::{
    resolve_weight_dtype, ComputeDtype, Device, HostCapabilities, ParamDtype, ScaleDtype,
    WeightDtype, EXCLUDED_WEIGHT_DTYPES,
};
pub use quantization::{
    AutoRoundConfig, AwqConfig, BitsAndBytesConfig, CalibrationParams, DynamicQuantConfig,
    GptqConfig, MixedPrecisionConfig, QatConfig, QuantMethod, QuantizationConfig, RtnConfig,
    SmoothAlpha, SmoothQuantConfig, StaticQuantConfig, TeqConfig, TrainParams, WeightOnlyParams,
    DEFAULT_CALIB_DATASET, QUANT_CONFIG_NAME,
};
pub use recipe::Recipe;
