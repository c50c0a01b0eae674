//! Quantization configuration: one tagged variant per method
//!
//! The variant tag is the `quant_method` field of the persisted JSON, so a
//! saved `quantization_config` object deserializes straight back into the
//! variant that produced it.

use super::dtype::{
    resolve_weight_dtype, ComputeDtype, Device, HostCapabilities, ParamDtype, ScaleDtype,
    WeightDtype,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Default calibration dataset
pub const DEFAULT_CALIB_DATASET: &str = "NeelNanda/pile-10k";

/// File name of the sibling config document written next to the weights
pub const QUANT_CONFIG_NAME: &str = "quantization_config.json";

/// Discriminant of [`QuantizationConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantMethod {
    Rtn,
    Awq,
    Teq,
    Gptq,
    AutoRound,
    SmoothQuant,
    Static,
    Dynamic,
    Qat,
    MixedPrecision,
    BitsAndBytes,
}

impl QuantMethod {
    pub const ALL: [QuantMethod; 11] = [
        QuantMethod::Rtn,
        QuantMethod::Awq,
        QuantMethod::Teq,
        QuantMethod::Gptq,
        QuantMethod::AutoRound,
        QuantMethod::SmoothQuant,
        QuantMethod::Static,
        QuantMethod::Dynamic,
        QuantMethod::Qat,
        QuantMethod::MixedPrecision,
        QuantMethod::BitsAndBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuantMethod::Rtn => "rtn",
            QuantMethod::Awq => "awq",
            QuantMethod::Teq => "teq",
            QuantMethod::Gptq => "gptq",
            QuantMethod::AutoRound => "autoround",
            QuantMethod::SmoothQuant => "smoothquant",
            QuantMethod::Static => "static",
            QuantMethod::Dynamic => "dynamic",
            QuantMethod::Qat => "qat",
            QuantMethod::MixedPrecision => "mixed_precision",
            QuantMethod::BitsAndBytes => "bitsandbytes",
        }
    }

    /// RTN, AWQ, TEQ, GPTQ and AutoRound compress weights only
    pub fn is_weight_only(&self) -> bool {
        matches!(
            self,
            QuantMethod::Rtn
                | QuantMethod::Awq
                | QuantMethod::Teq
                | QuantMethod::Gptq
                | QuantMethod::AutoRound
        )
    }

    /// Methods whose quantized layers carry activation quantization
    pub fn is_activation_quant(&self) -> bool {
        matches!(
            self,
            QuantMethod::SmoothQuant | QuantMethod::Static | QuantMethod::Dynamic | QuantMethod::Qat
        )
    }
}

impl fmt::Display for QuantMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        QuantMethod::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::UnsupportedMethod(s.to_string()))
    }
}

fn default_bits() -> u8 {
    4
}

fn default_group_size() -> i32 {
    128
}

fn default_true() -> bool {
    true
}

fn default_dataset() -> String {
    DEFAULT_CALIB_DATASET.to_string()
}

fn default_calib_iters() -> usize {
    100
}

fn default_calib_len() -> usize {
    512
}

fn default_pad_val() -> u32 {
    1
}

fn default_nsamples() -> usize {
    512
}

fn default_max_input_length() -> usize {
    2048
}

fn default_damp_percent() -> f32 {
    0.01
}

fn default_blocksize() -> usize {
    128
}

fn default_teq_lr() -> f32 {
    1e-3
}

fn default_ipex() -> String {
    "ipex".to_string()
}

fn default_backend() -> String {
    "default".to_string()
}

fn default_num_beams() -> usize {
    1
}

fn default_train_batch_size() -> usize {
    8
}

fn default_mixed_dtype() -> String {
    "bfloat16".to_string()
}

fn default_bnb_quant_type() -> String {
    "nf4".to_string()
}

fn default_recipes() -> Value {
    serde_json::json!({
        "smooth_quant": true,
        "smooth_quant_args": { "alpha": 0.5 }
    })
}

/// Fields shared by every weight-only method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightOnlyParams {
    #[serde(default = "default_bits")]
    pub bits: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_dtype: Option<WeightDtype>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_dtype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_dtype: Option<String>,

    /// Elements per quantization group; -1 means the whole input row
    #[serde(default = "default_group_size")]
    pub group_size: i32,

    #[serde(default = "default_true")]
    pub sym: bool,

    #[serde(default)]
    pub use_ggml: bool,

    #[serde(default = "default_true")]
    pub use_quant: bool,

    #[serde(default)]
    pub layer_wise: bool,

    /// Extra module names never converted, on top of the generation heads
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules_to_not_convert: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Default for WeightOnlyParams {
    fn default() -> Self {
        Self {
            bits: default_bits(),
            weight_dtype: None,
            scale_dtype: None,
            compute_dtype: None,
            group_size: default_group_size(),
            sym: true,
            use_ggml: false,
            use_quant: true,
            layer_wise: false,
            modules_to_not_convert: Vec::new(),
            device: None,
        }
    }
}

impl WeightOnlyParams {
    pub fn with_bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }

    pub fn with_weight_dtype(mut self, dtype: WeightDtype) -> Self {
        self.weight_dtype = Some(dtype);
        self
    }

    pub fn with_group_size(mut self, group_size: i32) -> Self {
        self.group_size = group_size;
        self
    }

    pub fn with_sym(mut self, sym: bool) -> Self {
        self.sym = sym;
        self
    }

    pub fn with_compute_dtype(mut self, dtype: impl Into<String>) -> Self {
        self.compute_dtype = Some(dtype.into());
        self
    }

    pub fn with_scale_dtype(mut self, dtype: impl Into<String>) -> Self {
        self.scale_dtype = Some(dtype.into());
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.sym {
            "sym"
        } else {
            "asym"
        }
    }

    pub fn resolved_scale_dtype(&self) -> ScaleDtype {
        ScaleDtype::resolve(self.scale_dtype.as_deref())
    }

    pub fn resolved_compute_dtype(&self) -> Result<ComputeDtype> {
        self.compute_dtype
            .as_deref()
            .unwrap_or("fp32")
            .parse::<ComputeDtype>()
    }

    fn validate_group_size(&self) -> Result<()> {
        if self.group_size == -1 || self.group_size >= 1 {
            Ok(())
        } else {
            Err(Error::InvalidParameter(format!(
                "group_size must be -1 or a positive integer, got {}",
                self.group_size
            )))
        }
    }

    /// Fill `weight_dtype` from `bits` when unset and keep `bits` consistent
    /// with an explicit dtype.
    fn resolve_weight_dtype(&mut self) -> Result<WeightDtype> {
        let dtype = resolve_weight_dtype(self.weight_dtype, self.bits)?;
        self.weight_dtype = Some(dtype);
        self.bits = dtype.bits();
        Ok(dtype)
    }

    fn resolve_scale_dtype(&mut self) {
        self.scale_dtype = Some(self.resolved_scale_dtype().as_str().to_string());
    }
}

/// Keys of [`CalibrationParams`] as they appear in a persisted mapping
const CALIBRATION_KEYS: &[&str] = &[
    "dataset",
    "calib_dataset",
    "calib_shuffle",
    "calib_iters",
    "calib_len",
    "calib_padding",
    "calib_pad_val",
    "nsamples",
    "max_input_length",
];

/// Keys of [`TrainParams`] as they appear in a persisted mapping
const TRAINING_KEYS: &[&str] = &[
    "train_dataset",
    "train_shuffle",
    "train_iters",
    "train_len",
    "train_padding",
    "train_pad_val",
    "train_batch_size",
];

/// Calibration dataset descriptor; calibration-only, stripped before saving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    #[serde(default = "default_dataset", alias = "calib_dataset")]
    pub dataset: String,

    #[serde(default = "default_true")]
    pub calib_shuffle: bool,

    #[serde(default = "default_calib_iters")]
    pub calib_iters: usize,

    #[serde(default = "default_calib_len")]
    pub calib_len: usize,

    #[serde(default)]
    pub calib_padding: bool,

    #[serde(default = "default_pad_val")]
    pub calib_pad_val: u32,

    #[serde(default = "default_nsamples")]
    pub nsamples: usize,

    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            calib_shuffle: true,
            calib_iters: default_calib_iters(),
            calib_len: default_calib_len(),
            calib_padding: false,
            calib_pad_val: default_pad_val(),
            nsamples: default_nsamples(),
            max_input_length: default_max_input_length(),
        }
    }
}

/// Training dataset descriptor for quantization-aware training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    #[serde(default = "default_dataset")]
    pub train_dataset: String,

    #[serde(default = "default_true")]
    pub train_shuffle: bool,

    #[serde(default = "default_calib_iters")]
    pub train_iters: usize,

    #[serde(default = "default_calib_len")]
    pub train_len: usize,

    #[serde(default = "default_true")]
    pub train_padding: bool,

    #[serde(default = "default_pad_val")]
    pub train_pad_val: u32,

    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            train_dataset: default_dataset(),
            train_shuffle: true,
            train_iters: default_calib_iters(),
            train_len: default_calib_len(),
            train_padding: true,
            train_pad_val: default_pad_val(),
            train_batch_size: default_train_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtnConfig {
    #[serde(flatten)]
    pub weight: WeightOnlyParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwqConfig {
    #[serde(flatten)]
    pub weight: WeightOnlyParams,

    #[serde(flatten)]
    pub calibration: Option<CalibrationParams>,

    /// Asymmetric quantization; takes precedence over `sym`
    #[serde(default = "default_true")]
    pub zero_point: bool,

    #[serde(default = "default_true")]
    pub auto_scale: bool,

    #[serde(default = "default_true")]
    pub mse_range: bool,
}

impl Default for AwqConfig {
    fn default() -> Self {
        Self {
            weight: WeightOnlyParams::default().with_sym(false),
            calibration: Some(CalibrationParams::default()),
            zero_point: true,
            auto_scale: true,
            mse_range: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeqConfig {
    #[serde(flatten)]
    pub weight: WeightOnlyParams,

    #[serde(flatten)]
    pub calibration: Option<CalibrationParams>,

    #[serde(default = "default_teq_lr")]
    pub lr: f32,
}

impl Default for TeqConfig {
    fn default() -> Self {
        Self {
            weight: WeightOnlyParams::default(),
            calibration: Some(CalibrationParams::default()),
            lr: default_teq_lr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptqConfig {
    #[serde(flatten)]
    pub weight: WeightOnlyParams,

    #[serde(flatten)]
    pub calibration: Option<CalibrationParams>,

    /// Quantize columns in order of decreasing Hessian diagonal
    #[serde(default)]
    pub desc_act: bool,

    #[serde(default = "default_damp_percent")]
    pub damp_percent: f32,

    #[serde(default = "default_blocksize")]
    pub blocksize: usize,

    #[serde(default)]
    pub static_groups: bool,

    #[serde(default = "default_true")]
    pub true_sequential: bool,
}

impl Default for GptqConfig {
    fn default() -> Self {
        Self {
            weight: WeightOnlyParams::default(),
            calibration: Some(CalibrationParams::default()),
            desc_act: false,
            damp_percent: default_damp_percent(),
            blocksize: default_blocksize(),
            static_groups: false,
            true_sequential: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRoundConfig {
    #[serde(flatten)]
    pub weight: WeightOnlyParams,

    #[serde(flatten)]
    pub calibration: Option<CalibrationParams>,

    /// Rounding learning rate; `None` means `1 / calib_iters`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr: Option<f32>,

    /// Clip-range learning rate; `None` means the same as `lr`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minmax_lr: Option<f32>,

    #[serde(default = "default_true")]
    pub use_quant_input: bool,
}

impl Default for AutoRoundConfig {
    fn default() -> Self {
        Self {
            weight: WeightOnlyParams::default().with_sym(false),
            calibration: Some(CalibrationParams {
                calib_len: 2048,
                calib_iters: 200,
                ..CalibrationParams::default()
            }),
            lr: None,
            minmax_lr: None,
            use_quant_input: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothQuantConfig {
    #[serde(default = "default_ipex")]
    pub backend: String,

    /// `None` lets the dispatcher decide from the architecture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipex_opt_llm: Option<bool>,

    #[serde(default = "default_num_beams")]
    pub num_beams: usize,

    #[serde(default = "default_recipes")]
    pub recipes: Value,

    #[serde(default)]
    pub excluded_precisions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_type_dict: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_name_dict: Option<Value>,

    #[serde(flatten)]
    pub calibration: Option<CalibrationParams>,
}

impl Default for SmoothQuantConfig {
    fn default() -> Self {
        Self {
            backend: default_ipex(),
            ipex_opt_llm: None,
            num_beams: default_num_beams(),
            recipes: default_recipes(),
            excluded_precisions: Vec::new(),
            op_type_dict: None,
            op_name_dict: None,
            calibration: Some(CalibrationParams::default()),
        }
    }
}

/// Smoothing strength from the `smooth_quant_args` recipe
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothAlpha {
    Fixed(f32),
    Auto,
}

impl SmoothQuantConfig {
    pub fn alpha(&self) -> SmoothAlpha {
        match self.recipes.pointer("/smooth_quant_args/alpha") {
            Some(Value::String(s)) if s == "auto" => SmoothAlpha::Auto,
            Some(v) => SmoothAlpha::Fixed(v.as_f64().unwrap_or(0.5) as f32),
            None => SmoothAlpha::Fixed(0.5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticQuantConfig {
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default)]
    pub excluded_precisions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_type_dict: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_name_dict: Option<Value>,

    #[serde(flatten)]
    pub calibration: Option<CalibrationParams>,
}

impl Default for StaticQuantConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            excluded_precisions: Vec::new(),
            op_type_dict: None,
            op_name_dict: None,
            calibration: Some(CalibrationParams::default()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicQuantConfig {
    #[serde(default)]
    pub excluded_precisions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_type_dict: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_name_dict: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QatConfig {
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default)]
    pub excluded_precisions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_type_dict: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_name_dict: Option<Value>,

    #[serde(flatten)]
    pub training: Option<TrainParams>,
}

impl Default for QatConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            excluded_precisions: Vec::new(),
            op_type_dict: None,
            op_name_dict: None,
            training: Some(TrainParams::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedPrecisionConfig {
    #[serde(default = "default_mixed_dtype")]
    pub dtype: String,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            dtype: default_mixed_dtype(),
        }
    }
}

impl MixedPrecisionConfig {
    /// `fp16`/`float16` select half precision, anything else bf16
    pub fn param_dtype(&self) -> ParamDtype {
        match self.dtype.as_str() {
            "float16" | "fp16" => ParamDtype::F16,
            _ => ParamDtype::Bf16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitsAndBytesConfig {
    #[serde(default)]
    pub load_in_4bit: bool,

    #[serde(default)]
    pub load_in_8bit: bool,

    #[serde(default = "default_bnb_quant_type")]
    pub bnb_4bit_quant_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bnb_4bit_compute_dtype: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub llm_int8_skip_modules: Vec<String>,
}

impl Default for BitsAndBytesConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            load_in_8bit: false,
            bnb_4bit_quant_type: default_bnb_quant_type(),
            bnb_4bit_compute_dtype: None,
            llm_int8_skip_modules: Vec::new(),
        }
    }
}

/// A quantization configuration; exactly one method is active per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "quant_method")]
pub enum QuantizationConfig {
    #[serde(rename = "rtn")]
    Rtn(RtnConfig),
    #[serde(rename = "awq")]
    Awq(AwqConfig),
    #[serde(rename = "teq")]
    Teq(TeqConfig),
    #[serde(rename = "gptq")]
    Gptq(GptqConfig),
    #[serde(rename = "autoround")]
    AutoRound(AutoRoundConfig),
    #[serde(rename = "smoothquant")]
    SmoothQuant(SmoothQuantConfig),
    #[serde(rename = "static")]
    Static(StaticQuantConfig),
    #[serde(rename = "dynamic")]
    Dynamic(DynamicQuantConfig),
    #[serde(rename = "qat")]
    Qat(QatConfig),
    #[serde(rename = "mixed_precision")]
    MixedPrecision(MixedPrecisionConfig),
    #[serde(rename = "bitsandbytes")]
    BitsAndBytes(BitsAndBytesConfig),
}

impl QuantizationConfig {
    /// Rebuild a config from its persisted mapping.
    ///
    /// Fails with [`Error::UnsupportedMethod`] when `quant_method` is absent
    /// or unknown and with [`Error::InvalidWeightDtype`] for an unknown
    /// `weight_dtype` string.
    pub fn from_dict(raw: &Value) -> Result<Self> {
        let obj = raw.as_object().ok_or_else(|| {
            Error::UnsupportedMethod("quantization config is not a mapping".to_string())
        })?;
        let tag = obj
            .get("quant_method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::UnsupportedMethod("missing `quant_method`".to_string()))?;
        let method: QuantMethod = tag.parse()?;

        match obj.get("weight_dtype") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => {
                s.parse::<WeightDtype>()?;
            }
            Some(other) => return Err(Error::InvalidWeightDtype(other.to_string())),
        }

        let mut normalized = obj.clone();
        // Saved configs may carry `scheme` instead of `sym`
        if !normalized.contains_key("sym") {
            if let Some(scheme) = normalized.get("scheme").and_then(Value::as_str) {
                let sym = scheme == "sym";
                normalized.insert("sym".to_string(), Value::Bool(sym));
            }
        }

        let mut config: QuantizationConfig = serde_json::from_value(Value::Object(normalized))
            .map_err(|e| Error::ConfigError(format!("invalid `{method}` config: {e}")))?;
        // Flattened optional groups deserialize as `Some(default)` even when
        // none of their keys is present
        if !CALIBRATION_KEYS.iter().any(|k| obj.contains_key(*k)) {
            config.clear_calibration();
        }
        if !TRAINING_KEYS.iter().any(|k| obj.contains_key(*k)) {
            if let QuantizationConfig::Qat(c) = &mut config {
                c.training = None;
            }
        }
        Ok(config)
    }

    fn clear_calibration(&mut self) {
        match self {
            QuantizationConfig::Awq(c) => c.calibration = None,
            QuantizationConfig::Teq(c) => c.calibration = None,
            QuantizationConfig::Gptq(c) => c.calibration = None,
            QuantizationConfig::AutoRound(c) => c.calibration = None,
            QuantizationConfig::SmoothQuant(c) => c.calibration = None,
            QuantizationConfig::Static(c) => c.calibration = None,
            _ => {}
        }
    }

    /// Serialize back to the tagged mapping, adding `scheme` for weight-only methods
    pub fn to_dict(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let (Some(weight), Some(obj)) = (self.weight_only(), value.as_object_mut()) {
            let sym = self.sym().unwrap_or(weight.sym);
            obj.insert("sym".to_string(), Value::Bool(sym));
            obj.insert(
                "scheme".to_string(),
                Value::String(if sym { "sym" } else { "asym" }.to_string()),
            );
        }
        Ok(value)
    }

    /// Write `quantization_config.json` into `dir`
    pub fn to_json_file(&self, dir: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.to_dict()?)?;
        std::fs::write(dir.as_ref().join(QUANT_CONFIG_NAME), text)?;
        Ok(())
    }

    pub fn method(&self) -> QuantMethod {
        match self {
            QuantizationConfig::Rtn(_) => QuantMethod::Rtn,
            QuantizationConfig::Awq(_) => QuantMethod::Awq,
            QuantizationConfig::Teq(_) => QuantMethod::Teq,
            QuantizationConfig::Gptq(_) => QuantMethod::Gptq,
            QuantizationConfig::AutoRound(_) => QuantMethod::AutoRound,
            QuantizationConfig::SmoothQuant(_) => QuantMethod::SmoothQuant,
            QuantizationConfig::Static(_) => QuantMethod::Static,
            QuantizationConfig::Dynamic(_) => QuantMethod::Dynamic,
            QuantizationConfig::Qat(_) => QuantMethod::Qat,
            QuantizationConfig::MixedPrecision(_) => QuantMethod::MixedPrecision,
            QuantizationConfig::BitsAndBytes(_) => QuantMethod::BitsAndBytes,
        }
    }

    pub fn weight_only(&self) -> Option<&WeightOnlyParams> {
        match self {
            QuantizationConfig::Rtn(c) => Some(&c.weight),
            QuantizationConfig::Awq(c) => Some(&c.weight),
            QuantizationConfig::Teq(c) => Some(&c.weight),
            QuantizationConfig::Gptq(c) => Some(&c.weight),
            QuantizationConfig::AutoRound(c) => Some(&c.weight),
            _ => None,
        }
    }

    pub fn weight_only_mut(&mut self) -> Option<&mut WeightOnlyParams> {
        match self {
            QuantizationConfig::Rtn(c) => Some(&mut c.weight),
            QuantizationConfig::Awq(c) => Some(&mut c.weight),
            QuantizationConfig::Teq(c) => Some(&mut c.weight),
            QuantizationConfig::Gptq(c) => Some(&mut c.weight),
            QuantizationConfig::AutoRound(c) => Some(&mut c.weight),
            _ => None,
        }
    }

    pub fn calibration(&self) -> Option<&CalibrationParams> {
        match self {
            QuantizationConfig::Awq(c) => c.calibration.as_ref(),
            QuantizationConfig::Teq(c) => c.calibration.as_ref(),
            QuantizationConfig::Gptq(c) => c.calibration.as_ref(),
            QuantizationConfig::AutoRound(c) => c.calibration.as_ref(),
            QuantizationConfig::SmoothQuant(c) => c.calibration.as_ref(),
            QuantizationConfig::Static(c) => c.calibration.as_ref(),
            _ => None,
        }
    }

    /// Whether packed layers carry symmetric codes (no zero points).
    /// AWQ's `zero_point` flag overrides `sym`.
    pub fn sym(&self) -> Option<bool> {
        match self {
            QuantizationConfig::Awq(c) => Some(!c.zero_point),
            other => other.weight_only().map(|w| w.sym),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            QuantizationConfig::BitsAndBytes(c) if c.load_in_8bit => 8,
            QuantizationConfig::BitsAndBytes(_) => 4,
            other => other.weight_only().map(|w| w.bits).unwrap_or(8),
        }
    }

    pub fn weight_dtype(&self) -> Option<WeightDtype> {
        self.weight_only().and_then(|w| w.weight_dtype)
    }

    /// Adapt a config for the fast runtime. Only RTN may take that path.
    pub fn post_init_runtime(&mut self) -> Result<()> {
        let weight = match self {
            QuantizationConfig::Rtn(c) => &mut c.weight,
            other => {
                return Err(Error::UnsupportedCombination(format!(
                    "only RTN quantization is supported by the fast runtime, got `{}`",
                    other.method()
                )))
            }
        };
        weight.resolve_weight_dtype()?;
        weight.validate_group_size()?;
        if weight.compute_dtype.is_none() {
            weight.compute_dtype = Some(ComputeDtype::Int8.as_str().to_string());
        }
        weight.resolved_compute_dtype()?;
        weight.resolve_scale_dtype();
        Ok(())
    }

    /// Resolve dtype defaults for a CPU target
    pub fn post_init_cpu(&mut self, caps: HostCapabilities) -> Result<()> {
        let Some(weight) = self.weight_only_mut() else {
            return Ok(());
        };
        let compute = match weight.compute_dtype.as_deref() {
            None => ComputeDtype::Fp32,
            Some(s) => s.parse::<ComputeDtype>()?,
        };
        let compute = match compute {
            ComputeDtype::Bf16 if !caps.bf16 => {
                tracing::warn!("host has no native bf16 support, compute_dtype downgraded to fp32");
                ComputeDtype::Fp32
            }
            ComputeDtype::Fp16 => {
                tracing::warn!("fp16 compute is not supported on CPU, compute_dtype set to fp32");
                ComputeDtype::Fp32
            }
            other => other,
        };
        weight.compute_dtype = Some(compute.as_str().to_string());
        weight.resolve_weight_dtype()?;
        weight.resolve_scale_dtype();
        weight.validate_group_size()?;
        weight.device = Some(Device::Cpu.as_str().to_string());
        Ok(())
    }

    /// Resolve dtype defaults for an XPU target (fp16 compute and scales)
    pub fn post_init_xpu(&mut self) -> Result<()> {
        let Some(weight) = self.weight_only_mut() else {
            return Ok(());
        };
        match weight.compute_dtype.as_deref() {
            None | Some("fp16") => weight.compute_dtype = Some("fp16".to_string()),
            Some(other) => {
                return Err(Error::UnsupportedCombination(format!(
                    "xpu only supports fp16 compute_dtype, got `{other}`"
                )))
            }
        }
        if weight.scale_dtype.is_none() {
            weight.scale_dtype = Some("fp16".to_string());
        }
        let dtype = weight.weight_dtype.unwrap_or(WeightDtype::Int4Fullrange);
        if dtype != WeightDtype::Int4Fullrange {
            return Err(Error::UnsupportedCombination(format!(
                "xpu only supports int4_fullrange weights, got `{dtype}`"
            )));
        }
        weight.weight_dtype = Some(dtype);
        weight.bits = dtype.bits();
        weight.validate_group_size()?;
        weight.device = Some(Device::Xpu.as_str().to_string());
        Ok(())
    }

    /// Strip calibration-only and run-only fields before persistence
    pub fn remove_redundant_parameters(&mut self) {
        self.clear_calibration();
        match self {
            QuantizationConfig::Static(c) => {
                c.excluded_precisions.clear();
                c.op_type_dict = None;
                c.op_name_dict = None;
            }
            QuantizationConfig::Dynamic(c) => {
                c.excluded_precisions.clear();
                c.op_type_dict = None;
                c.op_name_dict = None;
            }
            QuantizationConfig::Qat(c) => {
                c.training = None;
                c.excluded_precisions.clear();
                c.op_type_dict = None;
                c.op_name_dict = None;
            }
            _ => {}
        }
        if let Some(weight) = self.weight_only_mut() {
            weight.device = None;
            weight.layer_wise = false;
            weight.use_ggml = false;
        }
    }

    /// Dtype policy applied when a saved low-bit model is reloaded.
    ///
    /// Returns the resolved weight dtype; non weight-only configs have none.
    pub fn resolve_for_reload(
        &mut self,
        model_dtype: ParamDtype,
        device: Device,
        caps: HostCapabilities,
    ) -> Result<Option<WeightDtype>> {
        let Some(weight) = self.weight_only_mut() else {
            return Ok(None);
        };

        let compute = match weight.compute_dtype.as_deref() {
            None if device == Device::Xpu => "fp16",
            None => {
                let downgrade = (!caps.bf16 && model_dtype == ParamDtype::Bf16)
                    || model_dtype == ParamDtype::F16;
                if downgrade {
                    "fp32"
                } else {
                    model_dtype.short_name()
                }
            }
            Some("bf16") if !caps.bf16 => "fp32",
            Some("fp16") if device == Device::Cpu => "fp32",
            Some(other) => other,
        };
        weight.compute_dtype = Some(compute.to_string());
        weight.resolve_scale_dtype();

        let dtype = match weight.weight_dtype {
            Some(dtype) => {
                tracing::info!("{dtype} quantization weight_dtype is used");
                dtype
            }
            None => {
                let dtype = resolve_weight_dtype(None, weight.bits)?;
                tracing::info!(
                    "weight_dtype is not set, {dtype} is derived from bits={}",
                    weight.bits
                );
                dtype
            }
        };
        weight.weight_dtype = Some(dtype);
        Ok(Some(dtype))
    }
}

impl From<RtnConfig> for QuantizationConfig {
    fn from(c: RtnConfig) -> Self {
        QuantizationConfig::Rtn(c)
    }
}

impl From<AwqConfig> for QuantizationConfig {
    fn from(c: AwqConfig) -> Self {
        QuantizationConfig::Awq(c)
    }
}

impl From<TeqConfig> for QuantizationConfig {
    fn from(c: TeqConfig) -> Self {
        QuantizationConfig::Teq(c)
    }
}

impl From<GptqConfig> for QuantizationConfig {
    fn from(c: GptqConfig) -> Self {
        QuantizationConfig::Gptq(c)
    }
}

impl From<AutoRoundConfig> for QuantizationConfig {
    fn from(c: AutoRoundConfig) -> Self {
        QuantizationConfig::AutoRound(c)
    }
}

impl From<SmoothQuantConfig> for QuantizationConfig {
    fn from(c: SmoothQuantConfig) -> Self {
        QuantizationConfig::SmoothQuant(c)
    }
}

impl From<StaticQuantConfig> for QuantizationConfig {
    fn from(c: StaticQuantConfig) -> Self {
        QuantizationConfig::Static(c)
    }
}

impl From<DynamicQuantConfig> for QuantizationConfig {
    fn from(c: DynamicQuantConfig) -> Self {
        QuantizationConfig::Dynamic(c)
    }
}

impl From<QatConfig> for QuantizationConfig {
    fn from(c: QatConfig) -> Self {
        QuantizationConfig::Qat(c)
    }
}

impl From<MixedPrecisionConfig> for QuantizationConfig {
    fn from(c: MixedPrecisionConfig) -> Self {
        QuantizationConfig::MixedPrecision(c)
    }
}

impl From<BitsAndBytesConfig> for QuantizationConfig {
    fn from(c: BitsAndBytesConfig) -> Self {
        QuantizationConfig::BitsAndBytes(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_dict_rtn_example() {
        let raw = json!({
            "quant_method": "rtn",
            "bits": 4,
            "weight_dtype": null,
            "group_size": 128,
            "sym": true
        });
        let config = QuantizationConfig::from_dict(&raw).unwrap();
        assert_eq!(config.method(), QuantMethod::Rtn);
        let weight = config.weight_only().unwrap();
        assert_eq!(weight.bits, 4);
        assert_eq!(weight.group_size, 128);
        assert!(weight.sym);
        assert!(weight.weight_dtype.is_none());
    }

    #[test]
    fn test_from_dict_missing_tag_is_unsupported() {
        let err = QuantizationConfig::from_dict(&json!({"bits": 4})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMethod(_)));
    }

    #[test]
    fn test_from_dict_unknown_tag_is_unsupported() {
        let err = QuantizationConfig::from_dict(&json!({"quant_method": "hqq"})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMethod(m) if m == "hqq"));
    }

    #[test]
    fn test_from_dict_unknown_weight_dtype() {
        let raw = json!({"quant_method": "rtn", "weight_dtype": "int3"});
        let err = QuantizationConfig::from_dict(&raw).unwrap_err();
        assert!(matches!(err, Error::InvalidWeightDtype(_)));
    }

    #[test]
    fn test_from_dict_reads_scheme_when_sym_absent() {
        let raw = json!({"quant_method": "gptq", "scheme": "asym", "desc_act": true});
        let config = QuantizationConfig::from_dict(&raw).unwrap();
        assert_eq!(config.sym(), Some(false));
        match config {
            QuantizationConfig::Gptq(c) => {
                assert!(c.desc_act);
                assert_eq!(c.blocksize, 128);
                assert!((c.damp_percent - 0.01).abs() < 1e-9);
            }
            other => panic!("expected gptq, got {other:?}"),
        }
    }

    #[test]
    fn test_every_variant_round_trips_through_dict() {
        let configs: Vec<QuantizationConfig> = vec![
            RtnConfig::default().into(),
            AwqConfig::default().into(),
            TeqConfig::default().into(),
            GptqConfig::default().into(),
            AutoRoundConfig::default().into(),
            QuantizationConfig::SmoothQuant(SmoothQuantConfig::default()),
            QuantizationConfig::Static(StaticQuantConfig::default()),
            QuantizationConfig::Dynamic(DynamicQuantConfig::default()),
            QuantizationConfig::Qat(QatConfig::default()),
            QuantizationConfig::MixedPrecision(MixedPrecisionConfig::default()),
            QuantizationConfig::BitsAndBytes(BitsAndBytesConfig::default()),
        ];
        for config in configs {
            let dict = config.to_dict().unwrap();
            assert_eq!(dict["quant_method"], config.method().as_str());
            let back = QuantizationConfig::from_dict(&dict).unwrap();
            assert_eq!(back, config);
        }
    }

    #[test]
    fn test_awq_zero_point_controls_symmetry() {
        let raw = json!({"quant_method": "awq", "zero_point": false});
        let config = QuantizationConfig::from_dict(&raw).unwrap();
        assert_eq!(config.sym(), Some(true));
    }

    #[test]
    fn test_post_init_runtime_rejects_non_rtn() {
        let mut config: QuantizationConfig = GptqConfig::default().into();
        let err = config.post_init_runtime().unwrap_err();
        assert!(matches!(err, Error::UnsupportedCombination(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_post_init_runtime_fills_defaults() {
        let mut config: QuantizationConfig = RtnConfig::default().into();
        config.post_init_runtime().unwrap();
        let weight = config.weight_only().unwrap();
        assert_eq!(weight.weight_dtype, Some(WeightDtype::Int4Clip));
        assert_eq!(weight.compute_dtype.as_deref(), Some("int8"));
        assert_eq!(weight.scale_dtype.as_deref(), Some("fp32"));
    }

    #[test]
    fn test_post_init_cpu_downgrades_bf16_without_host_support() {
        let mut config: QuantizationConfig = RtnConfig {
            weight: WeightOnlyParams::default().with_compute_dtype("bf16"),
        }
        .into();
        config.post_init_cpu(HostCapabilities::new(false)).unwrap();
        assert_eq!(config.weight_only().unwrap().compute_dtype.as_deref(), Some("fp32"));

        let mut config: QuantizationConfig = RtnConfig {
            weight: WeightOnlyParams::default().with_compute_dtype("bf16"),
        }
        .into();
        config.post_init_cpu(HostCapabilities::new(true)).unwrap();
        assert_eq!(config.weight_only().unwrap().compute_dtype.as_deref(), Some("bf16"));
    }

    #[test]
    fn test_post_init_cpu_syncs_bits_with_weight_dtype() {
        let mut config: QuantizationConfig = RtnConfig {
            weight: WeightOnlyParams::default()
                .with_bits(4)
                .with_weight_dtype(WeightDtype::Int8),
        }
        .into();
        config.post_init_cpu(HostCapabilities::default()).unwrap();
        assert_eq!(config.bits(), 8);
    }

    #[test]
    fn test_post_init_cpu_rejects_bad_group_size() {
        let mut config: QuantizationConfig = RtnConfig {
            weight: WeightOnlyParams::default().with_group_size(0),
        }
        .into();
        assert!(config.post_init_cpu(HostCapabilities::default()).is_err());
    }

    #[test]
    fn test_post_init_xpu_defaults() {
        let mut config: QuantizationConfig = RtnConfig::default().into();
        config.post_init_xpu().unwrap();
        let weight = config.weight_only().unwrap();
        assert_eq!(weight.compute_dtype.as_deref(), Some("fp16"));
        assert_eq!(weight.scale_dtype.as_deref(), Some("fp16"));
        assert_eq!(weight.weight_dtype, Some(WeightDtype::Int4Fullrange));
    }

    #[test]
    fn test_stripped_config_reloads_without_calibration() {
        let mut config: QuantizationConfig = GptqConfig::default().into();
        config.remove_redundant_parameters();
        let dict = config.to_dict().unwrap();

        let back = QuantizationConfig::from_dict(&dict).unwrap();
        assert!(back.calibration().is_none());
        assert_eq!(back, config);
        let again = back.to_dict().unwrap();
        assert!(again.get("dataset").is_none());
        assert!(again.get("nsamples").is_none());

        let partial = QuantizationConfig::from_dict(
            &json!({"quant_method": "awq", "calib_iters": 4}),
        )
        .unwrap();
        assert_eq!(
            partial.calibration().map(|c| (c.calib_iters, c.calib_len)),
            Some((4, default_calib_len()))
        );
    }

    #[test]
    fn test_qat_training_group_is_absent_unless_given() {
        let bare = QuantizationConfig::from_dict(&json!({"quant_method": "qat"})).unwrap();
        let QuantizationConfig::Qat(c) = bare else {
            panic!("expected qat");
        };
        assert!(c.training.is_none());

        let given = QuantizationConfig::from_dict(
            &json!({"quant_method": "qat", "train_iters": 3}),
        )
        .unwrap();
        let QuantizationConfig::Qat(c) = given else {
            panic!("expected qat");
        };
        assert_eq!(c.training.map(|t| t.train_iters), Some(3));
    }

    #[test]
    fn test_remove_redundant_parameters_strips_calibration() {
        let mut config: QuantizationConfig = GptqConfig::default().into();
        assert!(config.calibration().is_some());
        config.remove_redundant_parameters();
        assert!(config.calibration().is_none());
        let dict = config.to_dict().unwrap();
        assert!(dict.get("dataset").is_none());
        assert!(dict.get("calib_iters").is_none());
        assert_eq!(dict["desc_act"], false);
    }

    #[test]
    fn test_resolve_for_reload_policy() {
        let caps = HostCapabilities::new(false);
        let mut config: QuantizationConfig = RtnConfig {
            weight: WeightOnlyParams::default().with_bits(8),
        }
        .into();
        let dtype = config
            .resolve_for_reload(ParamDtype::Bf16, Device::Cpu, caps)
            .unwrap();
        assert_eq!(dtype, Some(WeightDtype::Int8));
        let weight = config.weight_only().unwrap();
        assert_eq!(weight.compute_dtype.as_deref(), Some("fp32"));
        assert_eq!(weight.scale_dtype.as_deref(), Some("fp32"));
    }

    #[test]
    fn test_resolve_for_reload_keeps_explicit_weight_dtype() {
        let mut config: QuantizationConfig = RtnConfig {
            weight: WeightOnlyParams::default()
                .with_bits(8)
                .with_weight_dtype(WeightDtype::Nf4),
        }
        .into();
        let dtype = config
            .resolve_for_reload(ParamDtype::F32, Device::Cpu, HostCapabilities::default())
            .unwrap();
        assert_eq!(dtype, Some(WeightDtype::Nf4));
    }

    #[test]
    fn test_smooth_alpha_parsing() {
        let mut config = SmoothQuantConfig::default();
        assert_eq!(config.alpha(), SmoothAlpha::Fixed(0.5));
        config.recipes = json!({"smooth_quant": true, "smooth_quant_args": {"alpha": "auto"}});
        assert_eq!(config.alpha(), SmoothAlpha::Auto);
    }

    #[test]
    fn test_mixed_precision_dtype() {
        let fp16 = MixedPrecisionConfig {
            dtype: "float16".into(),
        };
        assert_eq!(fp16.param_dtype(), ParamDtype::F16);
        assert_eq!(MixedPrecisionConfig::default().param_dtype(), ParamDtype::Bf16);
    }
}
