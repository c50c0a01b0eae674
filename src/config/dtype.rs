//! Numeric data types used by quantization configs and model parameters
//!
//! Three families are kept apart on purpose:
//! - [`WeightDtype`]: storage format of quantized weights
//! - [`ScaleDtype`] / [`ComputeDtype`]: precision of scales and of the matmul
//! - [`ParamDtype`]: storage precision of dense parameters, passed explicitly
//!   to every allocation

use crate::{Error, Result};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage format of quantized weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightDtype {
    Int8,
    Int4Clip,
    Int4Fullrange,
    Nf4,
    Fp4E2m1Bnb,
    Fp4E2m1,
    Fp8E5m2,
    Fp8E4m3,
}

/// Weight dtypes that keep their compact layout on disk instead of being
/// exported to the portable integer format.
pub const EXCLUDED_WEIGHT_DTYPES: [WeightDtype; 6] = [
    WeightDtype::Fp8E5m2,
    WeightDtype::Fp8E4m3,
    WeightDtype::Nf4,
    WeightDtype::Fp4E2m1,
    WeightDtype::Fp4E2m1Bnb,
    WeightDtype::Int4Fullrange,
];

impl WeightDtype {
    pub const ALL: [WeightDtype; 8] = [
        WeightDtype::Int8,
        WeightDtype::Int4Clip,
        WeightDtype::Int4Fullrange,
        WeightDtype::Nf4,
        WeightDtype::Fp4E2m1Bnb,
        WeightDtype::Fp4E2m1,
        WeightDtype::Fp8E5m2,
        WeightDtype::Fp8E4m3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightDtype::Int8 => "int8",
            WeightDtype::Int4Clip => "int4_clip",
            WeightDtype::Int4Fullrange => "int4_fullrange",
            WeightDtype::Nf4 => "nf4",
            WeightDtype::Fp4E2m1Bnb => "fp4_e2m1_bnb",
            WeightDtype::Fp4E2m1 => "fp4_e2m1",
            WeightDtype::Fp8E5m2 => "fp8_e5m2",
            WeightDtype::Fp8E4m3 => "fp8_e4m3",
        }
    }

    /// Width of one stored code
    pub fn bits(&self) -> u8 {
        match self {
            WeightDtype::Int8 | WeightDtype::Fp8E5m2 | WeightDtype::Fp8E4m3 => 8,
            _ => 4,
        }
    }

    /// Integer formats use affine scale/zero-point quantization; the rest
    /// map each group onto a fixed codebook scaled by the group absmax.
    pub fn is_integer(&self) -> bool {
        matches!(self, WeightDtype::Int8 | WeightDtype::Int4Clip)
    }

    pub fn is_excluded(&self) -> bool {
        EXCLUDED_WEIGHT_DTYPES.contains(self)
    }

    /// Name understood by the fast runtime
    pub fn runtime_name(&self) -> &'static str {
        match self {
            WeightDtype::Int8 => "int8",
            WeightDtype::Int4Clip | WeightDtype::Int4Fullrange => "int4",
            WeightDtype::Nf4 => "nf4",
            WeightDtype::Fp4E2m1Bnb | WeightDtype::Fp4E2m1 => "fp4",
            WeightDtype::Fp8E5m2 => "fp8_e5m2",
            WeightDtype::Fp8E4m3 => "fp8_e4m3",
        }
    }
}

impl fmt::Display for WeightDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightDtype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WeightDtype::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| Error::InvalidWeightDtype(s.to_string()))
    }
}

/// Resolve the weight dtype of a config.
///
/// An explicit `weight_dtype` always wins over `bits`; otherwise 4 bits map
/// to `int4_clip` and 8 bits to `int8`.
pub fn resolve_weight_dtype(explicit: Option<WeightDtype>, bits: u8) -> Result<WeightDtype> {
    match (explicit, bits) {
        (Some(dtype), _) => Ok(dtype),
        (None, 4) => Ok(WeightDtype::Int4Clip),
        (None, 8) => Ok(WeightDtype::Int8),
        (None, other) => Err(Error::InvalidWeightDtype(format!("<unset> with bits={other}"))),
    }
}

/// Precision of per-group scales
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleDtype {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl ScaleDtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDtype::Fp32 => "fp32",
            ScaleDtype::Fp16 => "fp16",
            ScaleDtype::Bf16 => "bf16",
        }
    }

    /// Lenient parse: anything unknown (or unset) falls back to fp32.
    pub fn resolve(value: Option<&str>) -> ScaleDtype {
        match value {
            Some("fp32") | None => ScaleDtype::Fp32,
            Some("fp16") => ScaleDtype::Fp16,
            Some("bf16") => ScaleDtype::Bf16,
            Some(other) => {
                tracing::warn!("scale_dtype `{other}` is not supported, falling back to fp32");
                ScaleDtype::Fp32
            }
        }
    }

    pub fn param_dtype(&self) -> ParamDtype {
        match self {
            ScaleDtype::Fp32 => ParamDtype::F32,
            ScaleDtype::Fp16 => ParamDtype::F16,
            ScaleDtype::Bf16 => ParamDtype::Bf16,
        }
    }
}

/// Precision of the matmul in packed layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeDtype {
    #[default]
    Fp32,
    Bf16,
    Fp16,
    Int8,
}

impl ComputeDtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeDtype::Fp32 => "fp32",
            ComputeDtype::Bf16 => "bf16",
            ComputeDtype::Fp16 => "fp16",
            ComputeDtype::Int8 => "int8",
        }
    }

    /// Precision activations are rounded to; int8 accumulates in fp32
    pub fn param_dtype(&self) -> ParamDtype {
        match self {
            ComputeDtype::Fp32 | ComputeDtype::Int8 => ParamDtype::F32,
            ComputeDtype::Bf16 => ParamDtype::Bf16,
            ComputeDtype::Fp16 => ParamDtype::F16,
        }
    }
}

impl FromStr for ComputeDtype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp32" | "float32" => Ok(ComputeDtype::Fp32),
            "bf16" | "bfloat16" => Ok(ComputeDtype::Bf16),
            "fp16" | "float16" => Ok(ComputeDtype::Fp16),
            "int8" => Ok(ComputeDtype::Int8),
            other => Err(Error::ConfigError(format!(
                "compute_dtype must be one of fp32, bf16, fp16, int8, got `{other}`"
            ))),
        }
    }
}

/// Storage precision of dense parameters (`torch_dtype` in `config.json`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParamDtype {
    #[default]
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "bfloat16")]
    Bf16,
}

impl ParamDtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamDtype::F32 => "float32",
            ParamDtype::F16 => "float16",
            ParamDtype::Bf16 => "bfloat16",
        }
    }

    /// Short compute-dtype spelling (`fp32`, `fp16`, `bf16`)
    pub fn short_name(&self) -> &'static str {
        match self {
            ParamDtype::F32 => "fp32",
            ParamDtype::F16 => "fp16",
            ParamDtype::Bf16 => "bf16",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float32" | "fp32" | "float" => Some(ParamDtype::F32),
            "float16" | "fp16" | "half" => Some(ParamDtype::F16),
            "bfloat16" | "bf16" => Some(ParamDtype::Bf16),
            _ => None,
        }
    }

    pub fn size_of(&self) -> usize {
        match self {
            ParamDtype::F32 => 4,
            ParamDtype::F16 | ParamDtype::Bf16 => 2,
        }
    }

    /// Round a value to what this dtype can represent
    pub fn round(&self, x: f32) -> f32 {
        match self {
            ParamDtype::F32 => x,
            ParamDtype::F16 => f16::from_f32(x).to_f32(),
            ParamDtype::Bf16 => bf16::from_f32(x).to_f32(),
        }
    }
}

/// Target device class of a load request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Xpu,
    Cuda,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Xpu => "xpu",
            Device::Cuda => "cuda",
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" | "auto" => Ok(Device::Cpu),
            "xpu" => Ok(Device::Xpu),
            s if s.starts_with("cuda") => Ok(Device::Cuda),
            other => Err(Error::ConfigError(format!("unknown device `{other}`"))),
        }
    }
}

/// Capabilities of the host that change dtype defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    /// Native bf16 arithmetic
    pub bf16: bool,
}

impl HostCapabilities {
    pub fn new(bf16: bool) -> Self {
        Self { bf16 }
    }

    /// Detect the running host
    pub fn detect() -> Self {
        Self {
            bf16: detect_bf16(),
        }
    }
}

#[cfg(target_os = "linux")]
fn detect_bf16() -> bool {
    std::fs::read_to_string("/proc/cpuinfo")
        .map(|info| {
            info.lines()
                .filter(|line| line.starts_with("flags"))
                .any(|line| line.contains("avx512_bf16") || line.contains("amx_bf16"))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn detect_bf16() -> bool {
    false
}
