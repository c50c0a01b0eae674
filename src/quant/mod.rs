//! Quantization kernels
//!
//! Weight-only algorithms share one scheme ([`QuantSpec`] → [`QuantizedWeight`]):
//! - RTN: per-group min/max rounding
//! - AWQ: activation-aware channel scaling and clip search
//! - TEQ: trainable per-channel equivalent transformation
//! - GPTQ: Hessian-guided column-by-column rounding
//! - AutoRound: signed-gradient tuning of rounding offsets
//!
//! Activation quantization (SmoothQuant, static, dynamic, QAT) uses the
//! observers, fake quantization and int8 weight helpers.

mod autoround;
mod awq;
mod codebook;
mod fake_quantize;
mod gptq;
mod granularity;
mod observer;
pub mod pack;
mod rtn;
mod scheme;
mod smooth;
mod stats;
mod teq;

pub use autoround::{autoround_quantize, AutoRoundOptions};
pub use awq::{activation_mean, awq_search, search_clip, search_scale, AwqOptions, AwqPlan};
pub use codebook::Codebook;
pub use fake_quantize::FakeQuantize;
pub use gptq::{gptq_quantize, GptqOptions, HessianAccumulator};
pub use granularity::{quantization_mse, GroupLayout, IntRange, QuantMode, MIN_SCALE};
pub use observer::{ActQuantParams, Calibrator, ObserverMethod};
pub use rtn::{rtn_quantize, Precomputed, Rtn, WeightQuantizer};
pub use scheme::{
    fake_quantize_weight, quantize_weight, row_group_params, QuantSpec, QuantizedWeight,
};
pub use smooth::{auto_alpha, column_absmax, quantize_weight_int8, smooth_scales, AUTO_ALPHA_GRID};
pub use stats::{InputCapture, InputStats};
pub use teq::{teq_quantize, TeqOptions, TeqResult};
