//! Post-training int8 fit for SmoothQuant, static and dynamic quantization
//!
//! [`PtqFit`] is the seam the dispatcher calls; [`DefaultPtq`] is the
//! in-crate routine. Eligible dense linears are replaced by [`Int8Linear`]
//! layers with per-channel weights. Static approaches fix the activation
//! range from one calibration pass over the float model; dynamic derives it
//! per call.

mod overrides;

pub use overrides::OpOverrides;

use crate::calibration::CalibFn;
use crate::config::{QuantizationConfig, SmoothAlpha};
use crate::nn::{ActQuant, CausalLm, Int8Linear, Layer, Linear, Module};
use crate::quant::{
    auto_alpha, column_absmax, smooth_scales, ActQuantParams, Calibrator, InputCapture,
};
use crate::replace::{Exclusion, ExclusionPredicate};
use crate::{Error, Result};
use ndarray::{Array2, Axis};

/// Rows of calibration input kept per layer
pub const MAX_CALIB_ROWS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PtqApproach {
    SmoothQuant(SmoothAlpha),
    Static,
    Dynamic,
}

impl PtqApproach {
    pub fn needs_calibration(&self) -> bool {
        !matches!(self, PtqApproach::Dynamic)
    }
}

/// Settings of one fit, taken from a SmoothQuant, static or dynamic config
#[derive(Debug, Clone, PartialEq)]
pub struct PtqConf {
    pub approach: PtqApproach,
    pub backend: String,
    pub excluded_precisions: Vec<String>,
    pub overrides: OpOverrides,
}

impl PtqConf {
    pub fn from_config(qc: &QuantizationConfig) -> Result<Self> {
        let conf = match qc {
            QuantizationConfig::SmoothQuant(c) => Self {
                approach: PtqApproach::SmoothQuant(c.alpha()),
                backend: c.backend.clone(),
                excluded_precisions: c.excluded_precisions.clone(),
                overrides: OpOverrides::from_dicts(
                    c.op_type_dict.as_ref(),
                    c.op_name_dict.as_ref(),
                ),
            },
            QuantizationConfig::Static(c) => Self {
                approach: PtqApproach::Static,
                backend: c.backend.clone(),
                excluded_precisions: c.excluded_precisions.clone(),
                overrides: OpOverrides::from_dicts(
                    c.op_type_dict.as_ref(),
                    c.op_name_dict.as_ref(),
                ),
            },
            QuantizationConfig::Dynamic(c) => Self {
                approach: PtqApproach::Dynamic,
                backend: "default".to_string(),
                excluded_precisions: c.excluded_precisions.clone(),
                overrides: OpOverrides::from_dicts(
                    c.op_type_dict.as_ref(),
                    c.op_name_dict.as_ref(),
                ),
            },
            other => {
                return Err(Error::UnsupportedMethod(format!(
                    "`{}` is not a post-training int8 method",
                    other.method()
                )))
            }
        };
        Ok(conf)
    }

    pub fn excludes_bf16(&self) -> bool {
        self.excluded_precisions.iter().any(|p| p == "bf16")
    }
}

/// Post-training quantization fit routine
pub trait PtqFit {
    /// Quantize `model` in place; returns the converted layer names
    fn fit(
        &self,
        model: &mut CausalLm,
        conf: &PtqConf,
        calib: Option<&CalibFn>,
    ) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultPtq {
    pub exclusion: ExclusionPredicate,
}

fn observe_range(x: &Array2<f32>) -> ActQuantParams {
    let mut observer = Calibrator::min_max(8, false);
    match x.as_slice() {
        Some(values) => observer.observe(values),
        None => observer.observe(&x.iter().copied().collect::<Vec<_>>()),
    }
    observer.compute()
}

fn smooth_layer(linear: &Linear, x: &Array2<f32>, alpha: SmoothAlpha) -> Int8Linear {
    let alpha = match alpha {
        SmoothAlpha::Fixed(a) => a,
        SmoothAlpha::Auto => auto_alpha(x, &linear.weight),
    };
    let s = smooth_scales(&column_absmax(x), &linear.weight, alpha);
    let col = s.view().insert_axis(Axis(0));
    let weight = &linear.weight * &col;
    let act = observe_range(&(x / &col));
    Int8Linear::from_dense(&weight, linear.bias.clone(), ActQuant::Static(act), Some(s))
}

impl DefaultPtq {
    fn targets(&self, root: &Module, conf: &PtqConf) -> Vec<String> {
        root.named_modules()
            .into_iter()
            .filter(|(name, module)| {
                matches!(module.layer, Layer::Linear(_))
                    && !self.exclusion.excludes(name)
                    && !conf.overrides.keeps_fp32(name)
            })
            .map(|(name, _)| name)
            .collect()
    }
}

impl PtqFit for DefaultPtq {
    fn fit(
        &self,
        model: &mut CausalLm,
        conf: &PtqConf,
        calib: Option<&CalibFn>,
    ) -> Result<Vec<String>> {
        let targets = self.targets(&model.root, conf);
        if conf.excludes_bf16() {
            tracing::debug!("bf16 excluded from the candidate precisions");
        }

        let capture = if conf.approach.needs_calibration() {
            let calib = calib.ok_or_else(|| {
                Error::MissingCalibrationInputs(
                    "please provide the tokenizer or provide calib_func directly".to_string(),
                )
            })?;
            let mut capture = InputCapture::only(targets.iter().cloned(), MAX_CALIB_ROWS);
            calib(model, &mut capture)?;
            Some(capture)
        } else {
            None
        };

        let mut converted = Vec::with_capacity(targets.len());
        for name in &targets {
            let Some(Module {
                layer: Layer::Linear(linear),
                ..
            }) = model.root.get(name)
            else {
                continue;
            };
            let int8 = match conf.approach {
                PtqApproach::Dynamic => {
                    Int8Linear::from_dense(
                        &linear.weight,
                        linear.bias.clone(),
                        ActQuant::Dynamic,
                        None,
                    )
                }
                approach => {
                    let Some(x) = capture.as_ref().and_then(|c| c.inputs(name)) else {
                        tracing::warn!(
                            layer = %name,
                            "no calibration input reached the layer, kept dense"
                        );
                        continue;
                    };
                    match approach {
                        PtqApproach::SmoothQuant(alpha) => smooth_layer(linear, &x, alpha),
                        _ => Int8Linear::from_dense(
                            &linear.weight,
                            linear.bias.clone(),
                            ActQuant::Static(observe_range(&x)),
                            None,
                        ),
                    }
                }
            };
            model.root.replace(name, Module::new(Layer::Int8(int8)))?;
            converted.push(name.clone());
        }
        tracing::debug!(
            layers = converted.len(),
            skipped = targets.len() - converted.len(),
            "int8 fit finished"
        );
        Ok(converted)
    }
}
