//! Int8 linear layer with quantized activations
//!
//! Produced by SmoothQuant, static, dynamic and quantization-aware training.
//! Weights are per-output-channel symmetric int8; activations are quantized
//! per tensor, with parameters fixed at calibration time (static) or derived
//! from each input (dynamic).

use super::state::{StateDict, StateTensor};
use crate::config::ParamDtype;
use crate::quant::{quantize_weight_int8, ActQuantParams};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// How activations are quantized at inference
#[derive(Debug, Clone, PartialEq)]
pub enum ActQuant {
    Static(ActQuantParams),
    Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Int8Linear {
    pub in_features: usize,
    pub out_features: usize,
    /// `[out, in]`
    pub weight: Array2<i8>,
    /// One scale per output channel
    pub weight_scale: Array1<f32>,
    pub bias: Option<Array1<f32>>,
    pub act: ActQuant,
    /// SmoothQuant divisor applied to inputs before quantization
    pub smooth_scale: Option<Array1<f32>>,
}

impl Int8Linear {
    /// Quantize a dense weight; `smooth` is already folded into `weight`
    pub fn from_dense(
        weight: &Array2<f32>,
        bias: Option<Array1<f32>>,
        act: ActQuant,
        smooth_scale: Option<Array1<f32>>,
    ) -> Self {
        let (q, scales) = quantize_weight_int8(weight);
        Self {
            in_features: weight.ncols(),
            out_features: weight.nrows(),
            weight: q,
            weight_scale: scales,
            bias,
            act,
            smooth_scale,
        }
    }

    /// Zero-filled skeleton
    pub fn empty(
        in_features: usize,
        out_features: usize,
        bias: bool,
        static_act: bool,
        smooth: bool,
    ) -> Self {
        Self {
            in_features,
            out_features,
            weight: Array2::zeros((out_features, in_features)),
            weight_scale: Array1::ones(out_features),
            bias: bias.then(|| Array1::zeros(out_features)),
            act: if static_act {
                ActQuant::Static(ActQuantParams::from_range(0.0, 0.0, 8, false))
            } else {
                ActQuant::Dynamic
            },
            smooth_scale: smooth.then(|| Array1::ones(in_features)),
        }
    }

    pub fn dequantized_weight(&self) -> Array2<f32> {
        let mut w = self.weight.mapv(f32::from);
        w *= &self.weight_scale.view().insert_axis(Axis(1));
        w
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut x = x.to_owned();
        if let Some(s) = &self.smooth_scale {
            x /= &s.view().insert_axis(Axis(0));
        }
        let params = match &self.act {
            ActQuant::Static(p) => *p,
            ActQuant::Dynamic => {
                let (lo, hi) = x
                    .iter()
                    .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                ActQuantParams::from_range(lo, hi, 8, false)
            }
        };
        x.mapv_inplace(|v| params.fake_quantize(v));
        let mut y = x.dot(&self.dequantized_weight().t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        y
    }

    pub fn state_dict(&self, prefix: &str, out: &mut StateDict) {
        out.insert(
            format!("{prefix}.qweight"),
            StateTensor::i8(self.weight.shape().to_vec(), self.weight.iter().copied().collect()),
        );
        out.insert(
            format!("{prefix}.weight_scale"),
            StateTensor::from_array1(&self.weight_scale, ParamDtype::F32),
        );
        if let Some(b) = &self.bias {
            out.insert(format!("{prefix}.bias"), StateTensor::from_array1(b, ParamDtype::F32));
        }
        if let ActQuant::Static(p) = &self.act {
            out.insert(
                format!("{prefix}.act_scale"),
                StateTensor::from_f32(vec![1], &[p.scale], ParamDtype::F32),
            );
            out.insert(
                format!("{prefix}.act_zero_point"),
                StateTensor::i32(vec![1], vec![p.zero_point]),
            );
        }
        if let Some(s) = &self.smooth_scale {
            out.insert(
                format!("{prefix}.smooth_scale"),
                StateTensor::from_array1(s, ParamDtype::F32),
            );
        }
    }

    pub fn load_param(&mut self, param: &str, tensor: &StateTensor) -> Result<()> {
        match param {
            "qweight" => self.weight = tensor.to_i8_array2()?,
            "weight_scale" => self.weight_scale = tensor.to_array1()?,
            "bias" => self.bias = Some(tensor.to_array1()?),
            "smooth_scale" => self.smooth_scale = Some(tensor.to_array1()?),
            "act_scale" | "act_zero_point" => {
                let ActQuant::Static(p) = &mut self.act else {
                    return Err(Error::InvalidParameter(
                        "activation parameters given for a dynamic layer".to_string(),
                    ));
                };
                if param == "act_scale" {
                    p.scale = tensor.to_f32_vec()?.first().copied().unwrap_or(1.0);
                } else {
                    p.zero_point = tensor.as_i32()?.first().copied().unwrap_or(0);
                }
            }
            other => {
                return Err(Error::ModuleNotFound(format!("int8 linear has no parameter `{other}`")))
            }
        }
        Ok(())
    }
}
