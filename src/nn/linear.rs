//! Dense linear layer

use super::state::{StateDict, StateTensor};
use crate::config::ParamDtype;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// `y = x Wᵀ + b` with `W` stored `[out, in]`
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
    /// Storage precision; values are kept rounded to it
    pub dtype: ParamDtype,
    pub requires_grad: bool,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>, dtype: ParamDtype) -> Self {
        let (out_features, in_features) = weight.dim();
        let mut layer = Self {
            in_features,
            out_features,
            weight,
            bias,
            dtype: ParamDtype::F32,
            requires_grad: true,
        };
        layer.cast(dtype);
        layer
    }

    /// Zero-initialized layer, the shape-only target of a state-dict load
    pub fn empty(in_features: usize, out_features: usize, bias: bool, dtype: ParamDtype) -> Self {
        Self {
            in_features,
            out_features,
            weight: Array2::zeros((out_features, in_features)),
            bias: bias.then(|| Array1::zeros(out_features)),
            dtype,
            requires_grad: true,
        }
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// `x`: `[rows, in]` → `[rows, out]`
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        y
    }

    /// Re-round parameters to another storage precision
    pub fn cast(&mut self, dtype: ParamDtype) {
        self.weight.mapv_inplace(|v| dtype.round(v));
        if let Some(b) = &mut self.bias {
            b.mapv_inplace(|v| dtype.round(v));
        }
        self.dtype = dtype;
    }

    pub fn state_dict(&self, prefix: &str, out: &mut StateDict) {
        out.insert(
            format!("{prefix}.weight"),
            StateTensor::from_array2(&self.weight, self.dtype),
        );
        if let Some(b) = &self.bias {
            out.insert(format!("{prefix}.bias"), StateTensor::from_array1(b, self.dtype));
        }
    }

    pub fn load_param(&mut self, param: &str, tensor: &StateTensor) -> Result<()> {
        let dtype = self.dtype;
        match param {
            "weight" => self.weight = tensor.to_array2()?.mapv(|v| dtype.round(v)),
            "bias" => self.bias = Some(tensor.to_array1()?.mapv(|v| dtype.round(v))),
            other => {
                return Err(Error::ModuleNotFound(format!(
                    "linear has no parameter `{other}`"
                )))
            }
        }
        Ok(())
    }
}
