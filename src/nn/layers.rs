//! Non-linear layers of the in-crate causal LM: embedding, layer norm and
//! pointwise activations

use super::state::{StateDict, StateTensor};
use crate::config::ParamDtype;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// `[vocab, hidden]`
    pub weight: Array2<f32>,
    pub dtype: ParamDtype,
}

impl Embedding {
    pub fn empty(vocab_size: usize, hidden_size: usize, dtype: ParamDtype) -> Self {
        Self {
            weight: Array2::zeros((vocab_size, hidden_size)),
            dtype,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.nrows()
    }

    /// Look up rows for token ids; out-of-range ids are an error
    pub fn forward(&self, ids: &[u32]) -> Result<Array2<f32>> {
        let vocab = self.vocab_size();
        let mut out = Array2::zeros((ids.len(), self.weight.ncols()));
        for (row, &id) in ids.iter().enumerate() {
            let id = id as usize;
            if id >= vocab {
                return Err(Error::InvalidParameter(format!(
                    "token id {id} out of range for vocabulary of {vocab}"
                )));
            }
            out.row_mut(row).assign(&self.weight.row(id));
        }
        Ok(out)
    }

    pub fn cast(&mut self, dtype: ParamDtype) {
        self.weight.mapv_inplace(|v| dtype.round(v));
        self.dtype = dtype;
    }

    pub fn state_dict(&self, prefix: &str, out: &mut StateDict) {
        out.insert(
            format!("{prefix}.weight"),
            StateTensor::from_array2(&self.weight, self.dtype),
        );
    }

    pub fn load_param(&mut self, param: &str, tensor: &StateTensor) -> Result<()> {
        match param {
            "weight" => {
                let dtype = self.dtype;
                self.weight = tensor.to_array2()?.mapv(|v| dtype.round(v));
                Ok(())
            }
            other => Err(Error::ModuleNotFound(format!("embedding has no parameter `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
    pub dtype: ParamDtype,
}

impl LayerNorm {
    pub fn new(hidden_size: usize, eps: f32, dtype: ParamDtype) -> Self {
        Self {
            weight: Array1::ones(hidden_size),
            bias: Array1::zeros(hidden_size),
            eps,
            dtype,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.len()
    }

    pub fn normalize(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = x.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let mean = row.mean().unwrap_or(0.0);
            let var = row.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
            let inv = 1.0 / (var + self.eps).sqrt();
            row.mapv_inplace(|v| (v - mean) * inv);
        }
        out
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = self.normalize(x);
        out *= &self.weight.view().insert_axis(Axis(0));
        out += &self.bias.view().insert_axis(Axis(0));
        out
    }

    /// Divide the affine parameters by per-channel factors, absorbing a scale
    /// that the following linear layer multiplies back in
    pub fn fold_scale(&mut self, scale: &Array1<f32>) {
        self.weight /= scale;
        self.bias /= scale;
    }

    pub fn cast(&mut self, dtype: ParamDtype) {
        self.weight.mapv_inplace(|v| dtype.round(v));
        self.bias.mapv_inplace(|v| dtype.round(v));
        self.dtype = dtype;
    }

    pub fn state_dict(&self, prefix: &str, out: &mut StateDict) {
        out.insert(format!("{prefix}.weight"), StateTensor::from_array1(&self.weight, self.dtype));
        out.insert(format!("{prefix}.bias"), StateTensor::from_array1(&self.bias, self.dtype));
    }

    pub fn load_param(&mut self, param: &str, tensor: &StateTensor) -> Result<()> {
        match param {
            "weight" => self.weight = tensor.to_array1()?,
            "bias" => self.bias = tensor.to_array1()?,
            other => {
                return Err(Error::ModuleNotFound(format!(
                    "layer norm has no parameter `{other}`"
                )))
            }
        }
        Ok(())
    }
}

/// Pointwise activation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Silu,
    Gelu,
    Relu,
}

impl Activation {
    /// Map a `hidden_act` config string; unknown names fall back to GELU
    pub fn from_name(name: &str) -> Self {
        match name {
            "silu" | "swish" => Activation::Silu,
            "relu" => Activation::Relu,
            _ => Activation::Gelu,
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Silu => x / (1.0 + (-x).exp()),
            Activation::Relu => x.max(0.0),
            Activation::Gelu => {
                let c = (2.0 / std::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044_715 * x.powi(3))).tanh())
            }
        }
    }

    /// Derivative at `x`
    pub fn grad(&self, x: f32) -> f32 {
        match self {
            Activation::Silu => {
                let s = 1.0 / (1.0 + (-x).exp());
                s * (1.0 + x * (1.0 - s))
            }
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Gelu => {
                let c = (2.0 / std::f32::consts::PI).sqrt();
                let inner = c * (x + 0.044_715 * x.powi(3));
                let t = inner.tanh();
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * c * (1.0 + 3.0 * 0.044_715 * x * x)
            }
        }
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.mapv(|v| self.apply(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_embedding_rejects_out_of_range_ids() {
        let e = Embedding::empty(4, 2, ParamDtype::F32);
        assert!(e.forward(&[1, 3]).is_ok());
        assert!(e.forward(&[4]).is_err());
    }

    #[test]
    fn test_layer_norm_rows_are_standardized() {
        let ln = LayerNorm::new(4, 1e-5, ParamDtype::F32);
        let y = ln.forward(array![[1.0f32, 2.0, 3.0, 4.0]].view());
        assert_abs_diff_eq!(y.sum(), 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(y.mapv(|v| v * v).mean().unwrap(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_fold_scale_divides_affine_params() {
        let mut ln = LayerNorm::new(2, 1e-5, ParamDtype::F32);
        ln.bias = array![1.0, 1.0];
        ln.fold_scale(&array![2.0, 4.0]);
        assert_eq!(ln.weight, array![0.5, 0.25]);
        assert_eq!(ln.bias, array![0.5, 0.25]);
    }

    #[test]
    fn test_activation_grads_match_finite_difference() {
        for act in [Activation::Silu, Activation::Gelu, Activation::Relu] {
            for x in [-1.3f32, 0.4, 2.2] {
                let h = 1e-3;
                let numeric = (act.apply(x + h) - act.apply(x - h)) / (2.0 * h);
                assert_abs_diff_eq!(act.grad(x), numeric, epsilon = 1e-2);
            }
        }
    }

    #[test]
    fn test_unknown_activation_name_is_gelu() {
        assert_eq!(Activation::from_name("gelu_new"), Activation::Gelu);
        assert_eq!(Activation::from_name("silu"), Activation::Silu);
    }
}
