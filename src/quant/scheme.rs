//! Weight quantization scheme shared by every weight-only algorithm
//!
//! Algorithms differ in how they pick group parameters (or adjust the weight
//! before rounding); all of them end in a [`QuantizedWeight`]: unsigned codes
//! in natural column order, per-group scales, optional zero points and an
//! optional group index.

use super::codebook::Codebook;
use super::granularity::{
    dequantize_int, int_group_params, quantize_int, GroupLayout, IntRange, QuantMode,
};
use crate::config::{ScaleDtype, WeightDtype, WeightOnlyParams};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Resolved numeric description of a weight-only quantization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantSpec {
    pub weight_dtype: WeightDtype,
    pub group_size: i32,
    pub sym: bool,
    pub scale_dtype: ScaleDtype,
}

impl QuantSpec {
    pub fn new(weight_dtype: WeightDtype, group_size: i32, sym: bool) -> Self {
        Self {
            weight_dtype,
            group_size,
            sym,
            scale_dtype: ScaleDtype::Fp32,
        }
    }

    pub fn with_scale_dtype(mut self, scale_dtype: ScaleDtype) -> Self {
        self.scale_dtype = scale_dtype;
        self
    }

    /// Spec from resolved weight-only params; `sym` is passed separately since
    /// some methods derive it from their own flags.
    pub fn from_params(params: &WeightOnlyParams, sym: bool) -> Result<Self> {
        let weight_dtype = params.weight_dtype.ok_or_else(|| {
            Error::ConfigError("weight_dtype must be resolved before quantization".to_string())
        })?;
        Ok(Self {
            weight_dtype,
            group_size: params.group_size,
            sym,
            scale_dtype: params.resolved_scale_dtype(),
        })
    }

    pub fn bits(&self) -> u8 {
        self.weight_dtype.bits()
    }

    pub fn mode(&self) -> QuantMode {
        QuantMode::from_sym(self.sym)
    }

    pub fn codebook(&self) -> Option<&'static Codebook> {
        Codebook::for_dtype(self.weight_dtype)
    }

    /// Codebook formats and symmetric integers carry no zero-point buffer
    pub fn has_zeros(&self) -> bool {
        self.codebook().is_none() && !self.sym
    }

    pub fn layout(&self, in_features: usize) -> GroupLayout {
        GroupLayout::new(in_features, self.group_size)
    }

    pub fn round_scale(&self, scale: f32) -> f32 {
        self.scale_dtype.param_dtype().round(scale)
    }

    /// `(scale, zero)` for one group of values with a clip ratio
    pub fn group_params(&self, values: &[f32], clip: f32) -> (f32, i32) {
        match self.codebook() {
            Some(_) => {
                let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs())) * clip;
                let scale = self.round_scale(max_abs.max(super::granularity::MIN_SCALE));
                (scale.max(super::granularity::MIN_SCALE), 0)
            }
            None => int_group_params(values, self.bits(), self.mode(), clip, |s| {
                self.round_scale(s)
            }),
        }
    }

    pub fn encode(&self, value: f32, scale: f32, zero: i32) -> u8 {
        match self.codebook() {
            Some(cb) => cb.encode(value / scale),
            None => quantize_int(value, scale, zero, self.bits()),
        }
    }

    pub fn decode(&self, code: u8, scale: f32, zero: i32) -> f32 {
        match self.codebook() {
            Some(cb) => cb.decode(code) * scale,
            None => dequantize_int(code, scale, zero),
        }
    }

    /// Zero point implied when no zero buffer is stored
    pub fn implicit_zero(&self) -> i32 {
        match self.codebook() {
            Some(_) => 0,
            None => IntRange::new(self.bits()).mid(),
        }
    }
}

/// Result of quantizing one `[out, in]` weight matrix
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    /// Unsigned codes or codebook indices, `[out, in]`
    pub codes: Array2<u8>,
    /// `[out, n_groups]`, already rounded to the scale dtype
    pub scales: Array2<f32>,
    /// `[out, n_groups]`; asymmetric integer formats only
    pub zeros: Option<Array2<u8>>,
    /// Group of each input column when columns were reordered
    pub g_idx: Option<Vec<i32>>,
}

impl QuantizedWeight {
    pub fn out_features(&self) -> usize {
        self.codes.nrows()
    }

    pub fn in_features(&self) -> usize {
        self.codes.ncols()
    }

    pub fn zero_at(&self, spec: &QuantSpec, row: usize, group: usize) -> i32 {
        match &self.zeros {
            Some(z) => z[[row, group]] as i32,
            None => spec.implicit_zero(),
        }
    }

    /// Reconstruct the dense `[out, in]` weight
    pub fn dequantize(&self, spec: &QuantSpec) -> Array2<f32> {
        let layout = spec.layout(self.in_features());
        let g_idx = self.g_idx.as_deref();
        Array2::from_shape_fn(self.codes.dim(), |(row, col)| {
            let g = layout.group_of(col, g_idx);
            spec.decode(
                self.codes[[row, col]],
                self.scales[[row, g]],
                self.zero_at(spec, row, g),
            )
        })
    }
}

/// Per-row parameters of one group
pub fn row_group_params(
    spec: &QuantSpec,
    columns: ArrayView2<'_, f32>,
    clip: ArrayView1<'_, f32>,
) -> (Array1<f32>, Array1<i32>) {
    let rows = columns.nrows();
    let mut scales = Array1::zeros(rows);
    let mut zeros = Array1::zeros(rows);
    for (r, row) in columns.axis_iter(Axis(0)).enumerate() {
        let values: Vec<f32> = row.iter().copied().collect();
        let (s, z) = spec.group_params(&values, clip[r]);
        scales[r] = s;
        zeros[r] = z;
    }
    (scales, zeros)
}

/// Quantize `weight` (`[out, in]`) group by group.
///
/// `clip` holds one ratio per `(row, group)`; `None` keeps the full range.
pub fn quantize_weight(
    weight: &Array2<f32>,
    spec: &QuantSpec,
    clip: Option<&Array2<f32>>,
) -> QuantizedWeight {
    let (out_features, in_features) = weight.dim();
    let layout = spec.layout(in_features);
    let n_groups = layout.n_groups();

    let mut codes = Array2::<u8>::zeros((out_features, in_features));
    let mut scales = Array2::<f32>::zeros((out_features, n_groups));
    let mut zeros = Array2::<u8>::zeros((out_features, n_groups));

    for row in 0..out_features {
        for g in 0..n_groups {
            let cols = layout.columns(g);
            let values: Vec<f32> = cols.clone().map(|c| weight[[row, c]]).collect();
            let ratio = clip.map(|c| c[[row, g]]).unwrap_or(1.0);
            let (scale, zero) = spec.group_params(&values, ratio);
            scales[[row, g]] = scale;
            zeros[[row, g]] = zero.clamp(0, 255) as u8;
            for (c, &v) in cols.zip(values.iter()) {
                codes[[row, c]] = spec.encode(v, scale, zero);
            }
        }
    }

    QuantizedWeight {
        codes,
        scales,
        zeros: spec.has_zeros().then_some(zeros),
        g_idx: None,
    }
}

/// Quantize then dequantize; the fake-quantized weight an algorithm evaluates
pub fn fake_quantize_weight(
    weight: &Array2<f32>,
    spec: &QuantSpec,
    clip: Option<&Array2<f32>>,
) -> Array2<f32> {
    quantize_weight(weight, spec, clip).dequantize(spec)
}
