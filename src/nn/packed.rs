//! Packed low-bit linear layer
//!
//! Holds a weight-only quantized linear layer in one of two layouts:
//! - [`PackFormat::Compact`]: the in-crate layout; bytes of 4- or 8-bit codes,
//!   `i8` zero-point offsets, stored transposed (`[in, out]`-major) when
//!   `weight_transposed` is set
//! - [`PackFormat::Portable`]: the optimum/GPTQ layout of `i32` words, which
//!   third-party loaders read without this crate
//!
//! Both layouts unpack to the same [`QuantizedWeight`], so conversion between
//! them is lossless.

use super::state::{StateDict, StateTensor};
use crate::config::{ComputeDtype, ParamDtype, ScaleDtype, WeightDtype};
use crate::quant::{pack, QuantSpec, QuantizedWeight};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::fmt;

/// On-disk and in-memory layout of a packed layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackFormat {
    Compact,
    Portable,
}

impl fmt::Display for PackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackFormat::Compact => "compact",
            PackFormat::Portable => "portable",
        })
    }
}

/// Packed code buffer
#[derive(Debug, Clone, PartialEq)]
pub enum QWeight {
    Bytes(Array2<u8>),
    Words(Array2<i32>),
}

impl QWeight {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            QWeight::Bytes(a) => a.shape().to_vec(),
            QWeight::Words(a) => a.shape().to_vec(),
        }
    }
}

/// Packed zero-point buffer
#[derive(Debug, Clone, PartialEq)]
pub enum QZeros {
    /// Compact: signed offsets from the mid code
    Offsets(Array2<i8>),
    /// Portable: `zero - 1` packed along the output dimension
    Words(Array2<i32>),
}

/// Quantization parameters recovered from a packed layer, in canonical
/// `[out, ...]` orientation
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredQParams {
    pub group_size: i32,
    pub in_features: usize,
    pub out_features: usize,
    /// Columns were quantized in activation order
    pub desc_act: bool,
    pub g_idx: Option<Vec<i32>>,
    pub weight_dtype: WeightDtype,
    pub bits: u8,
    pub scale_dtype: ScaleDtype,
    pub scales: Array2<f32>,
    /// Whether explicit zero points are carried
    pub zp: bool,
    pub zeros: Option<Array2<u8>>,
    pub int_weight: Array2<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackedLinear {
    pub in_features: usize,
    pub out_features: usize,
    pub bits: u8,
    pub group_size: i32,
    pub weight_dtype: WeightDtype,
    pub scale_dtype: ScaleDtype,
    pub compute_dtype: ComputeDtype,
    pub sym: bool,
    pub format: PackFormat,
    /// Compact buffers are stored `[in, out]`-major
    pub weight_transposed: bool,
    pub qweight: QWeight,
    pub scales: Array2<f32>,
    pub qzeros: Option<QZeros>,
    pub g_idx: Option<Vec<i32>>,
    pub bias: Option<Array1<f32>>,
}

impl PackedLinear {
    /// Zero-filled layer with buffers sized for `format`.
    ///
    /// Compact layers start in the transposed layout; portable layers always
    /// carry zero points and a group index, as third-party loaders expect.
    pub fn empty(
        in_features: usize,
        out_features: usize,
        bias: bool,
        spec: &QuantSpec,
        compute_dtype: ComputeDtype,
        format: PackFormat,
    ) -> Result<Self> {
        let bits = spec.bits();
        if format == PackFormat::Portable && spec.codebook().is_some() {
            return Err(Error::UnsupportedCombination(format!(
                "the portable layout only holds integer codes, got {}",
                spec.weight_dtype
            )));
        }
        let n_groups = spec.layout(in_features).n_groups();
        let transposed = format == PackFormat::Compact;
        let (qweight, scales, qzeros, g_idx) = match format {
            PackFormat::Compact => (
                QWeight::Bytes(Array2::zeros((
                    in_features,
                    pack::compact_row_bytes(out_features, bits),
                ))),
                Array2::zeros((n_groups, out_features)),
                spec.has_zeros()
                    .then(|| QZeros::Offsets(Array2::zeros((n_groups, out_features)))),
                None,
            ),
            PackFormat::Portable => (
                QWeight::Words(Array2::zeros((
                    pack::portable_rows(in_features, bits),
                    out_features,
                ))),
                Array2::zeros((n_groups, out_features)),
                Some(QZeros::Words(Array2::zeros((
                    n_groups,
                    pack::portable_zero_cols(out_features, bits),
                )))),
                Some(vec![0; in_features]),
            ),
        };
        Ok(Self {
            in_features,
            out_features,
            bits,
            group_size: spec.group_size,
            weight_dtype: spec.weight_dtype,
            scale_dtype: spec.scale_dtype,
            compute_dtype,
            sym: spec.sym,
            format,
            weight_transposed: transposed,
            qweight,
            scales,
            qzeros,
            g_idx,
            bias: bias.then(|| Array1::zeros(out_features)),
        })
    }

    /// Same layer re-laid out for compact storage in canonical orientation
    pub fn with_transposed(mut self, transposed: bool) -> Result<Self> {
        if self.format == PackFormat::Compact && transposed != self.weight_transposed {
            let q = self.unpack()?;
            self.weight_transposed = transposed;
            let bias = self.bias.take();
            self.pack(&q, bias.as_ref())?;
        }
        Ok(self)
    }

    pub fn spec(&self) -> QuantSpec {
        QuantSpec::new(self.weight_dtype, self.group_size, self.sym)
            .with_scale_dtype(self.scale_dtype)
    }

    pub fn n_groups(&self) -> usize {
        self.spec().layout(self.in_features).n_groups()
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Allocate a group index, for skeletons whose checkpoint carries one
    pub fn ensure_g_idx(&mut self) {
        if self.g_idx.is_none() {
            self.g_idx = Some(vec![0; self.in_features]);
        }
    }

    fn check_quantized(&self, q: &QuantizedWeight) -> Result<()> {
        let expected = [self.out_features, self.in_features];
        if q.codes.shape() != expected {
            return Err(Error::ShapeMismatch {
                name: "int_weight".to_string(),
                expected: expected.to_vec(),
                got: q.codes.shape().to_vec(),
            });
        }
        let scales = [self.out_features, self.n_groups()];
        if q.scales.shape() != scales {
            return Err(Error::ShapeMismatch {
                name: "scales".to_string(),
                expected: scales.to_vec(),
                got: q.scales.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Fill the buffers from unpacked codes and parameters
    pub fn pack(&mut self, q: &QuantizedWeight, bias: Option<&Array1<f32>>) -> Result<()> {
        self.check_quantized(q)?;
        let round = self.scale_dtype.param_dtype();
        let scales = q.scales.mapv(|s| round.round(s));
        let spec = self.spec();
        let mid = spec.implicit_zero();
        match self.format {
            PackFormat::Compact => {
                let zeros = q.zeros.as_ref().map(|z| pack::zeros_to_compact(z, self.bits));
                if self.weight_transposed {
                    let codes = q.codes.t().as_standard_layout().to_owned();
                    self.qweight = QWeight::Bytes(pack::pack_compact(&codes, self.bits)?);
                    self.scales = scales.reversed_axes().as_standard_layout().to_owned();
                    self.qzeros = zeros.map(|z| {
                        QZeros::Offsets(z.reversed_axes().as_standard_layout().to_owned())
                    });
                } else {
                    self.qweight = QWeight::Bytes(pack::pack_compact(&q.codes, self.bits)?);
                    self.scales = scales;
                    self.qzeros = zeros.map(QZeros::Offsets);
                }
                self.g_idx = q.g_idx.clone();
            }
            PackFormat::Portable => {
                self.qweight = QWeight::Words(pack::pack_portable(&q.codes, self.bits)?);
                self.scales = scales.reversed_axes().as_standard_layout().to_owned();
                let zeros = match &q.zeros {
                    Some(z) => z.clone(),
                    None => Array2::from_elem((self.out_features, self.n_groups()), mid as u8),
                };
                self.qzeros = Some(QZeros::Words(pack::pack_portable_zeros(&zeros, self.bits)?));
                self.g_idx = Some(
                    q.g_idx
                        .clone()
                        .unwrap_or_else(|| spec.layout(self.in_features).default_g_idx()),
                );
            }
        }
        if let Some(b) = bias {
            self.bias = Some(b.clone());
        }
        Ok(())
    }

    /// Codes and parameters in canonical `[out, ...]` orientation
    pub fn unpack(&self) -> Result<QuantizedWeight> {
        let (codes, scales, zeros) = match (&self.format, &self.qweight) {
            (PackFormat::Compact, QWeight::Bytes(packed)) => {
                let zeros = match &self.qzeros {
                    Some(QZeros::Offsets(z)) => Some(pack::zeros_from_compact(z, self.bits)),
                    Some(QZeros::Words(_)) => return Err(self.layout_error("qzeros")),
                    None => None,
                };
                if self.weight_transposed {
                    let codes = pack::unpack_compact(packed, self.out_features, self.bits)?;
                    (
                        codes.reversed_axes().as_standard_layout().to_owned(),
                        self.scales.t().as_standard_layout().to_owned(),
                        zeros.map(|z| z.reversed_axes().as_standard_layout().to_owned()),
                    )
                } else {
                    (
                        pack::unpack_compact(packed, self.in_features, self.bits)?,
                        self.scales.clone(),
                        zeros,
                    )
                }
            }
            (PackFormat::Portable, QWeight::Words(packed)) => {
                let codes = pack::unpack_portable(packed, self.in_features, self.bits)?;
                let zeros = match &self.qzeros {
                    Some(QZeros::Words(z)) if !self.sym => Some(pack::unpack_portable_zeros(
                        z,
                        self.out_features,
                        self.bits,
                    )?),
                    Some(QZeros::Offsets(_)) => return Err(self.layout_error("qzeros")),
                    _ => None,
                };
                (codes, self.scales.t().as_standard_layout().to_owned(), zeros)
            }
            _ => return Err(self.layout_error("qweight")),
        };
        Ok(QuantizedWeight {
            codes,
            scales,
            zeros,
            g_idx: self.g_idx.clone(),
        })
    }

    fn layout_error(&self, buffer: &str) -> Error {
        Error::InvalidParameter(format!(
            "`{buffer}` buffer does not match the {} layout",
            self.format
        ))
    }

    /// Dense `[out, in]` weight
    pub fn dequantize(&self) -> Result<Array2<f32>> {
        Ok(self.unpack()?.dequantize(&self.spec()))
    }

    /// `x`: `[rows, in]` → `[rows, out]`, activations rounded to the compute dtype
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let compute = self.compute_dtype.param_dtype();
        let weight = self.dequantize()?;
        let x = x.mapv(|v| compute.round(v));
        let mut y = x.dot(&weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        if compute != ParamDtype::F32 {
            y.mapv_inplace(|v| compute.round(v));
        }
        Ok(y)
    }

    /// Everything needed to re-pack this layer in another layout
    pub fn recover_qparams(&self) -> Result<RecoveredQParams> {
        let q = self.unpack()?;
        let default = self.spec().layout(self.in_features).default_g_idx();
        let desc_act = q.g_idx.as_ref().is_some_and(|g| *g != default);
        Ok(RecoveredQParams {
            group_size: self.group_size,
            in_features: self.in_features,
            out_features: self.out_features,
            desc_act,
            g_idx: q.g_idx,
            weight_dtype: self.weight_dtype,
            bits: self.bits,
            scale_dtype: self.scale_dtype,
            scales: q.scales,
            zp: q.zeros.is_some(),
            zeros: q.zeros,
            int_weight: q.codes,
        })
    }

    pub fn state_dict(&self, prefix: &str, out: &mut StateDict) {
        let qweight = match &self.qweight {
            QWeight::Bytes(a) => StateTensor::u8(a.shape().to_vec(), a.iter().copied().collect()),
            QWeight::Words(a) => StateTensor::i32(a.shape().to_vec(), a.iter().copied().collect()),
        };
        out.insert(format!("{prefix}.qweight"), qweight);
        out.insert(
            format!("{prefix}.scales"),
            StateTensor::from_array2(&self.scales, self.scale_dtype.param_dtype()),
        );
        match &self.qzeros {
            Some(QZeros::Offsets(z)) => {
                out.insert(
                    format!("{prefix}.qzeros"),
                    StateTensor::i8(z.shape().to_vec(), z.iter().copied().collect()),
                );
            }
            Some(QZeros::Words(z)) => {
                out.insert(
                    format!("{prefix}.qzeros"),
                    StateTensor::i32(z.shape().to_vec(), z.iter().copied().collect()),
                );
            }
            None => {}
        }
        if let Some(g) = &self.g_idx {
            out.insert(format!("{prefix}.g_idx"), StateTensor::i32(vec![g.len()], g.clone()));
        }
        if let Some(b) = &self.bias {
            out.insert(format!("{prefix}.bias"), StateTensor::from_array1(b, ParamDtype::F32));
        }
    }

    pub fn load_param(&mut self, param: &str, tensor: &StateTensor) -> Result<()> {
        match param {
            "qweight" => {
                self.qweight = match self.format {
                    PackFormat::Compact => QWeight::Bytes(tensor.to_u8_array2()?),
                    PackFormat::Portable => QWeight::Words(tensor.to_i32_array2()?),
                }
            }
            "scales" => {
                let round = self.scale_dtype.param_dtype();
                self.scales = tensor.to_array2()?.mapv(|s| round.round(s));
            }
            "qzeros" => {
                self.qzeros = Some(match self.format {
                    PackFormat::Compact => QZeros::Offsets(tensor.to_i8_array2()?),
                    PackFormat::Portable => QZeros::Words(tensor.to_i32_array2()?),
                })
            }
            "g_idx" => self.g_idx = Some(tensor.as_i32()?.to_vec()),
            "bias" => self.bias = Some(tensor.to_array1()?),
            other => {
                return Err(Error::ModuleNotFound(format!(
                    "packed linear has no parameter `{other}`"
                )))
            }
        }
        Ok(())
    }

    /// Storage bytes of the packed buffers
    pub fn nbytes(&self) -> usize {
        let mut sd = StateDict::new();
        self.state_dict("", &mut sd);
        super::state::total_size(&sd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::quantize_weight;

    fn weight(out: usize, inp: usize) -> Array2<f32> {
        Array2::from_shape_fn((out, inp), |(r, c)| ((r * 7 + c * 3) as f32 * 0.13).cos())
    }

    fn packed(spec: &QuantSpec, format: PackFormat, w: &Array2<f32>) -> PackedLinear {
        let (out, inp) = w.dim();
        let mut layer = PackedLinear::empty(
            inp,
            out,
            true,
            spec,
            ComputeDtype::Fp32,
            format,
        )
        .unwrap();
        layer
            .pack(&quantize_weight(w, spec, None), Some(&Array1::ones(out)))
            .unwrap();
        layer
    }

    // ===== Layout Tests =====

    #[test]
    fn test_symmetric_compact_has_no_zero_buffer() {
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 128, true);
        let layer = PackedLinear::empty(
            768,
            3072,
            false,
            &spec,
            ComputeDtype::Fp32,
            PackFormat::Compact,
        )
            .unwrap();
        assert!(layer.qzeros.is_none());
        assert_eq!(layer.qweight.shape(), vec![768, 1536]);
        assert_eq!(layer.scales.dim(), (6, 3072));
    }

    #[test]
    fn test_portable_always_carries_zeros_and_g_idx() {
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 32, true);
        let layer = PackedLinear::empty(
            64,
            16,
            false,
            &spec,
            ComputeDtype::Fp32,
            PackFormat::Portable,
        )
            .unwrap();
        assert_eq!(layer.qweight.shape(), vec![8, 16]);
        assert!(matches!(&layer.qzeros, Some(QZeros::Words(z)) if z.dim() == (2, 2)));
        assert_eq!(layer.g_idx.as_ref().map(Vec::len), Some(64));
    }

    #[test]
    fn test_portable_rejects_codebook_dtypes() {
        let spec = QuantSpec::new(WeightDtype::Nf4, 32, true);
        let err = PackedLinear::empty(
            64,
            16,
            false,
            &spec,
            ComputeDtype::Fp32,
            PackFormat::Portable,
        );
        assert!(matches!(err, Err(Error::UnsupportedCombination(_))));
    }

    // ===== Pack/Unpack Tests =====

    #[test]
    fn test_layouts_dequantize_identically() {
        let w = weight(12, 32);
        for sym in [true, false] {
            let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, sym);
            let compact = packed(&spec, PackFormat::Compact, &w);
            let portable = packed(&spec, PackFormat::Portable, &w);
            let canonical = compact.clone().with_transposed(false).unwrap();
            assert!(compact.weight_transposed);
            assert!(!canonical.weight_transposed);
            let expected = quantize_weight(&w, &spec, None).dequantize(&spec);
            assert_eq!(compact.dequantize().unwrap(), expected);
            assert_eq!(canonical.dequantize().unwrap(), expected);
            assert_eq!(portable.dequantize().unwrap(), expected);
        }
    }

    #[test]
    fn test_unpack_returns_packed_codes() {
        let w = weight(6, 16);
        let spec = QuantSpec::new(WeightDtype::Int8, 8, false);
        let q = quantize_weight(&w, &spec, None);
        let layer = packed(&spec, PackFormat::Compact, &w);
        let back = layer.unpack().unwrap();
        assert_eq!(back.codes, q.codes);
        assert_eq!(back.zeros, q.zeros);
    }

    #[test]
    fn test_pack_rejects_wrong_shape() {
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, true);
        let mut layer = PackedLinear::empty(
            16,
            4,
            false,
            &spec,
            ComputeDtype::Fp32,
            PackFormat::Compact,
        )
            .unwrap();
        let q = quantize_weight(&weight(5, 16), &spec, None);
        assert!(matches!(layer.pack(&q, None), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_codebook_dtype_in_compact_layout() {
        let w = weight(4, 16);
        let spec = QuantSpec::new(WeightDtype::Fp8E4m3, 8, true);
        let layer = packed(&spec, PackFormat::Compact, &w);
        assert!(layer.qzeros.is_none());
        let expected = quantize_weight(&w, &spec, None).dequantize(&spec);
        assert_eq!(layer.dequantize().unwrap(), expected);
    }

    #[test]
    fn test_recover_qparams_reports_desc_act() {
        let w = weight(4, 16);
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, true);
        let mut q = quantize_weight(&w, &spec, None);
        let mut layer = PackedLinear::empty(
            16,
            4,
            false,
            &spec,
            ComputeDtype::Fp32,
            PackFormat::Compact,
        )
            .unwrap();
        layer.pack(&q, None).unwrap();
        assert!(!layer.recover_qparams().unwrap().desc_act);

        q.g_idx = Some((0..16).map(|i| (i % 2) as i32).collect());
        layer.pack(&q, None).unwrap();
        let params = layer.recover_qparams().unwrap();
        assert!(params.desc_act);
        assert!(!params.zp);
        assert_eq!(params.int_weight, q.codes);
    }

    #[test]
    fn test_forward_matches_dense_dequantized() {
        let w = weight(4, 16);
        let spec = QuantSpec::new(WeightDtype::Int8, -1, true);
        let layer = packed(&spec, PackFormat::Compact, &w);
        let x = Array2::from_elem((2, 16), 0.5f32);
        let y = layer.forward(x.view()).unwrap();
        let dense = x.dot(&layer.dequantize().unwrap().t()) + 1.0;
        assert_eq!(y, dense);
    }

    // ===== State Dict Tests =====

    #[test]
    fn test_state_dict_keys_and_dtypes() {
        let spec =
            QuantSpec::new(WeightDtype::Int4Clip, 8, false).with_scale_dtype(ScaleDtype::Fp16);
        let layer = packed(&spec, PackFormat::Compact, &weight(4, 16));
        let mut sd = StateDict::new();
        layer.state_dict("fc", &mut sd);
        let keys: Vec<&str> = sd.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["fc.bias", "fc.qweight", "fc.qzeros", "fc.scales"]);
        assert_eq!(sd["fc.scales"].dtype_name(), "F16");
        assert_eq!(sd["fc.qzeros"].dtype_name(), "I8");
    }

    #[test]
    fn test_load_state_restores_layer() {
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, false);
        let src = packed(&spec, PackFormat::Portable, &weight(8, 16));
        let mut sd = StateDict::new();
        src.state_dict("fc", &mut sd);
        let mut dst = PackedLinear::empty(
            16,
            8,
            true,
            &spec,
            ComputeDtype::Fp32,
            PackFormat::Portable,
        )
            .unwrap();
        for (key, tensor) in &sd {
            let param = key.rsplit('.').next().unwrap();
            dst.load_param(param, tensor).unwrap();
        }
        assert_eq!(dst, src);
    }
}
