//! GPTQ: second-order weight quantization
//!
//! Columns are quantized one at a time; the rounding error of each column is
//! pushed onto the not-yet-quantized columns through the inverse Hessian of
//! the layer's reconstruction loss, `H = 2 XᵀX / n`.

use super::scheme::{QuantSpec, QuantizedWeight};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

/// Knobs of one GPTQ run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GptqOptions {
    pub damp_percent: f32,
    pub blocksize: usize,
    /// Quantize columns by decreasing Hessian diagonal
    pub desc_act: bool,
    /// Fix group parameters before any reordering or error feedback
    pub static_groups: bool,
}

impl Default for GptqOptions {
    fn default() -> Self {
        Self {
            damp_percent: 0.01,
            blocksize: 128,
            desc_act: false,
            static_groups: false,
        }
    }
}

/// Running estimate of `2 XᵀX / n` over calibration rows
#[derive(Debug, Clone)]
pub struct HessianAccumulator {
    h: Array2<f64>,
    nsamples: usize,
    max_samples: Option<usize>,
}

impl HessianAccumulator {
    pub fn new(in_features: usize) -> Self {
        Self {
            h: Array2::zeros((in_features, in_features)),
            nsamples: 0,
            max_samples: None,
        }
    }

    /// Stop accumulating after `n` rows
    pub fn with_max_samples(mut self, n: usize) -> Self {
        self.max_samples = Some(n);
        self
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Fold a `[rows, in]` batch of layer inputs into the estimate
    pub fn add_batch(&mut self, x: ArrayView2<'_, f32>) {
        let budget = self
            .max_samples
            .map(|m| m.saturating_sub(self.nsamples))
            .unwrap_or(usize::MAX);
        let rows = x.nrows().min(budget);
        if rows == 0 {
            return;
        }
        let x = x.slice(s![..rows, ..]).mapv(f64::from);
        let total = self.nsamples + rows;
        self.h *= self.nsamples as f64 / total as f64;
        self.nsamples = total;
        let x = x * (2.0 / total as f64).sqrt();
        self.h += &x.t().dot(&x);
    }

    pub fn hessian(&self) -> &Array2<f64> {
        &self.h
    }
}

/// Lower-triangular Cholesky factor of a symmetric positive definite matrix
fn cholesky_lower(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(Error::InvalidParameter(format!(
                        "Hessian is not positive definite at column {i}; increase damp_percent"
                    )));
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Inverse of a lower-triangular matrix by forward substitution
fn invert_lower(l: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut inv = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        inv[[col, col]] = 1.0 / l[[col, col]];
        for row in (col + 1)..n {
            let mut sum = 0.0;
            for k in col..row {
                sum += l[[row, k]] * inv[[k, col]];
            }
            inv[[row, col]] = -sum / l[[row, row]];
        }
    }
    inv
}

/// Upper Cholesky factor of `H⁻¹`, the form the column loop consumes
fn inverse_hessian_upper(h: &Array2<f64>) -> Result<Array2<f64>> {
    let l_inv = invert_lower(&cholesky_lower(h)?);
    let h_inv = l_inv.t().dot(&l_inv);
    Ok(cholesky_lower(&h_inv)?.reversed_axes())
}

fn block_params(
    spec: &QuantSpec,
    w: &Array2<f64>,
    columns: impl Iterator<Item = usize> + Clone,
) -> (Array1<f32>, Array1<i32>) {
    let rows = w.nrows();
    let mut scales = Array1::zeros(rows);
    let mut zeros = Array1::zeros(rows);
    for r in 0..rows {
        let values: Vec<f32> = columns.clone().map(|c| w[[r, c]] as f32).collect();
        let (s, z) = spec.group_params(&values, 1.0);
        scales[r] = s;
        zeros[r] = z;
    }
    (scales, zeros)
}

fn store_group(
    scales: &mut Array2<f32>,
    zeros: &mut Array2<i32>,
    g: usize,
    (s, z): (Array1<f32>, Array1<i32>),
) {
    scales.column_mut(g).assign(&s);
    zeros.column_mut(g).assign(&z);
}

/// Quantize `weight` (`[out, in]`) against the accumulated Hessian
pub fn gptq_quantize(
    weight: &Array2<f32>,
    hessian: &Array2<f64>,
    spec: &QuantSpec,
    opts: &GptqOptions,
) -> Result<QuantizedWeight> {
    let (rows, cols) = weight.dim();
    if hessian.dim() != (cols, cols) {
        return Err(Error::ShapeMismatch {
            name: "hessian".to_string(),
            expected: vec![cols, cols],
            got: hessian.shape().to_vec(),
        });
    }
    let layout = spec.layout(cols);
    let group_len = layout.group_len();
    let n_groups = layout.n_groups();
    let grouped = spec.group_size > 0;

    let mut w = weight.mapv(f64::from);
    let mut h = hessian.clone();
    for i in 0..cols {
        if h[[i, i]] == 0.0 {
            h[[i, i]] = 1.0;
            w.column_mut(i).fill(0.0);
        }
    }

    let mut scales = Array2::<f32>::zeros((rows, n_groups));
    let mut zeros = Array2::<i32>::zeros((rows, n_groups));
    if !grouped {
        store_group(&mut scales, &mut zeros, 0, block_params(spec, &w, 0..cols));
    } else if opts.static_groups {
        for g in 0..n_groups {
            let params = block_params(spec, &w, layout.columns(g));
            store_group(&mut scales, &mut zeros, g, params);
        }
    }

    let perm: Vec<usize> = if opts.desc_act {
        let mut order: Vec<usize> = (0..cols).collect();
        order.sort_by(|&a, &b| h[[b, b]].total_cmp(&h[[a, a]]));
        w = w.select(Axis(1), &order);
        h = h.select(Axis(0), &order).select(Axis(1), &order);
        order
    } else {
        (0..cols).collect()
    };

    let damp = opts.damp_percent as f64 * h.diag().mean().unwrap_or(1.0);
    for i in 0..cols {
        h[[i, i]] += damp;
    }
    let h_inv = inverse_hessian_upper(&h)?;

    let group_id = |col: usize| -> usize {
        if !grouped {
            0
        } else if opts.static_groups {
            perm[col] / group_len
        } else {
            col / group_len
        }
    };

    let mut codes_perm = Array2::<u8>::zeros((rows, cols));
    let blocksize = opts.blocksize.max(1);
    let mut i1 = 0;
    while i1 < cols {
        let i2 = (i1 + blocksize).min(cols);
        let count = i2 - i1;
        let mut w1 = w.slice(s![.., i1..i2]).to_owned();
        let mut err1 = Array2::<f64>::zeros((rows, count));
        let h_inv1 = h_inv.slice(s![i1..i2, i1..i2]);

        for i in 0..count {
            let col = i1 + i;
            if grouped && !opts.static_groups && col % group_len == 0 {
                // Group parameters see the error feedback accumulated so far
                let end = (col + group_len).min(cols);
                let mut current = Array2::<f64>::zeros((rows, end - col));
                for (k, c) in (col..end).enumerate() {
                    let source = if c < i2 {
                        w1.column(c - i1)
                    } else {
                        w.column(c)
                    };
                    current.column_mut(k).assign(&source);
                }
                let params = block_params(spec, &current, 0..end - col);
                store_group(&mut scales, &mut zeros, col / group_len, params);
            }

            let g = group_id(col);
            let d = h_inv1[[i, i]];
            for r in 0..rows {
                let value = w1[[r, i]];
                let (scale, zero) = (scales[[r, g]], zeros[[r, g]]);
                let code = spec.encode(value as f32, scale, zero);
                let q = spec.decode(code, scale, zero) as f64;
                codes_perm[[r, col]] = code;
                let e = (value - q) / d;
                err1[[r, i]] = e;
                for j in i..count {
                    w1[[r, j]] -= e * h_inv1[[i, j]];
                }
            }
        }

        if i2 < cols {
            let update = err1.dot(&h_inv.slice(s![i1..i2, i2..]));
            let mut tail = w.slice_mut(s![.., i2..]);
            tail -= &update;
        }
        i1 = i2;
    }

    let mut codes = Array2::<u8>::zeros((rows, cols));
    let mut g_idx = vec![0i32; cols];
    for (col, &orig) in perm.iter().enumerate() {
        codes.column_mut(orig).assign(&codes_perm.column(col));
        g_idx[orig] = group_id(col) as i32;
    }

    Ok(QuantizedWeight {
        codes,
        scales,
        zeros: spec
            .has_zeros()
            .then(|| zeros.mapv(|z| z.clamp(0, 255) as u8)),
        g_idx: opts.desc_act.then_some(g_idx),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightDtype;
    use crate::quant::rtn::rtn_quantize;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn hessian_of(x: &Array2<f32>) -> Array2<f64> {
        let mut acc = HessianAccumulator::new(x.ncols());
        acc.add_batch(x.view());
        acc.hessian().clone()
    }

    fn output_error(x: &Array2<f32>, w: &Array2<f32>, q: &Array2<f32>) -> f32 {
        let diff = x.dot(&w.t()) - x.dot(&q.t());
        diff.mapv(|v| v * v).sum()
    }

    // ===== Linear Algebra Tests =====

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let a = ndarray::array![[4.0, 2.0], [2.0, 3.0]];
        let l = cholesky_lower(&a).unwrap();
        let back = l.dot(&l.t());
        for (x, y) in a.iter().zip(back.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = ndarray::array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky_lower(&a).is_err());
    }

    #[test]
    fn test_hessian_respects_sample_budget() {
        let mut acc = HessianAccumulator::new(3).with_max_samples(4);
        acc.add_batch(random(3, 3, 1).view());
        acc.add_batch(random(3, 3, 2).view());
        assert_eq!(acc.nsamples(), 4);
    }

    // ===== Quantization Tests =====

    #[test]
    fn test_gptq_beats_rtn_on_output_error() {
        let x = random(256, 32, 7);
        let w = random(8, 32, 11);
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, true);
        let h = hessian_of(&x);
        let gptq = gptq_quantize(&w, &h, &spec, &GptqOptions::default()).unwrap();
        let rtn = rtn_quantize(&w, &spec);
        let e_gptq = output_error(&x, &w, &gptq.dequantize(&spec));
        let e_rtn = output_error(&x, &w, &rtn.dequantize(&spec));
        assert!(e_gptq <= e_rtn, "gptq {e_gptq} vs rtn {e_rtn}");
    }

    #[test]
    fn test_desc_act_g_idx_is_valid_group_assignment() {
        let x = random(128, 24, 3);
        let w = random(4, 24, 5);
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, false);
        let opts = GptqOptions {
            desc_act: true,
            blocksize: 5,
            ..GptqOptions::default()
        };
        let q = gptq_quantize(&w, &hessian_of(&x), &spec, &opts).unwrap();
        let g_idx = q.g_idx.clone().unwrap();
        assert_eq!(g_idx.len(), 24);
        for g in 0..3 {
            assert_eq!(g_idx.iter().filter(|&&v| v == g).count(), 8);
        }
        let deq = q.dequantize(&spec);
        assert!(output_error(&x, &w, &deq).is_finite());
    }

    #[test]
    fn test_static_groups_keep_natural_assignment() {
        let x = random(64, 16, 9);
        let w = random(3, 16, 10);
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 4, true);
        let opts = GptqOptions {
            desc_act: true,
            static_groups: true,
            ..GptqOptions::default()
        };
        let q = gptq_quantize(&w, &hessian_of(&x), &spec, &opts).unwrap();
        let expected: Vec<i32> = (0..16).map(|i| i / 4).collect();
        assert_eq!(q.g_idx.unwrap(), expected);
    }

    #[test]
    fn test_dead_columns_quantize_to_zero() {
        let mut x = random(32, 6, 4);
        x.column_mut(2).fill(0.0);
        let w = random(2, 6, 8);
        let spec = QuantSpec::new(WeightDtype::Int8, -1, true);
        let q = gptq_quantize(&w, &hessian_of(&x), &spec, &GptqOptions::default()).unwrap();
        let deq = q.dequantize(&spec);
        assert_eq!(deq[[0, 2]], 0.0);
        assert_eq!(deq[[1, 2]], 0.0);
    }

    #[test]
    fn test_hessian_shape_checked() {
        let spec = QuantSpec::new(WeightDtype::Int8, -1, true);
        let err = gptq_quantize(
            &random(2, 4, 1),
            &Array2::zeros((3, 3)),
            &spec,
            &GptqOptions::default(),
        )
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
