//! AutoRound: signed-gradient search over rounding offsets and clip ranges
//!
//! Each weight gets a rounding offset `V ∈ [-0.5, 0.5]` added before rounding,
//! and each `(row, group)` gets multipliers `α` (on the max) and `β` (on the
//! min) in `[0.5, 1]`. All three are tuned with sign-SGD on the layer output
//! error; the best iterate seen is kept.

use super::granularity::{IntRange, MIN_SCALE};
use super::scheme::{quantize_weight, QuantSpec, QuantizedWeight};
use crate::optim::{Optimizer, SignSGD, TrainableParam};
use ndarray::{Array2, Zip};

const CLIP_MIN: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoRoundOptions {
    pub iters: usize,
    /// `None` → `1 / iters`
    pub lr: Option<f32>,
    /// `None` → the rounding learning rate
    pub minmax_lr: Option<f32>,
}

impl AutoRoundOptions {
    pub fn lr(&self) -> f32 {
        self.lr.unwrap_or(1.0 / self.iters.max(1) as f32)
    }

    pub fn minmax_lr(&self) -> f32 {
        self.minmax_lr.unwrap_or_else(|| self.lr())
    }
}

struct Rounding<'a> {
    weight: &'a Array2<f32>,
    spec: &'a QuantSpec,
}

/// Scales, zeros and `ds/dα`, `ds/dβ` for every `(row, group)`
struct GroupState {
    scales: Array2<f32>,
    zeros: Array2<i32>,
    ds_dalpha: Array2<f32>,
    ds_dbeta: Array2<f32>,
}

impl Rounding<'_> {
    fn group_state(&self, alpha: &Array2<f32>, beta: &Array2<f32>) -> GroupState {
        let (rows, cols) = self.weight.dim();
        let layout = self.spec.layout(cols);
        let n_groups = layout.n_groups();
        let range = IntRange::new(self.spec.bits());
        let mut st = GroupState {
            scales: Array2::zeros((rows, n_groups)),
            zeros: Array2::zeros((rows, n_groups)),
            ds_dalpha: Array2::zeros((rows, n_groups)),
            ds_dbeta: Array2::zeros((rows, n_groups)),
        };
        for r in 0..rows {
            for g in 0..n_groups {
                let cols = layout.columns(g);
                let (lo, hi) = cols
                    .map(|c| self.weight[[r, c]])
                    .fold((0.0f32, 0.0f32), |(lo, hi), v| (lo.min(v), hi.max(v)));
                let (a, b) = (alpha[[r, g]], beta[[r, g]]);
                let (raw, da, db) = if self.spec.sym {
                    let max_abs = lo.abs().max(hi);
                    let qmax = range.qmax_signed() as f32;
                    (max_abs * a / qmax, max_abs / qmax, 0.0)
                } else {
                    let qmax = range.qmax_unsigned() as f32;
                    ((hi * a - lo * b) / qmax, hi / qmax, -lo / qmax)
                };
                let scale = self.spec.round_scale(raw.max(MIN_SCALE)).max(MIN_SCALE);
                let zero = if self.spec.sym {
                    range.mid()
                } else {
                    ((-lo * b / scale).round() as i32).clamp(0, range.qmax_unsigned())
                };
                st.scales[[r, g]] = scale;
                st.zeros[[r, g]] = zero;
                st.ds_dalpha[[r, g]] = da;
                st.ds_dbeta[[r, g]] = db;
            }
        }
        st
    }

    fn codes(&self, v: &Array2<f32>, st: &GroupState) -> Array2<u8> {
        let layout = self.spec.layout(self.weight.ncols());
        let qmax = IntRange::new(self.spec.bits()).qmax_unsigned();
        Array2::from_shape_fn(self.weight.dim(), |(r, c)| {
            let g = layout.group_of(c, None);
            let s = st.scales[[r, g]];
            let q = (self.weight[[r, c]] / s + v[[r, c]]).round() as i32 + st.zeros[[r, g]];
            q.clamp(0, qmax) as u8
        })
    }

    fn quantized(
        &self,
        v: &Array2<f32>,
        alpha: &Array2<f32>,
        beta: &Array2<f32>,
    ) -> QuantizedWeight {
        let st = self.group_state(alpha, beta);
        let codes = self.codes(v, &st);
        QuantizedWeight {
            codes,
            zeros: self.spec.has_zeros().then(|| st.zeros.mapv(|z| z as u8)),
            scales: st.scales,
            g_idx: None,
        }
    }
}

/// Tune rounding for one layer against calibration inputs `x` (`[rows, in]`)
pub fn autoround_quantize(
    weight: &Array2<f32>,
    x: &Array2<f32>,
    spec: &QuantSpec,
    opts: &AutoRoundOptions,
) -> QuantizedWeight {
    if spec.codebook().is_some() {
        tracing::warn!(
            weight_dtype = %spec.weight_dtype,
            "AutoRound tunes integer rounding only, falling back to RTN for this dtype"
        );
        return quantize_weight(weight, spec, None);
    }

    let rounding = Rounding { weight, spec };
    let (rows, cols) = weight.dim();
    let n_groups = spec.layout(cols).n_groups();
    let layout = spec.layout(cols);
    let reference = x.dot(&weight.t());
    let n = (x.nrows() * rows).max(1) as f32;

    let mut v = TrainableParam::new(Array2::zeros((rows, cols)));
    let mut alpha = TrainableParam::new(Array2::ones((rows, n_groups)));
    let mut beta = TrainableParam::new(Array2::ones((rows, n_groups)));
    let mut round_opt = SignSGD::new(opts.lr());
    let mut minmax_opt = SignSGD::new(opts.minmax_lr());

    let mut best = rounding.quantized(&v.value, &alpha.value, &beta.value);
    let mut best_loss = f32::INFINITY;
    for step in 0..=opts.iters {
        let q = rounding.quantized(&v.value, &alpha.value, &beta.value);
        let deq = q.dequantize(spec);
        let residual = x.dot(&deq.t()) - &reference;
        let loss = residual.mapv(|r| r * r).sum() / n;
        if loss < best_loss {
            best_loss = loss;
            best = q;
        }
        if step == opts.iters {
            break;
        }

        // dL/d(deq) = 2/n · Rᵀ X; STE through rounding
        let g = residual.t().dot(x) * (2.0 / n);
        let st = rounding.group_state(&alpha.value, &beta.value);
        let mut grad_v = Array2::<f32>::zeros((rows, cols));
        let mut grad_a = Array2::<f32>::zeros((rows, n_groups));
        let mut grad_b = Array2::<f32>::zeros((rows, n_groups));
        Zip::indexed(&mut grad_v).for_each(|(r, c), gv| {
            let grp = layout.group_of(c, None);
            *gv = g[[r, c]] * st.scales[[r, grp]];
            // d deq / ds ≈ V under the straight-through estimate
            let dds = g[[r, c]] * v.value[[r, c]];
            grad_a[[r, grp]] += dds * st.ds_dalpha[[r, grp]];
            grad_b[[r, grp]] += dds * st.ds_dbeta[[r, grp]];
        });
        v.set_grad(grad_v);
        alpha.set_grad(grad_a);
        beta.set_grad(grad_b);
        round_opt.step(&mut [&mut v]);
        minmax_opt.step(&mut [&mut alpha, &mut beta]);
        v.value.mapv_inplace(|o| o.clamp(-0.5, 0.5));
        alpha.value.mapv_inplace(|a| a.clamp(CLIP_MIN, 1.0));
        beta.value.mapv_inplace(|b| b.clamp(CLIP_MIN, 1.0));
    }
    tracing::debug!(loss = best_loss, iters = opts.iters, "autoround finished");
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightDtype;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn data() -> (Array2<f32>, Array2<f32>) {
        let mut rng = StdRng::seed_from_u64(5);
        let w = Array2::from_shape_fn((8, 16), |_| rng.gen_range(-1.0..1.0));
        let x = Array2::from_shape_fn((32, 16), |_| rng.gen_range(-1.0..1.0));
        (w, x)
    }

    fn output_loss(w: &Array2<f32>, x: &Array2<f32>, q: &QuantizedWeight, spec: &QuantSpec) -> f32 {
        let diff = x.dot(&q.dequantize(spec).t()) - x.dot(&w.t());
        diff.mapv(|d| d * d).sum()
    }

    #[test]
    fn test_default_learning_rates() {
        let opts = AutoRoundOptions {
            iters: 200,
            lr: None,
            minmax_lr: None,
        };
        assert_eq!(opts.lr(), 1.0 / 200.0);
        assert_eq!(opts.minmax_lr(), opts.lr());
    }

    #[test]
    fn test_zero_iterations_equals_rtn() {
        let (w, x) = data();
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, false);
        let opts = AutoRoundOptions {
            iters: 0,
            lr: None,
            minmax_lr: None,
        };
        let q = autoround_quantize(&w, &x, &spec, &opts);
        let rtn = quantize_weight(&w, &spec, None);
        assert_eq!(q.codes, rtn.codes);
    }

    #[test]
    fn test_tuning_never_worse_than_rtn() {
        let (w, x) = data();
        for sym in [true, false] {
            let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, sym);
            let opts = AutoRoundOptions {
                iters: 30,
                lr: Some(0.02),
                minmax_lr: Some(0.01),
            };
            let tuned = autoround_quantize(&w, &x, &spec, &opts);
            let rtn = quantize_weight(&w, &spec, None);
            assert!(output_loss(&w, &x, &tuned, &spec) <= output_loss(&w, &x, &rtn, &spec) + 1e-4);
            assert_eq!(tuned.zeros.is_some(), !sym);
        }
    }

    #[test]
    fn test_codebook_dtype_falls_back_to_rtn() {
        let (w, x) = data();
        let spec = QuantSpec::new(WeightDtype::Nf4, 8, true);
        let opts = AutoRoundOptions {
            iters: 5,
            lr: None,
            minmax_lr: None,
        };
        assert_eq!(autoround_quantize(&w, &x, &spec, &opts), quantize_weight(&w, &spec, None));
    }
}
