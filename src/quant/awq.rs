//! AWQ: activation-aware weight quantization
//!
//! Two searches driven by calibration inputs `X` (`[rows, in]`):
//! - **Scale search**: per-input-channel scales `s = mean|X|^α`, grid over α,
//!   protecting the channels that see large activations. A layer can only use
//!   them when the scale can be folded into the preceding normalization.
//! - **Clip search**: per `(row, group)` ratio shrinking the quantization range,
//!   chosen to minimize the activation-weighted reconstruction error.

use super::scheme::{fake_quantize_weight, quantize_weight, QuantSpec, QuantizedWeight};
use ndarray::{s, Array1, Array2, Axis};

/// Grid resolution of the α search
pub const SCALE_GRID: usize = 20;
/// Clip ratios tried, from 1.0 down to `1.0 - MAX_SHRINK`
pub const CLIP_GRID: usize = 20;
pub const MAX_SHRINK: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AwqOptions {
    pub auto_scale: bool,
    pub mse_range: bool,
}

impl Default for AwqOptions {
    fn default() -> Self {
        Self {
            auto_scale: true,
            mse_range: true,
        }
    }
}

/// Outcome of the searches for one layer
#[derive(Debug, Clone, PartialEq)]
pub struct AwqPlan {
    /// Input-channel scales; the weight is multiplied by them column-wise and
    /// the preceding normalization divided by them
    pub scale: Option<Array1<f32>>,
    /// `[out, n_groups]` clip ratios
    pub clip: Array2<f32>,
}

impl AwqPlan {
    /// Weight with the channel scales applied
    pub fn scaled_weight(&self, weight: &Array2<f32>) -> Array2<f32> {
        match &self.scale {
            Some(s) => weight * &s.view().insert_axis(Axis(0)),
            None => weight.clone(),
        }
    }

    /// Quantize the scaled weight with the searched clip ratios
    pub fn quantize(&self, weight: &Array2<f32>, spec: &QuantSpec) -> QuantizedWeight {
        quantize_weight(&self.scaled_weight(weight), spec, Some(&self.clip))
    }
}

/// Mean absolute activation per input channel
pub fn activation_mean(x: &Array2<f32>) -> Array1<f32> {
    x.mapv(f32::abs)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()))
}

fn output_error(x: &Array2<f32>, reference: &Array2<f32>, weight: &Array2<f32>) -> f32 {
    let diff = x.dot(&weight.t()) - reference;
    diff.mapv(|d| d * d).mean().unwrap_or(0.0)
}

/// Grid-search the channel scale exponent.
///
/// Returns `None` when α = 0 (no scaling) wins.
pub fn search_scale(
    weight: &Array2<f32>,
    x: &Array2<f32>,
    spec: &QuantSpec,
) -> Option<Array1<f32>> {
    let reference = x.dot(&weight.t());
    let mean = activation_mean(x).mapv(|v| v.max(1e-4));

    let mut best: Option<(f32, Array1<f32>)> = None;
    let mut best_loss = output_error(x, &reference, &fake_quantize_weight(weight, spec, None));
    for step in 1..SCALE_GRID {
        let alpha = step as f32 / SCALE_GRID as f32;
        let mut s = mean.mapv(|m| m.powf(alpha));
        let max = s.fold(0.0f32, |a, &v| a.max(v));
        let min = s.fold(f32::MAX, |a, &v| a.min(v));
        let norm = (max * min).sqrt().max(1e-8);
        s.mapv_inplace(|v| v / norm);

        let col = s.view().insert_axis(Axis(0));
        let scaled = weight * &col;
        let effective = fake_quantize_weight(&scaled, spec, None) / &col;
        let loss = output_error(x, &reference, &effective);
        if loss < best_loss {
            best_loss = loss;
            best = Some((alpha, s));
        }
    }
    best.map(|(alpha, s)| {
        tracing::debug!(alpha, loss = best_loss, "awq scale selected");
        s
    })
}

/// Per `(row, group)` clip ratio minimizing `Σ (X_g (w_g - q_g))²`
pub fn search_clip(weight: &Array2<f32>, x: &Array2<f32>, spec: &QuantSpec) -> Array2<f32> {
    let (out_features, in_features) = weight.dim();
    let layout = spec.layout(in_features);
    let n_groups = layout.n_groups();

    let mut best_ratio = Array2::<f32>::ones((out_features, n_groups));
    let mut best_err = Array2::<f32>::from_elem((out_features, n_groups), f32::MAX);

    let ratios = (0..CLIP_GRID)
        .map(|i| 1.0 - MAX_SHRINK * i as f32 / CLIP_GRID as f32)
        .chain(std::iter::once(1.0 - MAX_SHRINK));
    for ratio in ratios {
        let clip = Array2::from_elem((out_features, n_groups), ratio);
        let diff = weight - &fake_quantize_weight(weight, spec, Some(&clip));
        for g in 0..n_groups {
            let cols = layout.columns(g);
            let xg = x.slice(s![.., cols.clone()]);
            let dg = diff.slice(s![.., cols]);
            let err = xg.dot(&dg.t()).mapv(|e| e * e).sum_axis(Axis(0));
            for row in 0..out_features {
                if err[row] < best_err[[row, g]] {
                    best_err[[row, g]] = err[row];
                    best_ratio[[row, g]] = ratio;
                }
            }
        }
    }
    best_ratio
}

/// Run both searches for one layer.
///
/// `foldable` says whether a channel scale can be absorbed upstream; when it
/// cannot, only the clip search runs.
pub fn awq_search(
    weight: &Array2<f32>,
    x: &Array2<f32>,
    spec: &QuantSpec,
    opts: &AwqOptions,
    foldable: bool,
) -> AwqPlan {
    let scale = if opts.auto_scale && foldable {
        search_scale(weight, x, spec)
    } else {
        None
    };
    let n_groups = spec.layout(weight.ncols()).n_groups();
    let clip = if opts.mse_range {
        let scaled = match &scale {
            Some(s) => weight * &s.view().insert_axis(Axis(0)),
            None => weight.clone(),
        };
        let x_scaled = match &scale {
            Some(s) => x / &s.view().insert_axis(Axis(0)),
            None => x.clone(),
        };
        search_clip(&scaled, &x_scaled, spec)
    } else {
        Array2::ones((weight.nrows(), n_groups))
    };
    AwqPlan { scale, clip }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightDtype;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn inputs_with_outlier_channel(rows: usize, cols: usize) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(3);
        Array2::from_shape_fn((rows, cols), |(_, c)| {
            let v: f32 = rng.gen_range(-1.0..1.0);
            if c == 0 {
                v * 40.0
            } else {
                v
            }
        })
    }

    fn weight(out: usize, inp: usize) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(4);
        Array2::from_shape_fn((out, inp), |_| rng.gen_range(-0.5..0.5))
    }

    #[test]
    fn test_activation_mean_is_per_channel() {
        let x = ndarray::array![[1.0f32, -2.0], [-3.0, 4.0]];
        assert_eq!(activation_mean(&x), ndarray::array![2.0, 3.0]);
    }

    #[test]
    fn test_clip_ratios_stay_in_grid() {
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, true);
        let clip = search_clip(&weight(4, 16), &inputs_with_outlier_channel(32, 16), &spec);
        assert_eq!(clip.dim(), (4, 2));
        assert!(clip.iter().all(|&r| (MAX_SHRINK..=1.0).contains(&r)));
    }

    #[test]
    fn test_clip_search_never_worse_than_full_range() {
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, false);
        let w = weight(4, 16);
        let x = inputs_with_outlier_channel(32, 16);
        let clip = search_clip(&w, &x, &spec);
        let reference = x.dot(&w.t());
        let full = output_error(&x, &reference, &fake_quantize_weight(&w, &spec, None));
        let searched = output_error(&x, &reference, &fake_quantize_weight(&w, &spec, Some(&clip)));
        assert!(searched <= full + 1e-6);
    }

    #[test]
    fn test_unfoldable_layer_gets_no_scale() {
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 8, true);
        let plan = awq_search(
            &weight(4, 16),
            &inputs_with_outlier_channel(32, 16),
            &spec,
            &AwqOptions::default(),
            false,
        );
        assert!(plan.scale.is_none());
    }

    #[test]
    fn test_scaled_plan_preserves_function() {
        let spec = QuantSpec::new(WeightDtype::Int8, -1, true);
        let w = weight(4, 16);
        let x = inputs_with_outlier_channel(32, 16);
        let plan = awq_search(&w, &x, &spec, &AwqOptions::default(), true);
        if let Some(s) = &plan.scale {
            let col = s.view().insert_axis(Axis(0));
            let folded_x = &x / &col;
            let y = folded_x.dot(&plan.scaled_weight(&w).t());
            let reference = x.dot(&w.t());
            for (a, b) in y.iter().zip(reference.iter()) {
                approx::assert_abs_diff_eq!(a, b, epsilon = 1e-3);
            }
        }
    }
}
