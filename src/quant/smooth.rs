//! SmoothQuant channel smoothing
//!
//! Activation outliers are migrated into the weight with a per-input-channel
//! factor `s_j = max|X_j|^α / max|W_j|^(1-α)`: the activation is divided by
//! `s` and the weight multiplied by it, which leaves the product unchanged
//! while flattening the activation range for int8.

use super::observer::ActQuantParams;
use ndarray::{Array1, Array2, Axis};

const MIN_SMOOTH: f32 = 1e-5;

/// α values tried by the automatic search
pub const AUTO_ALPHA_GRID: [f32; 9] = [0.3, 0.35, 0.4, 0.45, 0.5, 0.55, 0.6, 0.65, 0.7];

/// Column-wise absolute maximum of a `[rows, cols]` matrix
pub fn column_absmax(m: &Array2<f32>) -> Array1<f32> {
    m.fold_axis(Axis(0), 0.0f32, |acc, &v| acc.max(v.abs()))
}

/// Smoothing factors for one layer from activation and weight channel maxima
pub fn smooth_scales(act_absmax: &Array1<f32>, weight: &Array2<f32>, alpha: f32) -> Array1<f32> {
    let w_absmax = column_absmax(weight);
    let mut s = Array1::<f32>::ones(act_absmax.len());
    for j in 0..s.len() {
        let a = act_absmax[j].max(MIN_SMOOTH);
        let w = w_absmax[j].max(MIN_SMOOTH);
        s[j] = (a.powf(alpha) / w.powf(1.0 - alpha)).max(MIN_SMOOTH);
    }
    s
}

/// Per-output-channel symmetric int8 weight quantization
pub fn quantize_weight_int8(weight: &Array2<f32>) -> (Array2<i8>, Array1<f32>) {
    let absmax = weight.fold_axis(Axis(1), 0.0f32, |acc, &v| acc.max(v.abs()));
    let scales = absmax.mapv(|m| (m / 127.0).max(1e-8));
    let mut q = Array2::<i8>::zeros(weight.dim());
    for ((r, c), v) in q.indexed_iter_mut() {
        *v = (weight[[r, c]] / scales[r]).round().clamp(-127.0, 127.0) as i8;
    }
    (q, scales)
}

/// Output error of the int8 smoothed layer against the float layer
fn smoothed_error(x: &Array2<f32>, weight: &Array2<f32>, s: &Array1<f32>) -> f32 {
    let col = s.view().insert_axis(Axis(0));
    let xs = x / &col;
    let ws = weight * &col;
    let (lo, hi) = xs
        .iter()
        .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let act = ActQuantParams::from_range(lo, hi, 8, false);
    let xq = xs.mapv(|v| act.fake_quantize(v));
    let (wq, w_scales) = quantize_weight_int8(&ws);
    let wdq = Array2::from_shape_fn(wq.dim(), |(r, c)| wq[[r, c]] as f32 * w_scales[r]);
    let diff = xq.dot(&wdq.t()) - x.dot(&weight.t());
    diff.mapv(|d| d * d).mean().unwrap_or(0.0)
}

/// Pick α from [`AUTO_ALPHA_GRID`] minimizing the int8 output error on `x`
pub fn auto_alpha(x: &Array2<f32>, weight: &Array2<f32>) -> f32 {
    let act_absmax = column_absmax(x);
    let mut best = (0.5, f32::INFINITY);
    for alpha in AUTO_ALPHA_GRID {
        let err = smoothed_error(x, weight, &smooth_scales(&act_absmax, weight, alpha));
        if err < best.1 {
            best = (alpha, err);
        }
    }
    tracing::debug!(alpha = best.0, loss = best.1, "smooth quant alpha selected");
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_alpha_half_balances_maxima() {
        let act = array![16.0f32, 1.0];
        let w = array![[1.0f32, 4.0]];
        let s = smooth_scales(&act, &w, 0.5);
        // s = sqrt(a / w)
        assert_abs_diff_eq!(s[0], 4.0, epsilon = 1e-5);
        assert_abs_diff_eq!(s[1], 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_smoothing_preserves_product() {
        let x = array![[8.0f32, 0.1], [-4.0, 0.2]];
        let w = array![[0.5f32, 1.0], [0.25, -2.0]];
        let s = smooth_scales(&column_absmax(&x), &w, 0.5);
        let col = s.view().insert_axis(Axis(0));
        let y = (&x / &col).dot(&(&w * &col).t());
        let reference = x.dot(&w.t());
        for (a, b) in y.iter().zip(reference.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_int8_weights_use_row_scales() {
        let (q, s) = quantize_weight_int8(&array![[1.27f32, -0.64], [0.0, 0.0]]);
        assert_eq!(q[[0, 0]], 127);
        assert_eq!(q[[0, 1]], -64);
        assert!(s[1] > 0.0);
    }

    #[test]
    fn test_auto_alpha_is_on_grid() {
        let x = Array2::from_shape_fn((16, 4), |(r, c)| {
            (r as f32 - 8.0) * if c == 0 { 30.0 } else { 0.1 }
        });
        let w = Array2::from_shape_fn((3, 4), |(r, c)| 0.1 * (r + c) as f32 - 0.2);
        assert!(AUTO_ALPHA_GRID.contains(&auto_alpha(&x, &w)));
    }
}
