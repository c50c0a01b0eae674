//! TEQ: trainable equivalent transformation
//!
//! Learns one scale per input channel. The weight is quantized as `Q(W·s)`
//! and evaluated as `Q(W·s)/s`; the inverse scale is later folded into the
//! preceding normalization so the layer's function is unchanged.
//! Rounding is bypassed with a straight-through estimator.

use super::scheme::{fake_quantize_weight, quantize_weight, QuantSpec, QuantizedWeight};
use crate::optim::{Optimizer, TrainableParam, SGD};
use ndarray::{Array1, Array2, Axis};

/// Smallest channel scale the optimizer may reach
const MIN_CHANNEL_SCALE: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeqOptions {
    pub lr: f32,
    pub iters: usize,
}

/// Learned channel scale plus the weight quantized under it
#[derive(Debug, Clone, PartialEq)]
pub struct TeqResult {
    pub scale: Array1<f32>,
    pub quantized: QuantizedWeight,
    pub loss: f32,
}

fn effective_weight(
    weight: &Array2<f32>,
    s: &Array1<f32>,
    spec: &QuantSpec,
) -> (Array2<f32>, Array2<f32>) {
    let col = s.view().insert_axis(Axis(0));
    let q = fake_quantize_weight(&(weight * &col), spec, None);
    let eff = &q / &col;
    (q, eff)
}

fn loss_and_grad(
    weight: &Array2<f32>,
    x: &Array2<f32>,
    reference: &Array2<f32>,
    s: &Array1<f32>,
    spec: &QuantSpec,
) -> (f32, Array1<f32>) {
    let n = (x.nrows() * weight.nrows()).max(1) as f32;
    let (q, eff) = effective_weight(weight, s, spec);
    let residual = x.dot(&eff.t()) - reference;
    let loss = residual.mapv(|r| r * r).sum() / n;
    // dL/dW_eff = 2/n · Rᵀ X
    let g = residual.t().dot(x) * (2.0 / n);
    let mut grad = Array1::<f32>::zeros(s.len());
    for j in 0..s.len() {
        let sj = s[j];
        let mut acc = 0.0;
        for o in 0..weight.nrows() {
            acc += g[[o, j]] * (weight[[o, j]] / sj - q[[o, j]] / (sj * sj));
        }
        grad[j] = acc;
    }
    (loss, grad)
}

/// Optimize the channel scales of one layer against its calibration inputs
pub fn teq_quantize(
    weight: &Array2<f32>,
    x: &Array2<f32>,
    spec: &QuantSpec,
    opts: &TeqOptions,
) -> TeqResult {
    let reference = x.dot(&weight.t());
    let mut param = TrainableParam::new(Array2::ones((1, weight.ncols())));
    let mut optimizer = SGD::new(opts.lr, 0.0);

    let mut best_scale = Array1::<f32>::ones(weight.ncols());
    let mut best_loss = f32::INFINITY;
    for step in 0..=opts.iters {
        let s = param.value.row(0).to_owned();
        let (loss, grad) = loss_and_grad(weight, x, &reference, &s, spec);
        if loss < best_loss {
            best_loss = loss;
            best_scale = s;
        }
        if step == opts.iters {
            break;
        }
        param.set_grad(grad.insert_axis(Axis(0)));
        optimizer.step(&mut [&mut param]);
        param.value.mapv_inplace(|v| v.max(MIN_CHANNEL_SCALE));
    }
    tracing::debug!(loss = best_loss, iters = opts.iters, "teq scales trained");

    let scaled = weight * &best_scale.view().insert_axis(Axis(0));
    TeqResult {
        quantized: quantize_weight(&scaled, spec, None),
        scale: best_scale,
        loss: best_loss,
    }
}
