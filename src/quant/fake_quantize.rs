//! Fake quantization for quantization-aware training
//!
//! - Forward: quantize → dequantize, simulating rounding noise
//! - Backward: Straight-Through Estimator (STE), gradients pass unchanged
//!   inside the representable range and are zeroed outside it

use super::granularity::{IntRange, MIN_SCALE};
use ndarray::{Array1, Array2, Axis, Zip};

/// Per-output-channel integer fake quantizer for a `[out, in]` weight
#[derive(Clone, Debug, PartialEq)]
pub struct FakeQuantize {
    pub bits: u8,
    pub symmetric: bool,
    pub scales: Array1<f32>,
    pub zero_points: Array1<i32>,
    pub initialized: bool,
}

impl FakeQuantize {
    pub fn new(bits: u8, symmetric: bool) -> Self {
        Self {
            bits,
            symmetric,
            scales: Array1::zeros(0),
            zero_points: Array1::zeros(0),
            initialized: false,
        }
    }

    /// Int8 symmetric, the QAT default
    pub fn int8() -> Self {
        Self::new(8, true)
    }

    fn code_range(&self) -> (i32, i32) {
        let range = IntRange::new(self.bits);
        if self.symmetric {
            (-range.qmax_signed(), range.qmax_signed())
        } else {
            (0, range.qmax_unsigned())
        }
    }

    /// Min-max parameters per output row
    pub fn calibrate(&mut self, weight: &Array2<f32>) {
        let (qmin, qmax) = self.code_range();
        let rows = weight.nrows();
        let mut scales = Array1::zeros(rows);
        let mut zeros = Array1::zeros(rows);
        for (r, row) in weight.axis_iter(Axis(0)).enumerate() {
            let lo = row.iter().fold(0.0f32, |m, &v| m.min(v));
            let hi = row.iter().fold(0.0f32, |m, &v| m.max(v));
            if self.symmetric {
                scales[r] = (lo.abs().max(hi) / qmax as f32).max(MIN_SCALE);
            } else {
                let s = ((hi - lo) / (qmax - qmin) as f32).max(MIN_SCALE);
                scales[r] = s;
                zeros[r] = ((qmin as f32 - lo / s).round() as i32).clamp(qmin, qmax);
            }
        }
        self.scales = scales;
        self.zero_points = zeros;
        self.initialized = true;
    }

    /// Integer codes per element, in the signed or unsigned domain
    pub fn quantize(&self, weight: &Array2<f32>) -> Array2<i32> {
        let (qmin, qmax) = self.code_range();
        let mut out = Array2::<i32>::zeros(weight.dim());
        for ((r, c), q) in out.indexed_iter_mut() {
            let s = self.scales[r];
            *q = ((weight[[r, c]] / s).round() as i32 + self.zero_points[r]).clamp(qmin, qmax);
        }
        out
    }

    /// Quantize → dequantize, calibrating first when needed
    pub fn forward(&mut self, weight: &Array2<f32>) -> Array2<f32> {
        if !self.initialized || self.scales.len() != weight.nrows() {
            self.calibrate(weight);
        }
        self.apply(weight)
    }

    /// Quantize → dequantize with the current parameters
    pub fn apply(&self, weight: &Array2<f32>) -> Array2<f32> {
        let codes = self.quantize(weight);
        let mut out = Array2::<f32>::zeros(weight.dim());
        for ((r, c), v) in out.indexed_iter_mut() {
            *v = (codes[[r, c]] - self.zero_points[r]) as f32 * self.scales[r];
        }
        out
    }

    /// Clamped STE: gradient flows where the input was representable
    pub fn backward(&self, grad_output: &Array2<f32>, weight: &Array2<f32>) -> Array2<f32> {
        let (qmin, qmax) = self.code_range();
        let mut grad = grad_output.clone();
        Zip::indexed(&mut grad).and(weight).for_each(|(r, _), g, &w| {
            let s = self.scales[r];
            let z = self.zero_points[r];
            // codes within half a step of the range round onto it
            let lo = ((qmin - z) as f32 - 0.5) * s;
            let hi = ((qmax - z) as f32 + 0.5) * s;
            if w < lo || w > hi {
                *g = 0.0;
            }
        });
        grad
    }
}
