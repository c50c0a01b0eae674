//! Activation observers for static quantization
//!
//! Observers watch the inputs of a layer across calibration batches and turn
//! the observed range into activation quantization parameters:
//! - Min-Max: uses the full range of observed values
//! - Percentile: uses percentiles to be robust to outliers
//! - Moving Average: smooths min/max over batches

use super::granularity::{IntRange, MIN_SCALE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Range estimation method
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ObserverMethod {
    #[default]
    MinMax,
    /// Percentile bounds, both in percent (e.g. 0.01 and 99.99)
    Percentile { lower: f32, upper: f32 },
    /// Exponential moving average of per-batch min/max
    MovingAverage { momentum: f32 },
}

/// Scale and zero point of a per-tensor activation quantizer
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActQuantParams {
    pub scale: f32,
    pub zero_point: i32,
    pub bits: u8,
    pub symmetric: bool,
}

impl ActQuantParams {
    /// Quantize to the code domain: signed for symmetric, unsigned otherwise
    pub fn quantize(&self, x: f32) -> i32 {
        let range = IntRange::new(self.bits);
        let (lo, hi) = if self.symmetric {
            (range.qmin_signed(), range.qmax_signed())
        } else {
            (0, range.qmax_unsigned())
        };
        ((x / self.scale).round() as i32 + self.zero_point).clamp(lo, hi)
    }

    pub fn dequantize(&self, q: i32) -> f32 {
        (q - self.zero_point) as f32 * self.scale
    }

    pub fn fake_quantize(&self, x: f32) -> f32 {
        self.dequantize(self.quantize(x))
    }

    /// Params for one observed range
    pub fn from_range(min_val: f32, max_val: f32, bits: u8, symmetric: bool) -> Self {
        let range = IntRange::new(bits);
        if symmetric {
            let max_abs = min_val.abs().max(max_val.abs());
            let scale = (max_abs / range.qmax_signed() as f32).max(MIN_SCALE);
            Self {
                scale,
                zero_point: 0,
                bits,
                symmetric,
            }
        } else {
            let (lo, hi) = (min_val.min(0.0), max_val.max(0.0));
            let qmax = range.qmax_unsigned();
            let scale = ((hi - lo) / qmax as f32).max(MIN_SCALE);
            let zero_point = ((-lo / scale).round() as i32).clamp(0, qmax);
            Self {
                scale,
                zero_point,
                bits,
                symmetric,
            }
        }
    }
}

/// Collects activation statistics and computes quantization parameters
#[derive(Clone, Debug)]
pub struct Calibrator {
    method: ObserverMethod,
    symmetric: bool,
    bits: u8,
    running_min: Option<f32>,
    running_max: Option<f32>,
    samples: Vec<f32>,
    max_samples: usize,
    seen: usize,
    num_batches: usize,
    rng: StdRng,
}

impl Calibrator {
    fn with_method(method: ObserverMethod, bits: u8, symmetric: bool, max_samples: usize) -> Self {
        Self {
            method,
            symmetric,
            bits,
            running_min: None,
            running_max: None,
            samples: Vec::new(),
            max_samples,
            seen: 0,
            num_batches: 0,
            rng: StdRng::seed_from_u64(42),
        }
    }

    pub fn min_max(bits: u8, symmetric: bool) -> Self {
        Self::with_method(ObserverMethod::MinMax, bits, symmetric, 0)
    }

    /// Percentile observer keeping a reservoir of at most `max_samples` values
    pub fn percentile(
        bits: u8,
        symmetric: bool,
        lower: f32,
        upper: f32,
        max_samples: usize,
    ) -> Self {
        Self::with_method(
            ObserverMethod::Percentile { lower, upper },
            bits,
            symmetric,
            max_samples,
        )
    }

    pub fn moving_average(bits: u8, symmetric: bool, momentum: f32) -> Self {
        Self::with_method(ObserverMethod::MovingAverage { momentum }, bits, symmetric, 0)
    }

    /// Observe a batch of values
    pub fn observe(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }
        match self.method.clone() {
            ObserverMethod::MinMax => self.observe_min_max(data),
            ObserverMethod::Percentile { .. } => self.observe_percentile(data),
            ObserverMethod::MovingAverage { momentum } => {
                self.observe_moving_average(data, momentum)
            }
        }
        self.num_batches += 1;
    }

    /// Observed `(min, max)`, before conversion to params
    pub fn bounds(&self) -> (f32, f32) {
        match &self.method {
            ObserverMethod::Percentile { lower, upper } if !self.samples.is_empty() => {
                let mut sorted = self.samples.clone();
                sorted.sort_by(f32::total_cmp);
                let n = sorted.len();
                let lower_idx = ((lower / 100.0) * n as f32) as usize;
                let upper_idx = ((upper / 100.0) * n as f32).min((n - 1) as f32) as usize;
                (sorted[lower_idx.min(n - 1)], sorted[upper_idx])
            }
            _ => (self.running_min.unwrap_or(0.0), self.running_max.unwrap_or(0.0)),
        }
    }

    pub fn compute(&self) -> ActQuantParams {
        let (lo, hi) = self.bounds();
        ActQuantParams::from_range(lo, hi, self.bits, self.symmetric)
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn has_data(&self) -> bool {
        self.num_batches > 0
    }

    pub fn reset(&mut self) {
        self.running_min = None;
        self.running_max = None;
        self.samples.clear();
        self.seen = 0;
        self.num_batches = 0;
    }

    fn observe_min_max(&mut self, data: &[f32]) {
        let (batch_min, batch_max) = batch_range(data);
        self.running_min = Some(self.running_min.map_or(batch_min, |m| m.min(batch_min)));
        self.running_max = Some(self.running_max.map_or(batch_max, |m| m.max(batch_max)));
    }

    fn observe_percentile(&mut self, data: &[f32]) {
        for &v in data {
            self.seen += 1;
            if self.samples.len() < self.max_samples {
                self.samples.push(v);
            } else {
                let j = self.rng.gen_range(0..self.seen);
                if j < self.max_samples {
                    self.samples[j] = v;
                }
            }
        }
        self.observe_min_max(data);
    }

    fn observe_moving_average(&mut self, data: &[f32], momentum: f32) {
        let (batch_min, batch_max) = batch_range(data);
        self.running_min = Some(
            self.running_min
                .map_or(batch_min, |m| m * (1.0 - momentum) + batch_min * momentum),
        );
        self.running_max = Some(
            self.running_max
                .map_or(batch_max, |m| m * (1.0 - momentum) + batch_max * momentum),
        );
    }
}

fn batch_range(data: &[f32]) -> (f32, f32) {
    data.iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    // ===== Observer Tests =====

    #[test]
    fn test_min_max_tracks_extremes_across_batches() {
        let mut c = Calibrator::min_max(8, false);
        c.observe(&[0.5, 1.0]);
        c.observe(&[-2.0, 0.0]);
        assert_eq!(c.bounds(), (-2.0, 1.0));
        assert_eq!(c.num_batches(), 2);
    }

    #[test]
    fn test_empty_batch_is_ignored() {
        let mut c = Calibrator::min_max(8, true);
        c.observe(&[]);
        assert!(!c.has_data());
    }

    #[test]
    fn test_percentile_ignores_outlier() {
        let mut data: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
        data.push(1000.0);
        let mut c = Calibrator::percentile(8, true, 0.0, 99.0, 10_000);
        c.observe(&data);
        let (_, hi) = c.bounds();
        assert!(hi < 1.0);
    }

    #[test]
    fn test_percentile_reservoir_is_bounded() {
        let mut c = Calibrator::percentile(8, true, 1.0, 99.0, 64);
        for _ in 0..10 {
            c.observe(&[1.0; 100]);
        }
        assert_eq!(c.samples.len(), 64);
    }

    #[test]
    fn test_moving_average_smooths() {
        let mut c = Calibrator::moving_average(8, true, 0.5);
        c.observe(&[0.0, 2.0]);
        c.observe(&[0.0, 4.0]);
        assert_abs_diff_eq!(c.bounds().1, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut c = Calibrator::min_max(8, true);
        c.observe(&[1.0]);
        c.reset();
        assert!(!c.has_data());
        assert_eq!(c.bounds(), (0.0, 0.0));
    }

    // ===== Param Tests =====

    #[test]
    fn test_asymmetric_params_cover_zero() {
        let p = ActQuantParams::from_range(1.0, 3.0, 8, false);
        assert_eq!(p.zero_point, 0);
        assert_eq!(p.fake_quantize(0.0), 0.0);
    }

    #[test]
    fn test_symmetric_params_have_zero_offset() {
        let p = ActQuantParams::from_range(-4.0, 2.0, 8, true);
        assert_eq!(p.zero_point, 0);
        assert_abs_diff_eq!(p.scale, 4.0 / 127.0, epsilon = 1e-7);
        assert_eq!(p.quantize(100.0), 127);
        assert_eq!(p.quantize(-100.0), -128);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_fake_quant_error_within_half_step(
            data in prop::collection::vec(-10.0f32..10.0, 1..64),
            symmetric in any::<bool>(),
        ) {
            let mut c = Calibrator::min_max(8, symmetric);
            c.observe(&data);
            let p = c.compute();
            for &x in &data {
                prop_assert!((p.fake_quantize(x) - x).abs() <= p.scale * 0.5 + 1e-4);
            }
        }
    }
}
