//! Group-wise quantization granularity
//!
//! Weights are quantized per output row in groups of `group_size` consecutive
//! input columns:
//! - **Per-group**: one scale/zero-point per `group_size` columns of a row
//! - **Per-row**: `group_size == -1`, a single group spans the whole row
//!
//! Integer codes are stored unsigned. Symmetric quantization uses the implicit
//! zero point `2^(bits-1)`; asymmetric quantization records one per group.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Smallest scale ever produced; keeps all-zero groups invertible
pub const MIN_SCALE: f32 = 1e-6;

/// Quantization mode: symmetric or asymmetric
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QuantMode {
    /// Zero point fixed at the middle code, range = [-max_abs, max_abs]
    #[default]
    Symmetric,
    /// Zero point per group, range = [min, max] widened to include 0
    Asymmetric,
}

impl QuantMode {
    pub fn from_sym(sym: bool) -> Self {
        if sym {
            QuantMode::Symmetric
        } else {
            QuantMode::Asymmetric
        }
    }
}

/// How the input columns of a layer split into quantization groups
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupLayout {
    pub in_features: usize,
    pub group_size: i32,
}

impl GroupLayout {
    pub fn new(in_features: usize, group_size: i32) -> Self {
        Self {
            in_features,
            group_size,
        }
    }

    /// Columns per group; the whole row when `group_size` is -1
    pub fn group_len(&self) -> usize {
        if self.group_size <= 0 {
            self.in_features.max(1)
        } else {
            self.group_size as usize
        }
    }

    /// `ceil(in / group_size)`, or 1 for whole-row groups
    pub fn n_groups(&self) -> usize {
        if self.group_size <= 0 {
            1
        } else {
            self.in_features.div_ceil(self.group_len()).max(1)
        }
    }

    /// Column range of group `g` in natural column order
    pub fn columns(&self, g: usize) -> Range<usize> {
        let len = self.group_len();
        let start = (g * len).min(self.in_features);
        start..(start + len).min(self.in_features)
    }

    /// Group of column `col`, honouring an explicit group index when present
    pub fn group_of(&self, col: usize, g_idx: Option<&[i32]>) -> usize {
        match g_idx {
            Some(idx) => idx[col].max(0) as usize,
            None => col / self.group_len(),
        }
    }

    /// `g_idx[i] = i / group_size`, the assignment without reordering
    pub fn default_g_idx(&self) -> Vec<i32> {
        let len = self.group_len();
        (0..self.in_features).map(|i| (i / len) as i32).collect()
    }
}

/// Integer code range for a bit width
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntRange {
    pub bits: u8,
}

impl IntRange {
    pub fn new(bits: u8) -> Self {
        Self { bits }
    }

    pub fn qmax_unsigned(&self) -> i32 {
        (1i32 << self.bits) - 1
    }

    pub fn qmax_signed(&self) -> i32 {
        (1i32 << (self.bits - 1)) - 1
    }

    pub fn qmin_signed(&self) -> i32 {
        -(1i32 << (self.bits - 1))
    }

    /// Implicit zero point of symmetric codes
    pub fn mid(&self) -> i32 {
        1i32 << (self.bits - 1)
    }
}

/// Scale and zero point for one group of values.
///
/// `clip` shrinks the observed range (1.0 keeps it); `round_scale` maps the
/// scale onto its storage precision before codes are derived from it.
pub fn int_group_params(
    values: &[f32],
    bits: u8,
    mode: QuantMode,
    clip: f32,
    round_scale: impl Fn(f32) -> f32,
) -> (f32, i32) {
    let range = IntRange::new(bits);
    match mode {
        QuantMode::Symmetric => {
            let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs())) * clip;
            let scale = finalize_scale(max_abs / range.qmax_signed() as f32, &round_scale);
            (scale, range.mid())
        }
        QuantMode::Asymmetric => {
            let (min_val, max_val) = values
                .iter()
                .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let (min_val, max_val) = (min_val * clip, max_val * clip);
            let qmax = range.qmax_unsigned();
            let scale = finalize_scale((max_val - min_val) / qmax as f32, &round_scale);
            let zero = ((-min_val / scale).round() as i32).clamp(0, qmax);
            (scale, zero)
        }
    }
}

fn finalize_scale(scale: f32, round_scale: &impl Fn(f32) -> f32) -> f32 {
    let rounded = round_scale(scale.max(MIN_SCALE));
    if rounded > 0.0 {
        rounded
    } else {
        MIN_SCALE
    }
}

/// Unsigned code of `value` under `(scale, zero)`
pub fn quantize_int(value: f32, scale: f32, zero: i32, bits: u8) -> u8 {
    let qmax = IntRange::new(bits).qmax_unsigned();
    ((value / scale).round() as i32 + zero).clamp(0, qmax) as u8
}

pub fn dequantize_int(code: u8, scale: f32, zero: i32) -> f32 {
    (code as i32 - zero) as f32 * scale
}

/// Mean squared error between two equally sized buffers
pub fn quantization_mse(original: &[f32], dequantized: &[f32]) -> f32 {
    if original.len() != dequantized.len() || original.is_empty() {
        return f32::MAX;
    }

    let sum_sq: f32 = original
        .iter()
        .zip(dequantized.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum();

    sum_sq / original.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity(x: f32) -> f32 {
        x
    }

    // ===== Layout Tests =====

    #[test]
    fn test_group_count_rounds_up() {
        assert_eq!(GroupLayout::new(768, 128).n_groups(), 6);
        assert_eq!(GroupLayout::new(100, 32).n_groups(), 4);
        assert_eq!(GroupLayout::new(100, -1).n_groups(), 1);
        assert_eq!(GroupLayout::new(100, -1).group_len(), 100);
    }

    #[test]
    fn test_last_group_is_truncated() {
        let layout = GroupLayout::new(100, 32);
        assert_eq!(layout.columns(3), 96..100);
        assert_eq!(layout.group_of(99, None), 3);
    }

    #[test]
    fn test_explicit_g_idx_overrides_natural_order() {
        let layout = GroupLayout::new(4, 2);
        let g_idx = [1, 0, 1, 0];
        assert_eq!(layout.group_of(0, Some(&g_idx)), 1);
        assert_eq!(layout.default_g_idx(), vec![0, 0, 1, 1]);
    }

    // ===== Parameter Tests =====

    #[test]
    fn test_symmetric_params_use_mid_zero_point() {
        let (scale, zero) = int_group_params(
            &[-1.0, 0.5, 0.7],
            4,
            QuantMode::Symmetric,
            1.0,
            identity,
        );
        assert_eq!(zero, 8);
        assert!((scale - 1.0 / 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_asymmetric_range_includes_zero() {
        let (scale, zero) = int_group_params(
            &[1.0, 2.0, 3.0],
            4,
            QuantMode::Asymmetric,
            1.0,
            identity,
        );
        assert_eq!(zero, 0);
        assert!((scale - 3.0 / 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_shrinks_scale() {
        let values = [-2.0, 1.0, 2.0];
        let (full, _) = int_group_params(&values, 4, QuantMode::Symmetric, 1.0, identity);
        let (clipped, _) = int_group_params(&values, 4, QuantMode::Symmetric, 0.5, identity);
        assert!(clipped < full);
    }

    #[test]
    fn test_all_zero_group_has_positive_scale() {
        let (scale, _) = int_group_params(&[0.0; 8], 8, QuantMode::Asymmetric, 1.0, identity);
        assert!(scale > 0.0);
    }

    #[test]
    fn test_mse_mismatched_lengths() {
        assert_eq!(quantization_mse(&[1.0], &[1.0, 2.0]), f32::MAX);
        assert_eq!(quantization_mse(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_int_round_trip_error_bounded_by_half_scale(
            values in prop::collection::vec(-10.0f32..10.0, 1..64),
            sym in any::<bool>(),
            bits in prop::sample::select(vec![4u8, 8]),
        ) {
            let mode = QuantMode::from_sym(sym);
            let (scale, zero) = int_group_params(&values, bits, mode, 1.0, identity);
            for &v in &values {
                let code = quantize_int(v, scale, zero, bits);
                let back = dequantize_int(code, scale, zero);
                // Symmetric codes lose the top of the positive range by one step
                let tolerance = if sym { scale * 1.01 } else { scale * 0.55 };
                prop_assert!((back - v).abs() <= tolerance, "{v} -> {back} (scale {scale})");
            }
        }
    }
}
