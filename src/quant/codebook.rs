//! Codebook weight formats
//!
//! `nf4`, the fp4 variants, the fp8 variants and `int4_fullrange` store each
//! weight as an index into a fixed table of values normalized to `[-1, 1]`;
//! the group scale is the (clipped) absolute maximum of the group.

use crate::config::WeightDtype;
use std::sync::OnceLock;

/// NormalFloat4 quantiles
const NF4_VALUES: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// bitsandbytes FP4 table, in code order
const FP4_BNB_VALUES: [f32; 16] = [
    0.0,
    0.005_208_333,
    0.666_666_7,
    1.0,
    0.333_333_34,
    0.5,
    0.166_666_67,
    0.25,
    -0.0,
    -0.005_208_333,
    -0.666_666_7,
    -1.0,
    -0.333_333_34,
    -0.5,
    -0.166_666_67,
    -0.25,
];

/// A lookup table of representable values plus a sorted index for encoding
#[derive(Debug, Clone)]
pub struct Codebook {
    values: Vec<f32>,
    sorted: Vec<(f32, u8)>,
}

impl Codebook {
    /// Build from per-code values; NaN marks codes that are never produced
    fn from_values(values: Vec<f32>) -> Self {
        let mut sorted: Vec<(f32, u8)> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(code, &v)| (v, code as u8))
            .collect();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { values, sorted }
    }

    fn minifloat(exp_bits: u32, man_bits: u32, bias: i32, special: Special) -> Self {
        let n_codes = 1usize << (1 + exp_bits + man_bits);
        let raw: Vec<f32> = (0..n_codes)
            .map(|code| decode_minifloat(code as u8, exp_bits, man_bits, bias, special))
            .collect();
        let max = raw
            .iter()
            .filter(|v| v.is_finite())
            .fold(0.0f32, |m, v| m.max(v.abs()));
        Self::from_values(raw.into_iter().map(|v| v / max).collect())
    }

    /// Table for a non-integer weight dtype; `None` for affine integer formats
    pub fn for_dtype(dtype: WeightDtype) -> Option<&'static Codebook> {
        static NF4: OnceLock<Codebook> = OnceLock::new();
        static FP4_E2M1: OnceLock<Codebook> = OnceLock::new();
        static FP4_BNB: OnceLock<Codebook> = OnceLock::new();
        static FP8_E4M3: OnceLock<Codebook> = OnceLock::new();
        static FP8_E5M2: OnceLock<Codebook> = OnceLock::new();
        static INT4_FULLRANGE: OnceLock<Codebook> = OnceLock::new();

        match dtype {
            WeightDtype::Int8 | WeightDtype::Int4Clip => None,
            WeightDtype::Nf4 => {
                Some(NF4.get_or_init(|| Codebook::from_values(NF4_VALUES.to_vec())))
            }
            WeightDtype::Fp4E2m1Bnb => {
                Some(FP4_BNB.get_or_init(|| Codebook::from_values(FP4_BNB_VALUES.to_vec())))
            }
            WeightDtype::Fp4E2m1 => {
                Some(FP4_E2M1.get_or_init(|| Codebook::minifloat(2, 1, 1, Special::None)))
            }
            WeightDtype::Fp8E4m3 => {
                Some(FP8_E4M3.get_or_init(|| Codebook::minifloat(4, 3, 7, Special::NanOnly)))
            }
            WeightDtype::Fp8E5m2 => {
                Some(FP8_E5M2.get_or_init(|| Codebook::minifloat(5, 2, 15, Special::Ieee)))
            }
            WeightDtype::Int4Fullrange => Some(INT4_FULLRANGE.get_or_init(|| {
                Codebook::from_values((0..16).map(|i| (i as f32 - 8.0) / 8.0).collect())
            })),
        }
    }

    /// Number of codes, including ones never produced
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Nearest representable value's code for a normalized input
    pub fn encode(&self, x: f32) -> u8 {
        let x = if x.is_nan() { 0.0 } else { x.clamp(-1.0, 1.0) };
        let idx = self.sorted.partition_point(|(v, _)| *v < x);
        match (idx.checked_sub(1).map(|i| self.sorted[i]), self.sorted.get(idx)) {
            (Some(lo), Some(hi)) => {
                if (x - lo.0) <= (hi.0 - x) {
                    lo.1
                } else {
                    hi.1
                }
            }
            (Some(lo), None) => lo.1,
            (None, Some(hi)) => hi.1,
            (None, None) => 0,
        }
    }

    pub fn decode(&self, code: u8) -> f32 {
        match self.values.get(code as usize) {
            Some(v) if v.is_finite() => *v,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Special {
    /// Every bit pattern is a finite number
    None,
    /// Only the all-ones exponent and mantissa is NaN (e4m3fn)
    NanOnly,
    /// All-ones exponent encodes inf/NaN
    Ieee,
}

fn decode_minifloat(code: u8, exp_bits: u32, man_bits: u32, bias: i32, special: Special) -> f32 {
    let exp_mask = (1u8 << exp_bits) - 1;
    let man_mask = (1u8 << man_bits) - 1;
    let sign = if (code >> (exp_bits + man_bits)) & 1 == 1 {
        -1.0
    } else {
        1.0
    };
    let exponent = (code >> man_bits) & exp_mask;
    let mantissa = code & man_mask;

    match special {
        Special::Ieee if exponent == exp_mask => return f32::NAN,
        Special::NanOnly if exponent == exp_mask && mantissa == man_mask => return f32::NAN,
        _ => {}
    }

    let fraction = mantissa as f32 / (1u32 << man_bits) as f32;
    if exponent == 0 {
        sign * fraction * 2f32.powi(1 - bias)
    } else {
        sign * (1.0 + fraction) * 2f32.powi(exponent as i32 - bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_dtypes_have_no_codebook() {
        assert!(Codebook::for_dtype(WeightDtype::Int8).is_none());
        assert!(Codebook::for_dtype(WeightDtype::Int4Clip).is_none());
    }

    #[test]
    fn test_fp4_e2m1_magnitudes() {
        let cb = Codebook::for_dtype(WeightDtype::Fp4E2m1).unwrap();
        assert_eq!(cb.len(), 16);
        let mut mags: Vec<f32> = (0..8u8).map(|c| cb.decode(c) * 6.0).collect();
        mags.sort_by(f32::total_cmp);
        let expected = [0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0];
        for (got, want) in mags.iter().zip(expected) {
            approx::assert_abs_diff_eq!(*got, want, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_fp8_tables_normalize_to_unit_max() {
        for dtype in [WeightDtype::Fp8E4m3, WeightDtype::Fp8E5m2] {
            let cb = Codebook::for_dtype(dtype).unwrap();
            assert_eq!(cb.len(), 256);
            assert_eq!(cb.decode(cb.encode(1.0)), 1.0);
            assert_eq!(cb.decode(cb.encode(-1.0)), -1.0);
        }
    }

    #[test]
    fn test_e4m3_max_is_448() {
        // 0x7E: exponent 15, mantissa 6 -> 1.75 * 2^8
        assert_eq!(decode_minifloat(0x7E, 4, 3, 7, Special::NanOnly), 448.0);
        assert!(decode_minifloat(0x7F, 4, 3, 7, Special::NanOnly).is_nan());
    }

    #[test]
    fn test_encode_picks_nearest_value() {
        let cb = Codebook::for_dtype(WeightDtype::Nf4).unwrap();
        assert_eq!(cb.decode(cb.encode(0.01)), 0.0);
        assert_eq!(cb.decode(cb.encode(0.95)), 1.0);
        assert_eq!(cb.decode(cb.encode(-2.0)), -1.0);
    }

    #[test]
    fn test_every_code_round_trips() {
        for dtype in WeightDtype::ALL {
            let Some(cb) = Codebook::for_dtype(dtype) else {
                continue;
            };
            for code in 0..cb.len() {
                let v = cb.decode(code as u8);
                let back = cb.decode(cb.encode(v));
                assert_eq!(back, v, "{dtype}: code {code}");
            }
        }
    }
}
