//! Bit packing for the two on-disk layouts of a packed linear layer
//!
//! - **Compact**: `u8 [out, ceil(in * bits / 8)]`, two 4-bit codes per byte
//!   with the low nibble first; zero points as `i8` offsets from the mid code.
//! - **Portable**: the optimum/GPTQ layout, `i32 [ceil(in * bits / 32), out]`
//!   with codes packed along the input dimension; zero points packed along the
//!   output dimension as `zero - 1`.

use crate::{Error, Result};
use ndarray::Array2;

fn check_bits(bits: u8) -> Result<()> {
    match bits {
        4 | 8 => Ok(()),
        other => Err(Error::InvalidParameter(format!(
            "packing supports 4 or 8 bits, got {other}"
        ))),
    }
}

fn mask(bits: u8) -> u32 {
    (1u32 << bits) - 1
}

/// Bytes per output row in the compact layout
pub fn compact_row_bytes(in_features: usize, bits: u8) -> usize {
    (in_features * bits as usize).div_ceil(8)
}

/// Rows of `qweight` in the portable layout
pub fn portable_rows(in_features: usize, bits: u8) -> usize {
    (in_features * bits as usize).div_ceil(32)
}

/// Columns of `qzeros` in the portable layout
pub fn portable_zero_cols(out_features: usize, bits: u8) -> usize {
    (out_features * bits as usize).div_ceil(32)
}

/// Pack `[out, in]` codes into the compact byte layout
pub fn pack_compact(codes: &Array2<u8>, bits: u8) -> Result<Array2<u8>> {
    check_bits(bits)?;
    if bits == 8 {
        return Ok(codes.clone());
    }
    let (rows, in_features) = codes.dim();
    let width = compact_row_bytes(in_features, bits);
    let mut packed = Array2::<u8>::zeros((rows, width));
    for r in 0..rows {
        for c in 0..in_features {
            let nibble = codes[[r, c]] & 0x0F;
            packed[[r, c / 2]] |= nibble << ((c % 2) * 4);
        }
    }
    Ok(packed)
}

/// Inverse of [`pack_compact`]
pub fn unpack_compact(packed: &Array2<u8>, in_features: usize, bits: u8) -> Result<Array2<u8>> {
    check_bits(bits)?;
    let expected = compact_row_bytes(in_features, bits);
    if packed.ncols() != expected {
        return Err(Error::ShapeMismatch {
            name: "qweight".to_string(),
            expected: vec![packed.nrows(), expected],
            got: packed.shape().to_vec(),
        });
    }
    if bits == 8 {
        return Ok(packed.clone());
    }
    Ok(Array2::from_shape_fn((packed.nrows(), in_features), |(r, c)| {
        (packed[[r, c / 2]] >> ((c % 2) * 4)) & 0x0F
    }))
}

/// Zero points as signed offsets from the mid code
pub fn zeros_to_compact(zeros: &Array2<u8>, bits: u8) -> Array2<i8> {
    let mid = 1i32 << (bits - 1);
    zeros.mapv(|z| (z as i32 - mid) as i8)
}

pub fn zeros_from_compact(zeros: &Array2<i8>, bits: u8) -> Array2<u8> {
    let mid = 1i32 << (bits - 1);
    zeros.mapv(|z| (z as i32 + mid) as u8)
}

/// Pack `[out, in]` codes into the portable `i32 [in*bits/32, out]` layout
pub fn pack_portable(codes: &Array2<u8>, bits: u8) -> Result<Array2<i32>> {
    check_bits(bits)?;
    let (out_features, in_features) = codes.dim();
    let per_word = 32 / bits as usize;
    let rows = portable_rows(in_features, bits);
    let mut packed = Array2::<i32>::zeros((rows, out_features));
    for o in 0..out_features {
        for r in 0..rows {
            let mut word = 0u32;
            for j in 0..per_word {
                let c = r * per_word + j;
                if c < in_features {
                    word |= (codes[[o, c]] as u32 & mask(bits)) << (bits as usize * j);
                }
            }
            packed[[r, o]] = word as i32;
        }
    }
    Ok(packed)
}

/// Inverse of [`pack_portable`]
pub fn unpack_portable(packed: &Array2<i32>, in_features: usize, bits: u8) -> Result<Array2<u8>> {
    check_bits(bits)?;
    let expected = portable_rows(in_features, bits);
    if packed.nrows() != expected {
        return Err(Error::ShapeMismatch {
            name: "qweight".to_string(),
            expected: vec![expected, packed.ncols()],
            got: packed.shape().to_vec(),
        });
    }
    let per_word = 32 / bits as usize;
    Ok(Array2::from_shape_fn(
        (packed.ncols(), in_features),
        |(o, c)| {
            let word = packed[[c / per_word, o]] as u32;
            ((word >> (bits as usize * (c % per_word))) & mask(bits)) as u8
        },
    ))
}

/// Pack `[out, n_groups]` zero points as `zero - 1` into `[n_groups, out*bits/32]`
pub fn pack_portable_zeros(zeros: &Array2<u8>, bits: u8) -> Result<Array2<i32>> {
    check_bits(bits)?;
    let (out_features, n_groups) = zeros.dim();
    let per_word = 32 / bits as usize;
    let cols = portable_zero_cols(out_features, bits);
    let mut packed = Array2::<i32>::zeros((n_groups, cols));
    for g in 0..n_groups {
        for w in 0..cols {
            let mut word = 0u32;
            for j in 0..per_word {
                let o = w * per_word + j;
                if o < out_features {
                    let stored = (zeros[[o, g]] as u32).wrapping_sub(1) & mask(bits);
                    word |= stored << (bits as usize * j);
                }
            }
            packed[[g, w]] = word as i32;
        }
    }
    Ok(packed)
}

/// Inverse of [`pack_portable_zeros`], returning `[out, n_groups]`
pub fn unpack_portable_zeros(
    packed: &Array2<i32>,
    out_features: usize,
    bits: u8,
) -> Result<Array2<u8>> {
    check_bits(bits)?;
    let expected = portable_zero_cols(out_features, bits);
    if packed.ncols() != expected {
        return Err(Error::ShapeMismatch {
            name: "qzeros".to_string(),
            expected: vec![packed.nrows(), expected],
            got: packed.shape().to_vec(),
        });
    }
    let per_word = 32 / bits as usize;
    Ok(Array2::from_shape_fn(
        (out_features, packed.nrows()),
        |(o, g)| {
            let word = packed[[g, o / per_word]] as u32;
            let stored = (word >> (bits as usize * (o % per_word))) & mask(bits);
            (stored.wrapping_add(1) & mask(bits)) as u8
        },
    ))
}
