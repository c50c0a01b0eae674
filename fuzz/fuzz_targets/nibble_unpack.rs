#![no_main]

use arbitrary::Arbitrary;
use cuantizar::quant::pack::{pack_compact, pack_portable, unpack_compact, unpack_portable};
use libfuzzer_sys::fuzz_target;
use ndarray::Array2;

#[derive(Arbitrary, Debug)]
struct PackInput {
    rows: u8,
    in_features: u8,
    eight_bit: bool,
    bytes: Vec<u8>,
}

fuzz_target!(|input: PackInput| {
    let rows = input.rows as usize % 16 + 1;
    let in_features = input.in_features as usize + 1;
    let bits = if input.eight_bit { 8 } else { 4 };
    let mask = if bits == 8 { 0xff } else { 0x0f };
    if input.bytes.is_empty() {
        return;
    }
    let codes = Array2::from_shape_fn((rows, in_features), |(r, c)| {
        input.bytes[(r * in_features + c) % input.bytes.len()] & mask
    });

    let compact = pack_compact(&codes, bits).expect("4 and 8 bits pack");
    assert_eq!(unpack_compact(&compact, in_features, bits).expect("own layout"), codes);

    let portable = pack_portable(&codes, bits).expect("4 and 8 bits pack");
    assert_eq!(unpack_portable(&portable, in_features, bits).expect("own layout"), codes);

    // Raw buffers of the wrong width are rejected, never read out of bounds
    let raw = Array2::from_shape_fn((rows, input.bytes.len().min(64)), |(_, c)| input.bytes[c]);
    let _ = unpack_compact(&raw, in_features, bits);
});
