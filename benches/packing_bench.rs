//! Packing and quantization kernel benchmarks.
//!
//! Covers the nibble layouts used on disk and in memory, RTN over a full
//! MLP projection and a GPTQ pass with its Hessian.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cuantizar::config::WeightDtype;
use cuantizar::quant::pack::{pack_compact, pack_portable, unpack_compact, unpack_portable};
use cuantizar::quant::{gptq_quantize, rtn_quantize, GptqOptions, HessianAccumulator, QuantSpec};
use ndarray::Array2;

fn codes(out_features: usize, in_features: usize) -> Array2<u8> {
    Array2::from_shape_fn((out_features, in_features), |(o, i)| ((o * 31 + i * 7) % 16) as u8)
}

fn weight(out_features: usize, in_features: usize) -> Array2<f32> {
    Array2::from_shape_fn((out_features, in_features), |(o, i)| {
        ((o * 13 + i * 5) as f32 * 0.01).sin()
    })
}

fn bench_packing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Packing");

    for (out_features, in_features) in [(256, 256), (1024, 768), (3072, 768)] {
        let label = format!("{out_features}x{in_features}");
        let codes = codes(out_features, in_features);
        group.throughput(Throughput::Elements((out_features * in_features) as u64));

        group.bench_with_input(BenchmarkId::new("pack_compact", &label), &codes, |b, codes| {
            b.iter(|| pack_compact(black_box(codes), 4))
        });
        let compact = pack_compact(&codes, 4).unwrap();
        group.bench_with_input(BenchmarkId::new("unpack_compact", &label), &compact, |b, packed| {
            b.iter(|| unpack_compact(black_box(packed), in_features, 4))
        });

        group.bench_with_input(BenchmarkId::new("pack_portable", &label), &codes, |b, codes| {
            b.iter(|| pack_portable(black_box(codes), 4))
        });
        let portable = pack_portable(&codes, 4).unwrap();
        group.bench_with_input(BenchmarkId::new("unpack_portable", &label), &portable, |b, packed| {
            b.iter(|| unpack_portable(black_box(packed), in_features, 4))
        });
    }
    group.finish();
}

fn bench_rtn(c: &mut Criterion) {
    let mut group = c.benchmark_group("Rtn");
    let w = weight(3072, 768);

    for group_size in [32, 128, -1] {
        for dtype in [WeightDtype::Int4Clip, WeightDtype::Nf4, WeightDtype::Int8] {
            let spec = QuantSpec::new(dtype, group_size, true);
            group.bench_with_input(
                BenchmarkId::new(dtype.as_str(), group_size),
                &spec,
                |b, spec| b.iter(|| rtn_quantize(black_box(&w), spec)),
            );
        }
    }
    group.finish();
}

fn bench_gptq(c: &mut Criterion) {
    let mut group = c.benchmark_group("Gptq");
    group.sample_size(10);

    for in_features in [128, 256] {
        let w = weight(256, in_features);
        let x = Array2::from_shape_fn((512, in_features), |(r, i)| {
            ((r * 3 + i) as f32 * 0.07).cos()
        });
        let mut acc = HessianAccumulator::new(in_features);
        acc.add_batch(x.view());
        let h = acc.hessian().clone();
        let spec = QuantSpec::new(WeightDtype::Int4Clip, 128, false);

        for desc_act in [false, true] {
            let opts = GptqOptions {
                desc_act,
                ..GptqOptions::default()
            };
            group.bench_with_input(
                BenchmarkId::new(if desc_act { "desc_act" } else { "in_order" }, in_features),
                &opts,
                |b, opts| b.iter(|| gptq_quantize(black_box(&w), &h, &spec, opts)),
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_packing, bench_rtn, bench_gptq);
criterion_main!(benches);
