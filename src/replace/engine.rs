//! Linear → packed layer replacement
//!
//! Candidates are collected with a pre-order walk of the module tree, then
//! swapped in place one by one; nothing else in the graph is touched.

use super::exclusion::Exclusion;
use crate::config::ComputeDtype;
use crate::nn::{Layer, Linear, Module, PackFormat, PackedLinear};
use crate::quant::{QuantSpec, QuantizedWeight, WeightQuantizer};
use crate::{Error, Result};
use ndarray::Array1;

/// Shape-independent settings of the packed layers to create
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplaceOptions {
    pub spec: QuantSpec,
    pub compute_dtype: ComputeDtype,
    pub format: PackFormat,
}

impl ReplaceOptions {
    pub fn compact(spec: QuantSpec, compute_dtype: ComputeDtype) -> Self {
        Self {
            spec,
            compute_dtype,
            format: PackFormat::Compact,
        }
    }

    pub fn portable(spec: QuantSpec, compute_dtype: ComputeDtype) -> Self {
        Self {
            spec,
            compute_dtype,
            format: PackFormat::Portable,
        }
    }
}

/// How replaced layers get their contents
pub enum ReplaceMode<'a> {
    /// Zero-filled buffers, bound later from a state dict
    Skeleton,
    /// Quantize the current dense weight right away
    Eager(&'a mut dyn WeightQuantizer),
}

fn candidates(root: &Module, exclusion: &dyn Exclusion, want_portable: bool) -> Vec<String> {
    root.named_modules()
        .into_iter()
        .filter(|(name, module)| {
            !name.is_empty()
                && !exclusion.excludes(name)
                && match &module.layer {
                    Layer::Linear(_) => true,
                    Layer::Packed(p) => want_portable && p.format == PackFormat::Portable,
                    _ => false,
                }
        })
        .map(|(name, _)| name)
        .collect()
}

fn packed_from_dense(
    name: &str,
    linear: &Linear,
    opts: &ReplaceOptions,
    mode: &mut ReplaceMode<'_>,
) -> Result<PackedLinear> {
    let mut packed = PackedLinear::empty(
        linear.in_features,
        linear.out_features,
        linear.has_bias(),
        &opts.spec,
        opts.compute_dtype,
        opts.format,
    )?;
    if let ReplaceMode::Eager(quantizer) = mode {
        let q = quantizer.quantize(name, &linear.weight, &opts.spec)?;
        packed.pack(&q, linear.bias.as_ref())?;
    }
    Ok(packed)
}

/// Move a portable layer into the compact layout, same codes and parameters
fn compact_from_portable(
    portable: &PackedLinear,
    compute_dtype: ComputeDtype,
) -> Result<PackedLinear> {
    let q = portable.unpack()?;
    let mut compact = PackedLinear::empty(
        portable.in_features,
        portable.out_features,
        portable.has_bias(),
        &portable.spec(),
        compute_dtype,
        PackFormat::Compact,
    )?;
    let default = portable.spec().layout(portable.in_features).default_g_idx();
    let g_idx = q.g_idx.clone().filter(|g| *g != default);
    compact.pack(&QuantizedWeight { g_idx, ..q }, portable.bias.as_ref())?;
    Ok(compact)
}

/// Replace every eligible linear of `root`.
///
/// Dense linears become packed layers in `opts.format`; in eager mode,
/// portable packed layers are also moved into the compact layout. Returns
/// the qualified names of replaced layers.
pub fn replace_linear(
    root: &mut Module,
    opts: &ReplaceOptions,
    exclusion: &dyn Exclusion,
    mut mode: ReplaceMode<'_>,
) -> Result<Vec<String>> {
    let eager = matches!(mode, ReplaceMode::Eager(_));
    let names = candidates(root, exclusion, eager && opts.format == PackFormat::Compact);
    for name in &names {
        let node = root
            .get(name)
            .ok_or_else(|| Error::ModuleNotFound(name.clone()))?;
        let packed = match &node.layer {
            Layer::Linear(linear) => packed_from_dense(name, linear, opts, &mut mode)?,
            Layer::Packed(portable) => compact_from_portable(portable, opts.compute_dtype)?,
            other => {
                return Err(Error::InvalidParameter(format!(
                    "`{name}` is a {}, not a linear layer",
                    other.kind()
                )))
            }
        };
        tracing::debug!(
            layer = %name,
            format = %packed.format,
            bits = packed.bits,
            "linear replaced"
        );
        root.replace(name, Module::new(Layer::Packed(packed)))?;
    }
    Ok(names)
}

/// Skeleton for the export layout: same exclusion rule, always empty,
/// always portable
pub fn build_woq_model(
    root: &mut Module,
    spec: &QuantSpec,
    compute_dtype: ComputeDtype,
    exclusion: &dyn Exclusion,
) -> Result<Vec<String>> {
    replace_linear(
        root,
        &ReplaceOptions::portable(*spec, compute_dtype),
        exclusion,
        ReplaceMode::Skeleton,
    )
}

/// Explicit pack step for a layer created by [`build_woq_model`]
pub fn pack_woq_layer(
    layer: &mut PackedLinear,
    int_weight: ndarray::Array2<u8>,
    scales: ndarray::Array2<f32>,
    zeros: Option<ndarray::Array2<u8>>,
    bias: Option<&Array1<f32>>,
    g_idx: Option<Vec<i32>>,
) -> Result<()> {
    let q = QuantizedWeight {
        codes: int_weight,
        scales,
        zeros,
        g_idx,
    };
    layer.pack(&q, bias)
}
