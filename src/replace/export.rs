//! Conversion of compact layers to the portable export layout

use crate::nn::{Layer, Module, PackFormat, PackedLinear};
use crate::quant::QuantizedWeight;
use crate::{Error, Result};

fn export_layer(compact: &PackedLinear) -> Result<PackedLinear> {
    let params = compact.recover_qparams()?;
    let spec = compact.spec();
    let mut portable = PackedLinear::empty(
        params.in_features,
        params.out_features,
        compact.has_bias(),
        &spec,
        compact.compute_dtype,
        PackFormat::Portable,
    )?;
    let q = QuantizedWeight {
        codes: params.int_weight,
        scales: params.scales,
        zeros: params.zeros,
        g_idx: params.g_idx,
    };
    portable.pack(&q, compact.bias.as_ref())?;
    Ok(portable)
}

/// Re-lay out every compact packed layer in `root` for export.
///
/// Integer dtypes move to the portable layout; codebook dtypes have no
/// portable encoding and stay compact, re-laid out transposed. Returns the
/// names of layers moved to the portable layout.
pub fn recover_export_model(root: &mut Module) -> Result<Vec<String>> {
    let names: Vec<String> = root
        .named_modules()
        .into_iter()
        .filter(|(_, m)| matches!(&m.layer, Layer::Packed(p) if p.format == PackFormat::Compact))
        .map(|(name, _)| name)
        .collect();

    let mut exported = Vec::new();
    for name in names {
        let module = root
            .get_mut(&name)
            .ok_or_else(|| Error::ModuleNotFound(name.clone()))?;
        let Layer::Packed(packed) = &mut module.layer else {
            continue;
        };
        if packed.weight_dtype.is_excluded() {
            let relaid = packed.clone().with_transposed(true)?;
            *packed = relaid;
            continue;
        }
        let portable = export_layer(packed)?;
        tracing::debug!(layer = %name, "exported to portable layout");
        *packed = portable;
        exported.push(name);
    }
    Ok(exported)
}
