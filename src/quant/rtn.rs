//! Round-to-nearest quantization and the per-layer quantizer seam
//!
//! The replacement engine asks a [`WeightQuantizer`] for each eligible layer's
//! quantized weight. RTN computes it on the spot from the dense weight;
//! calibrated algorithms compute everything up front and hand the results over
//! through [`Precomputed`].

use super::scheme::{quantize_weight, QuantSpec, QuantizedWeight};
use crate::{Error, Result};
use ndarray::Array2;
use std::collections::BTreeMap;

/// Produces the quantized form of one named dense weight
pub trait WeightQuantizer {
    fn quantize(
        &mut self,
        name: &str,
        weight: &Array2<f32>,
        spec: &QuantSpec,
    ) -> Result<QuantizedWeight>;
}

/// Per-group min/max rounding, no calibration
#[derive(Debug, Clone, Copy, Default)]
pub struct Rtn;

impl WeightQuantizer for Rtn {
    fn quantize(
        &mut self,
        _name: &str,
        weight: &Array2<f32>,
        spec: &QuantSpec,
    ) -> Result<QuantizedWeight> {
        Ok(rtn_quantize(weight, spec))
    }
}

pub fn rtn_quantize(weight: &Array2<f32>, spec: &QuantSpec) -> QuantizedWeight {
    quantize_weight(weight, spec, None)
}

/// Results of a calibrated algorithm, keyed by qualified layer name
#[derive(Debug, Clone, Default)]
pub struct Precomputed {
    weights: BTreeMap<String, QuantizedWeight>,
}

impl Precomputed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, weight: QuantizedWeight) {
        self.weights.insert(name.into(), weight);
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }
}

impl FromIterator<(String, QuantizedWeight)> for Precomputed {
    fn from_iter<T: IntoIterator<Item = (String, QuantizedWeight)>>(iter: T) -> Self {
        Self {
            weights: iter.into_iter().collect(),
        }
    }
}

impl WeightQuantizer for Precomputed {
    fn quantize(
        &mut self,
        name: &str,
        weight: &Array2<f32>,
        _spec: &QuantSpec,
    ) -> Result<QuantizedWeight> {
        let q = self
            .weights
            .remove(name)
            .ok_or_else(|| {
                Error::ModuleNotFound(format!("no quantized weight computed for `{name}`"))
            })?;
        if q.codes.dim() != weight.dim() {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: weight.shape().to_vec(),
                got: q.codes.shape().to_vec(),
            });
        }
        Ok(q)
    }
}
