//! Linear layer wrapped for quantization-aware training

use super::int8::{ActQuant, Int8Linear};
use super::linear::Linear;
use super::state::{StateDict, StateTensor};
use crate::quant::{Calibrator, FakeQuantize};
use crate::Result;
use ndarray::{Array2, ArrayView2, Axis};

/// Dense weights trained through an int8 fake quantizer while an observer
/// watches the layer input
#[derive(Debug, Clone)]
pub struct QatLinear {
    pub linear: Linear,
    pub weight_fq: FakeQuantize,
    pub observer: Calibrator,
}

impl QatLinear {
    pub fn wrap(linear: Linear) -> Self {
        let mut weight_fq = FakeQuantize::int8();
        weight_fq.calibrate(&linear.weight);
        Self {
            linear,
            weight_fq,
            observer: Calibrator::moving_average(8, false, 0.1),
        }
    }

    /// Weight as seen by the forward pass
    pub fn effective_weight(&self) -> Array2<f32> {
        if self.weight_fq.initialized && self.weight_fq.scales.len() == self.linear.out_features {
            self.weight_fq.apply(&self.linear.weight)
        } else {
            self.linear.weight.clone()
        }
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut y = x.dot(&self.effective_weight().t());
        if let Some(b) = &self.linear.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        y
    }

    /// Training step forward: recalibrates the weight quantizer and records
    /// the input range
    pub fn forward_train(&mut self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        if let Some(values) = x.as_slice() {
            self.observer.observe(values);
        } else {
            self.observer.observe(&x.iter().copied().collect::<Vec<_>>());
        }
        self.weight_fq.calibrate(&self.linear.weight);
        self.forward(x)
    }

    /// Convert into the deployed int8 layer with static activation params
    pub fn finalize(&self) -> Int8Linear {
        let act = if self.observer.has_data() {
            ActQuant::Static(self.observer.compute())
        } else {
            ActQuant::Dynamic
        };
        Int8Linear::from_dense(&self.linear.weight, self.linear.bias.clone(), act, None)
    }

    pub fn state_dict(&self, prefix: &str, out: &mut StateDict) {
        self.linear.state_dict(prefix, out);
    }

    pub fn load_param(&mut self, param: &str, tensor: &StateTensor) -> Result<()> {
        self.linear.load_param(param, tensor)?;
        self.weight_fq.calibrate(&self.linear.weight);
        Ok(())
    }
}
