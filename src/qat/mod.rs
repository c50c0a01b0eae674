//! Quantization-aware training
//!
//! [`CompressionManager::prepare`] wraps every eligible dense linear in a
//! [`QatLinear`] (int8 fake-quantized weight plus an input observer). A
//! training loop then runs between [`CompressionManager::on_train_begin`]
//! and [`CompressionManager::on_train_end`], which converts the wrapped
//! layers into deployed [`crate::nn::Int8Linear`] layers.

mod backprop;
mod train;

pub use backprop::{backward, forward_train, LayerGrad, Tape};
pub use train::{default_train_fn, train_batches, train_step, TrainFn, DEFAULT_QAT_LR};

use crate::config::{QatConfig, TrainParams};
use crate::nn::{CausalLm, Layer, Module, QatLinear};
use crate::ptq::OpOverrides;
use crate::replace::{Exclusion, ExclusionPredicate};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct QatConf {
    pub backend: String,
    pub excluded_precisions: Vec<String>,
    pub overrides: OpOverrides,
    pub training: TrainParams,
}

impl QatConf {
    pub fn from_config(c: &QatConfig) -> Self {
        Self {
            backend: c.backend.clone(),
            excluded_precisions: c.excluded_precisions.clone(),
            overrides: OpOverrides::from_dicts(c.op_type_dict.as_ref(), c.op_name_dict.as_ref()),
            training: c.training.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionManager {
    conf: QatConf,
    exclusion: ExclusionPredicate,
    wrapped: Vec<String>,
    training: bool,
}

impl CompressionManager {
    pub fn new(conf: QatConf) -> Self {
        Self {
            conf,
            exclusion: ExclusionPredicate::default(),
            wrapped: Vec::new(),
            training: false,
        }
    }

    pub fn conf(&self) -> &QatConf {
        &self.conf
    }

    pub fn wrapped(&self) -> &[String] {
        &self.wrapped
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Wrap eligible dense linears for training; returns their names
    pub fn prepare(&mut self, model: &mut CausalLm) -> Result<&[String]> {
        let targets: Vec<String> = model
            .root
            .named_modules()
            .into_iter()
            .filter(|(name, module)| {
                matches!(module.layer, Layer::Linear(_))
                    && !self.exclusion.excludes(name)
                    && !self.conf.overrides.keeps_fp32(name)
            })
            .map(|(name, _)| name)
            .collect();
        for name in targets {
            let old = model.root.replace(&name, Module::sequential())?;
            let Layer::Linear(mut linear) = old.layer else {
                return Err(Error::ModuleNotFound(format!("`{name}` is not a dense linear")));
            };
            linear.requires_grad = true;
            model
                .root
                .replace(&name, Module::new(Layer::Qat(QatLinear::wrap(linear))))?;
            self.wrapped.push(name);
        }
        tracing::debug!(layers = self.wrapped.len(), "linears wrapped for QAT");
        Ok(&self.wrapped)
    }

    pub fn on_train_begin(&mut self, model: &mut CausalLm) {
        self.training = true;
        model.frozen = false;
    }

    /// Convert every wrapped layer into its int8 counterpart
    pub fn on_train_end(&mut self, model: &mut CausalLm) -> Result<Vec<String>> {
        self.training = false;
        let mut converted = Vec::with_capacity(self.wrapped.len());
        for name in &self.wrapped {
            let Some(Module {
                layer: Layer::Qat(q),
                ..
            }) = model.root.get(name)
            else {
                continue;
            };
            let int8 = q.finalize();
            model.root.replace(name, Module::new(Layer::Int8(int8)))?;
            converted.push(name.clone());
        }
        Ok(converted)
    }

    /// `on_train_begin`, the training loop, `on_train_end`
    pub fn fit(&mut self, model: &mut CausalLm, train_fn: &TrainFn) -> Result<Vec<String>> {
        self.on_train_begin(model);
        train_fn(model)?;
        self.on_train_end(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::BatchBuilder;
    use crate::config::ParamDtype;
    use crate::nn::{ActQuant, MlpLmFactory, ModelConfig, ModelFactory};

    fn model() -> CausalLm {
        let mut config = ModelConfig::new("opt", 16, 8, 1);
        config.intermediate_size = Some(16);
        let root = MlpLmFactory.build(&config, ParamDtype::F32).unwrap();
        let mut lm = CausalLm::new(config, root, ParamDtype::F32);
        lm.randomize(5);
        lm
    }

    fn weight(lm: &CausalLm, name: &str) -> ndarray::Array2<f32> {
        match &lm.root.get(name).unwrap().layer {
            Layer::Qat(q) => q.linear.weight.clone(),
            Layer::Linear(l) => l.weight.clone(),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn test_prepare_wraps_everything_but_the_head() {
        let mut lm = model();
        let mut manager = CompressionManager::new(QatConf::from_config(&QatConfig::default()));
        let wrapped = manager.prepare(&mut lm).unwrap().to_vec();
        assert_eq!(wrapped, vec!["model.layers.0.mlp.up_proj", "model.layers.0.mlp.down_proj"]);
        assert!(matches!(lm.root.get("lm_head").unwrap().layer, Layer::Linear(_)));
    }

    #[test]
    fn test_default_loop_updates_weights_and_finalizes() {
        let mut lm = model();
        let before = weight(&lm, "model.layers.0.mlp.up_proj");
        let mut manager = CompressionManager::new(QatConf::from_config(&QatConfig::default()));
        manager.prepare(&mut lm).unwrap();

        let builder = BatchBuilder::new("opt", 4, true, 1);
        let batches = builder.build_batches(
            vec![vec![3, 4, 5, 6], vec![7, 8, 9, 10], vec![11, 12]],
            2,
        );
        let train_fn = default_train_fn(batches, 100);

        manager.on_train_begin(&mut lm);
        assert!(manager.is_training());
        train_fn(&mut lm).unwrap();
        assert_ne!(weight(&lm, "model.layers.0.mlp.up_proj"), before);

        let converted = manager.on_train_end(&mut lm).unwrap();
        assert_eq!(converted.len(), 2);
        let Layer::Int8(l) = &lm.root.get("model.layers.0.mlp.down_proj").unwrap().layer else {
            panic!("down_proj should be int8");
        };
        assert!(matches!(l.act, ActQuant::Static(_)));
        assert!(lm.forward(&[3, 4]).unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_train_step_lowers_mean_logit() {
        let mut lm = model();
        let mut manager = CompressionManager::new(QatConf::from_config(&QatConfig::default()));
        manager.prepare(&mut lm).unwrap();
        let batch = vec![BatchBuilder::new("opt", 4, true, 1).build(vec![3, 4, 5, 6])];
        let mut sgd = crate::optim::SGD::new(0.5, 0.0);
        let first = train_step(&mut lm, &batch, &mut sgd).unwrap();
        let mut later = first;
        for _ in 0..5 {
            later = train_step(&mut lm, &batch, &mut sgd).unwrap();
        }
        assert!(later < first);
    }
}
