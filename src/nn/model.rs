//! Causal language model: config, module tree and the factory that builds it

use super::layers::{Activation, Embedding, LayerNorm};
use super::linear::Linear;
use super::module::{Flow, ForwardHook, Layer, Module, NoHook};
use crate::config::{Device, ParamDtype, QuantizationConfig};
use crate::io::{PlainPersister, Persister};
use crate::{Error, Result};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the model config
pub const CONFIG_NAME: &str = "config.json";

/// File name of the generation config
pub const GENERATION_CONFIG_NAME: &str = "generation_config.json";

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

fn default_torch_dtype() -> String {
    "float32".to_string()
}

/// `config.json` of a checkpoint; unknown fields are kept and written back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<String>,

    pub vocab_size: usize,
    pub hidden_size: usize,

    #[serde(default)]
    pub intermediate_size: Option<usize>,

    pub num_hidden_layers: usize,

    #[serde(default)]
    pub num_attention_heads: Option<usize>,

    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,

    #[serde(default)]
    pub tie_word_embeddings: bool,

    #[serde(default = "default_torch_dtype")]
    pub torch_dtype: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization_config: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelConfig {
    /// Small config for a given architecture name
    pub fn new(
        model_type: impl Into<String>,
        vocab_size: usize,
        hidden_size: usize,
        layers: usize,
    ) -> Self {
        Self {
            model_type: model_type.into(),
            architectures: Vec::new(),
            vocab_size,
            hidden_size,
            intermediate_size: None,
            num_hidden_layers: layers,
            num_attention_heads: None,
            hidden_act: default_hidden_act(),
            layer_norm_eps: default_layer_norm_eps(),
            tie_word_embeddings: false,
            torch_dtype: default_torch_dtype(),
            quantization_config: None,
            extra: Map::new(),
        }
    }

    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.hidden_size)
    }

    pub fn num_attention_heads(&self) -> usize {
        self.num_attention_heads.unwrap_or(1).max(1)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads()
    }

    /// Parameter dtype from `torch_dtype`; `auto` and unknown names are fp32
    pub fn param_dtype(&self) -> ParamDtype {
        ParamDtype::parse(&self.torch_dtype).unwrap_or(ParamDtype::F32)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|_| Error::CheckpointNotFound {
            path: path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            file: CONFIG_NAME.to_string(),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.as_ref().join(CONFIG_NAME), text)?;
        Ok(())
    }

    /// Set an extra config field
    pub fn set_extra(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_string(), value);
    }
}

/// Builds empty-weight module trees for a model family
pub trait ModelFactory {
    /// Dense skeleton; every parameter allocated in `dtype` and zero-filled
    fn build(&self, config: &ModelConfig, dtype: ParamDtype) -> Result<Module>;

    /// LayerNorm whose affine output feeds the named linear, if any. Channel
    /// scales learned by AWQ and TEQ are folded into it.
    fn foldable_norm(&self, _linear: &str) -> Option<String> {
        None
    }

    /// Whether a model can be materialized tensor by tensor while loading
    fn supports_low_cpu_mem_usage(&self, _config: &ModelConfig) -> bool {
        true
    }
}

/// Residual MLP language model:
/// `model.embed_tokens → model.layers.N{input_layernorm, mlp{up_proj, act_fn, down_proj}} →
/// model.norm → lm_head`
#[derive(Debug, Clone, Copy, Default)]
pub struct MlpLmFactory;

impl ModelFactory for MlpLmFactory {
    fn build(&self, config: &ModelConfig, dtype: ParamDtype) -> Result<Module> {
        if config.hidden_size == 0 || config.vocab_size == 0 {
            return Err(Error::ConfigError(
                "hidden_size and vocab_size must be positive".to_string(),
            ));
        }
        let hidden = config.hidden_size;
        let inter = config.intermediate_size();
        let eps = config.layer_norm_eps;

        let mut layers = Module::sequential();
        for i in 0..config.num_hidden_layers {
            let mlp = Module::sequential()
                .with_child(
                    "up_proj",
                    Module::new(Layer::Linear(Linear::empty(hidden, inter, true, dtype))),
                )
                .with_child(
                    "act_fn",
                    Module::new(Layer::Activation(Activation::from_name(&config.hidden_act))),
                )
                .with_child(
                    "down_proj",
                    Module::new(Layer::Linear(Linear::empty(inter, hidden, true, dtype))),
                );
            let block = Module::residual()
                .with_child(
                    "input_layernorm",
                    Module::new(Layer::LayerNorm(LayerNorm::new(hidden, eps, dtype))),
                )
                .with_child("mlp", mlp);
            layers.push_child(i.to_string(), block);
        }
        let model = Module::sequential()
            .with_child(
                "embed_tokens",
                Module::new(Layer::Embedding(Embedding::empty(config.vocab_size, hidden, dtype))),
            )
            .with_child("layers", layers)
            .with_child("norm", Module::new(Layer::LayerNorm(LayerNorm::new(hidden, eps, dtype))));
        Ok(Module::sequential().with_child("model", model).with_child(
            "lm_head",
            Module::new(Layer::Linear(Linear::empty(hidden, config.vocab_size, false, dtype))),
        ))
    }

    fn foldable_norm(&self, linear: &str) -> Option<String> {
        let block = linear.strip_suffix(".mlp.up_proj")?;
        Some(format!("{block}.input_layernorm"))
    }
}

/// A loaded model plus everything the quantization lifecycle attaches to it
#[derive(Debug, Clone)]
pub struct CausalLm {
    pub config: ModelConfig,
    pub root: Module,
    pub quantization_config: Option<QuantizationConfig>,
    pub generation_config: Option<Value>,
    pub device: Device,
    pub dtype: ParamDtype,
    pub frozen: bool,
    /// Directory the weights were read from; its tokenizer files travel
    /// with every save
    pub source_dir: Option<PathBuf>,
    persister: Option<Arc<dyn Persister>>,
}

impl CausalLm {
    pub fn new(config: ModelConfig, root: Module, dtype: ParamDtype) -> Self {
        Self {
            config,
            root,
            quantization_config: None,
            generation_config: None,
            device: Device::Cpu,
            dtype,
            frozen: false,
            source_dir: None,
            persister: None,
        }
    }

    /// Fill dense parameters with small uniform values from a seeded RNG
    pub fn randomize(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let names: Vec<String> = self.root.named_modules().into_iter().map(|(n, _)| n).collect();
        for name in names {
            let Some(node) = self.root.get_mut(&name) else {
                continue;
            };
            match &mut node.layer {
                Layer::Linear(l) => {
                    let bound = 1.0 / (l.in_features as f32).sqrt();
                    l.weight.mapv_inplace(|_| rng.gen_range(-bound..bound));
                    if let Some(b) = &mut l.bias {
                        b.mapv_inplace(|_| rng.gen_range(-bound..bound));
                    }
                    l.cast(l.dtype);
                }
                Layer::Embedding(e) => {
                    e.weight.mapv_inplace(|_| rng.gen_range(-1.0..1.0));
                    e.cast(e.dtype);
                }
                _ => {}
            }
        }
        self.tie_weights();
    }

    /// Copy the token embedding into `lm_head` when the config ties them
    pub fn tie_weights(&mut self) {
        if !self.config.tie_word_embeddings {
            return;
        }
        let Some(Layer::Embedding(e)) = self.root.get("model.embed_tokens").map(|m| &m.layer) else {
            return;
        };
        let weight = e.weight.clone();
        if let Some(Module {
            layer: Layer::Linear(head),
            ..
        }) = self.root.get_mut("lm_head")
        {
            if head.weight.dim() == weight.dim() {
                head.weight = weight;
            }
        }
    }

    /// Logits `[seq, vocab]` for a token sequence
    pub fn forward(&self, ids: &[u32]) -> Result<Array2<f32>> {
        self.forward_with_hook(ids, &mut NoHook)
    }

    pub fn forward_with_hook(
        &self,
        ids: &[u32],
        hook: &mut dyn ForwardHook,
    ) -> Result<Array2<f32>> {
        self.root.forward(Flow::Ids(ids.to_vec()), hook)?.into_hidden()
    }

    /// Greedy decoding of `max_new_tokens` tokens after `prompt`
    pub fn generate(&self, prompt: &[u32], max_new_tokens: usize) -> Result<Vec<u32>> {
        let mut ids = prompt.to_vec();
        for _ in 0..max_new_tokens {
            let logits = self.forward(&ids)?;
            let Some(last) = logits.axis_iter(Axis(0)).last() else {
                break;
            };
            let next = last
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i as u32)
                .unwrap_or(0);
            ids.push(next);
        }
        Ok(ids)
    }

    /// Disable gradient tracking on all parameters
    pub fn freeze(&mut self) {
        self.root.freeze();
        self.frozen = true;
    }

    pub fn is_quantized(&self) -> bool {
        self.quantization_config.is_some()
    }

    pub fn set_persister(&mut self, persister: Arc<dyn Persister>) {
        self.persister = Some(persister);
    }

    pub fn persister_name(&self) -> &'static str {
        self.persister.as_ref().map_or("plain", |p| p.name())
    }

    /// Save through the attached persister, or the plain one
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        match &self.persister {
            Some(p) => p.save(self, dir.as_ref()),
            None => PlainPersister::default().save(self, dir.as_ref()),
        }
    }

    /// `(qualified name, layer kind)` of every linear-like leaf
    pub fn layer_summary(&self) -> Vec<(String, &'static str)> {
        self.root
            .named_modules()
            .into_iter()
            .filter(|(_, m)| m.layer.is_linear())
            .map(|(n, m)| (n, m.layer.kind()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        let mut c = ModelConfig::new("llama", 16, 8, 2);
        c.intermediate_size = Some(12);
        c
    }

    #[test]
    fn test_factory_builds_expected_names() {
        let root = MlpLmFactory.build(&config(), ParamDtype::F32).unwrap();
        let names = root.linear_names();
        assert_eq!(
            names,
            vec![
                "model.layers.0.mlp.up_proj",
                "model.layers.0.mlp.down_proj",
                "model.layers.1.mlp.up_proj",
                "model.layers.1.mlp.down_proj",
                "lm_head",
            ]
        );
    }

    #[test]
    fn test_foldable_norm_only_for_up_proj() {
        assert_eq!(
            MlpLmFactory.foldable_norm("model.layers.3.mlp.up_proj").as_deref(),
            Some("model.layers.3.input_layernorm")
        );
        assert!(MlpLmFactory.foldable_norm("model.layers.3.mlp.down_proj").is_none());
    }

    #[test]
    fn test_generate_appends_tokens() {
        let root = MlpLmFactory.build(&config(), ParamDtype::F32).unwrap();
        let mut lm = CausalLm::new(config(), root, ParamDtype::F32);
        lm.randomize(7);
        let out = lm.generate(&[1, 2, 3], 4).unwrap();
        assert_eq!(out.len(), 7);
        assert!(out.iter().all(|&t| (t as usize) < 16));
    }

    #[test]
    fn test_config_keeps_unknown_fields() {
        let raw = r#"{"model_type":"opt","vocab_size":4,"hidden_size":2,
                      "num_hidden_layers":1,"torch_dtype":"auto","rope_theta":10000}"#;
        let c: ModelConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(c.param_dtype(), ParamDtype::F32);
        assert_eq!(c.extra["rope_theta"], 10000);
        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back["rope_theta"], 10000);
    }

    #[test]
    fn test_tied_head_copies_embedding() {
        let mut c = config();
        c.tie_word_embeddings = true;
        c.vocab_size = 8;
        let root = MlpLmFactory.build(&c, ParamDtype::F32).unwrap();
        let mut lm = CausalLm::new(c, root, ParamDtype::F32);
        lm.randomize(1);
        let (Layer::Embedding(e), Layer::Linear(h)) = (
            &lm.root.get("model.embed_tokens").unwrap().layer,
            &lm.root.get("lm_head").unwrap().layer,
        ) else {
            panic!("unexpected layer kinds");
        };
        assert_eq!(e.weight, h.weight);
    }
}
