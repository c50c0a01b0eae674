//! Quantize, save and reload through the public dispatcher API

use cuantizar::config::{
    HostCapabilities, ParamDtype, QuantMethod, QuantizationConfig, RtnConfig, WeightDtype,
};
use cuantizar::io::{CheckpointManifest, MANIFEST_NAME, SAFE_WEIGHTS_NAME};
use cuantizar::nn::{CausalLm, Layer, Linear, Module, ModelConfig, ModelFactory, PackedLinear};
use cuantizar::{Dispatcher, LoadRequest, Result};
use serde_json::json;
use tempfile::TempDir;

const VOCAB: usize = 16;

/// `layer.0.mlp` (768 → 3072) followed by `lm_head` (3072 → vocab)
struct SingleMlpFactory;

impl ModelFactory for SingleMlpFactory {
    fn build(&self, config: &ModelConfig, dtype: ParamDtype) -> Result<Module> {
        let mlp = Module::new(Layer::Linear(Linear::empty(
            config.hidden_size,
            config.intermediate_size(),
            false,
            dtype,
        )));
        let layer = Module::sequential().with_child(
            "0",
            Module::sequential().with_child("mlp", mlp),
        );
        let head = Module::new(Layer::Linear(Linear::empty(
            config.intermediate_size(),
            config.vocab_size,
            false,
            dtype,
        )));
        Ok(Module::sequential().with_child("layer", layer).with_child("lm_head", head))
    }
}

fn saved_dense() -> TempDir {
    let dir = TempDir::new().unwrap();
    let mut config = ModelConfig::new("mlp", VOCAB, 768, 1);
    config.intermediate_size = Some(3072);
    let root = SingleMlpFactory.build(&config, ParamDtype::F32).unwrap();
    let mut model = CausalLm::new(config, root, ParamDtype::F32);
    model.randomize(7);
    model.save_pretrained(dir.path()).unwrap();
    dir
}

fn request(dir: &std::path::Path) -> LoadRequest {
    LoadRequest::new(dir)
        .with_fast_runtime(false)
        .with_capabilities(HostCapabilities::new(false))
}

fn packed<'a>(model: &'a CausalLm, name: &str) -> &'a PackedLinear {
    match model.root.get(name).map(|m| &m.layer) {
        Some(Layer::Packed(p)) => p,
        other => panic!("`{name}` should be packed, got {:?}", other.map(|l| l.kind())),
    }
}

fn rtn_config() -> QuantizationConfig {
    let raw = json!({
        "quant_method": "rtn",
        "bits": 4,
        "weight_dtype": null,
        "group_size": 128,
        "sym": true
    });
    QuantizationConfig::from_dict(&raw).unwrap()
}

#[test]
fn test_rtn_packs_the_mlp_and_keeps_the_head() {
    let dir = saved_dense();
    let model = Dispatcher::new(SingleMlpFactory)
        .load(&request(dir.path()).with_config(rtn_config()))
        .unwrap()
        .into_graph()
        .unwrap();

    let layer = packed(&model, "layer.0.mlp");
    assert_eq!((layer.in_features, layer.out_features), (768, 3072));
    assert_eq!((layer.bits, layer.group_size), (4, 128));
    assert_eq!(layer.weight_dtype, WeightDtype::Int4Clip);
    assert!(layer.qzeros.is_none());
    assert!(matches!(model.root.get("lm_head").unwrap().layer, Layer::Linear(_)));
    assert_eq!(model.quantization_config.as_ref().map(|c| c.method()), Some(QuantMethod::Rtn));
}

#[test]
fn test_saved_model_reloads_from_the_directory_alone() {
    let dir = saved_dense();
    let dispatcher = Dispatcher::new(SingleMlpFactory);
    let model = dispatcher
        .load(&request(dir.path()).with_config(rtn_config()))
        .unwrap()
        .into_graph()
        .unwrap();
    let out = TempDir::new().unwrap();
    model.save_pretrained(out.path()).unwrap();
    assert!(out.path().join(SAFE_WEIGHTS_NAME).is_file());
    assert!(out.path().join(MANIFEST_NAME).is_file());

    let back = dispatcher.load(&request(out.path())).unwrap().into_graph().unwrap();
    assert!(matches!(back.root.get("lm_head").unwrap().layer, Layer::Linear(_)));
    let before = packed(&model, "layer.0.mlp");
    let after = packed(&back, "layer.0.mlp");
    assert_eq!(
        (after.in_features, after.out_features, after.bits, after.group_size),
        (before.in_features, before.out_features, before.bits, before.group_size)
    );
    assert_eq!(after.format, before.format);
    assert_eq!(after.scales, before.scales);
    assert!(matches!(back.quantization_config, Some(QuantizationConfig::Rtn(RtnConfig { .. }))));
}

#[test]
fn test_saving_twice_writes_the_same_manifest() {
    let dir = saved_dense();
    let model = Dispatcher::new(SingleMlpFactory)
        .load(&request(dir.path()).with_config(rtn_config()))
        .unwrap()
        .into_graph()
        .unwrap();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    model.save_pretrained(first.path()).unwrap();
    model.save_pretrained(second.path()).unwrap();

    let a = CheckpointManifest::read(first.path()).unwrap();
    let b = CheckpointManifest::read(second.path()).unwrap();
    assert_eq!(a, b);
    assert!(a.contains("layer.0.mlp.qweight"));
    assert!(a.contains("lm_head.weight"));
}
