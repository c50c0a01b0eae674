//! Tree-of-modules model graph
//!
//! A [`Module`] is a [`Layer`] payload plus ordered, named children. Qualified
//! names are dot-joined paths from the root (`model.layers.0.mlp.up_proj`).
//! Traversals use an explicit stack, so arbitrarily deep graphs never recurse
//! on the call stack during replacement or state-dict binding.

use super::int8::Int8Linear;
use super::layers::{Activation, Embedding, LayerNorm};
use super::linear::Linear;
use super::packed::PackedLinear;
use super::qat_linear::QatLinear;
use super::state::{check_shape, StateDict};
use crate::config::ParamDtype;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// How a container combines its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Children applied in order
    Sequential,
    /// Children applied in order, input added to the result
    Residual,
}

/// Payload of one node
#[derive(Debug, Clone)]
pub enum Layer {
    Container(ContainerKind),
    Linear(Linear),
    Packed(PackedLinear),
    Int8(Int8Linear),
    Qat(QatLinear),
    Embedding(Embedding),
    LayerNorm(LayerNorm),
    Activation(Activation),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Container(ContainerKind::Sequential) => "Sequential",
            Layer::Container(ContainerKind::Residual) => "Residual",
            Layer::Linear(_) => "Linear",
            Layer::Packed(_) => "PackedLinear",
            Layer::Int8(_) => "Int8Linear",
            Layer::Qat(_) => "QatLinear",
            Layer::Embedding(_) => "Embedding",
            Layer::LayerNorm(_) => "LayerNorm",
            Layer::Activation(_) => "Activation",
        }
    }

    /// Any linear flavour: dense, packed, int8 or QAT-wrapped
    pub fn is_linear(&self) -> bool {
        matches!(self, Layer::Linear(_) | Layer::Packed(_) | Layer::Int8(_) | Layer::Qat(_))
    }

    fn state_dict(&self, prefix: &str, out: &mut StateDict) {
        match self {
            Layer::Linear(l) => l.state_dict(prefix, out),
            Layer::Packed(l) => l.state_dict(prefix, out),
            Layer::Int8(l) => l.state_dict(prefix, out),
            Layer::Qat(l) => l.state_dict(prefix, out),
            Layer::Embedding(l) => l.state_dict(prefix, out),
            Layer::LayerNorm(l) => l.state_dict(prefix, out),
            Layer::Container(_) | Layer::Activation(_) => {}
        }
    }

    fn load_param(&mut self, param: &str, tensor: &super::state::StateTensor) -> Result<()> {
        match self {
            Layer::Linear(l) => l.load_param(param, tensor),
            Layer::Packed(l) => l.load_param(param, tensor),
            Layer::Int8(l) => l.load_param(param, tensor),
            Layer::Qat(l) => l.load_param(param, tensor),
            Layer::Embedding(l) => l.load_param(param, tensor),
            Layer::LayerNorm(l) => l.load_param(param, tensor),
            Layer::Container(_) | Layer::Activation(_) => Err(Error::ModuleNotFound(format!(
                "{} has no parameter `{param}`",
                self.kind()
            ))),
        }
    }
}

/// Value flowing through a forward pass
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Ids(Vec<u32>),
    /// `[seq, hidden]`
    Hidden(Array2<f32>),
}

impl Flow {
    pub fn into_hidden(self) -> Result<Array2<f32>> {
        match self {
            Flow::Hidden(h) => Ok(h),
            Flow::Ids(_) => Err(Error::InvalidParameter(
                "expected hidden states, got token ids".to_string(),
            )),
        }
    }
}

/// Observer of a forward pass
pub trait ForwardHook {
    /// Called with the input of every linear layer, by qualified name
    fn on_linear_input(&mut self, _name: &str, _x: ArrayView2<'_, f32>) -> Result<()> {
        Ok(())
    }
}

/// Hook that observes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl ForwardHook for NoHook {}

/// Outcome of binding a state dict into a module tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Expected by the tree, absent from the state dict
    pub missing: Vec<String>,
    /// Present in the state dict, unknown to the tree
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub layer: Layer,
    children: Vec<(String, Module)>,
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl Module {
    pub fn new(layer: Layer) -> Self {
        Self {
            layer,
            children: Vec::new(),
        }
    }

    pub fn sequential() -> Self {
        Self::new(Layer::Container(ContainerKind::Sequential))
    }

    pub fn residual() -> Self {
        Self::new(Layer::Container(ContainerKind::Residual))
    }

    /// Builder-style child insertion
    pub fn with_child(mut self, name: impl Into<String>, child: Module) -> Self {
        self.push_child(name, child);
        self
    }

    pub fn push_child(&mut self, name: impl Into<String>, child: Module) {
        self.children.push((name.into(), child));
    }

    pub fn named_children(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(n, m)| (n.as_str(), m))
    }

    pub fn named_children_mut(&mut self) -> impl Iterator<Item = (&str, &mut Module)> {
        self.children.iter_mut().map(|(n, m)| (n.as_str(), m))
    }

    /// Every node with its qualified name, pre-order; the root is `""`
    pub fn named_modules(&self) -> Vec<(String, &Module)> {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), self)];
        while let Some((name, module)) = stack.pop() {
            for (child_name, child) in module.children.iter().rev() {
                stack.push((join(&name, child_name), child));
            }
            out.push((name, module));
        }
        out
    }

    /// Qualified names of all linear-like leaves, in graph order
    pub fn linear_names(&self) -> Vec<String> {
        self.named_modules()
            .into_iter()
            .filter(|(_, m)| m.layer.is_linear())
            .map(|(n, _)| n)
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for segment in path.split('.') {
            node = node
                .children
                .iter()
                .find_map(|(n, m)| (n == segment).then_some(m))?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for segment in path.split('.') {
            node = node
                .children
                .iter_mut()
                .find_map(|(n, m)| (n == segment).then_some(m))?;
        }
        Some(node)
    }

    /// Swap the node at `path` for `module`, returning the old node
    pub fn replace(&mut self, path: &str, module: Module) -> Result<Module> {
        let (parent, name) = match path.rsplit_once('.') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        let parent_node = self
            .get_mut(parent)
            .ok_or_else(|| Error::ModuleNotFound(parent.to_string()))?;
        let slot = parent_node
            .children
            .iter_mut()
            .find_map(|(n, m)| (n == name).then_some(m))
            .ok_or_else(|| Error::ModuleNotFound(path.to_string()))?;
        Ok(std::mem::replace(slot, module))
    }

    pub fn state_dict(&self) -> StateDict {
        let mut out = StateDict::new();
        for (name, module) in self.named_modules() {
            module.layer.state_dict(&name, &mut out);
        }
        out
    }

    /// Bind tensors by exact key match.
    ///
    /// Keys on only one side are reported, not fatal; a shape disagreement on
    /// a shared key is [`Error::ShapeMismatch`].
    pub fn load_state_dict(&mut self, dict: &StateDict) -> Result<LoadReport> {
        let expected = self.state_dict();
        let mut report = LoadReport::default();
        for (key, slot) in &expected {
            let Some(tensor) = dict.get(key) else {
                report.missing.push(key.clone());
                continue;
            };
            check_shape(key, tensor, &slot.shape)?;
            let (path, param) = key.rsplit_once('.').unwrap_or(("", key.as_str()));
            let node = self
                .get_mut(path)
                .ok_or_else(|| Error::ModuleNotFound(path.to_string()))?;
            node.layer.load_param(param, tensor)?;
        }
        report.unexpected = dict
            .keys()
            .filter(|k| !expected.contains_key(*k))
            .cloned()
            .collect();
        Ok(report)
    }

    /// Re-round every dense parameter to `dtype`
    pub fn cast(&mut self, dtype: ParamDtype) {
        let names: Vec<String> = self.named_modules().into_iter().map(|(n, _)| n).collect();
        for name in names {
            if let Some(node) = self.get_mut(&name) {
                match &mut node.layer {
                    Layer::Linear(l) => l.cast(dtype),
                    Layer::Embedding(e) => e.cast(dtype),
                    Layer::LayerNorm(n) => n.cast(dtype),
                    Layer::Qat(q) => q.linear.cast(dtype),
                    _ => {}
                }
            }
        }
    }

    /// Stop gradient tracking on every dense parameter
    pub fn freeze(&mut self) {
        let names: Vec<String> = self.named_modules().into_iter().map(|(n, _)| n).collect();
        for name in names {
            if let Some(Module {
                layer: Layer::Linear(l),
                ..
            }) = self.get_mut(&name)
            {
                l.requires_grad = false;
            }
        }
    }

    pub fn forward(&self, input: Flow, hook: &mut dyn ForwardHook) -> Result<Flow> {
        self.forward_named("", input, hook)
    }

    fn forward_named(&self, name: &str, input: Flow, hook: &mut dyn ForwardHook) -> Result<Flow> {
        match &self.layer {
            Layer::Container(kind) => {
                let skip = match (kind, &input) {
                    (ContainerKind::Residual, Flow::Hidden(h)) => Some(h.clone()),
                    _ => None,
                };
                let mut flow = input;
                for (child_name, child) in &self.children {
                    flow = child.forward_named(&join(name, child_name), flow, hook)?;
                }
                match skip {
                    Some(h) => Ok(Flow::Hidden(flow.into_hidden()? + h)),
                    None => Ok(flow),
                }
            }
            Layer::Embedding(e) => match input {
                Flow::Ids(ids) => Ok(Flow::Hidden(e.forward(&ids)?)),
                Flow::Hidden(_) => Err(Error::InvalidParameter(format!(
                    "embedding `{name}` expects token ids"
                ))),
            },
            layer => {
                let x = input.into_hidden()?;
                if layer.is_linear() {
                    hook.on_linear_input(name, x.view())?;
                }
                let y = match layer {
                    Layer::Linear(l) => l.forward(x.view()),
                    Layer::Packed(l) => l.forward(x.view())?,
                    Layer::Int8(l) => l.forward(x.view()),
                    Layer::Qat(l) => l.forward(x.view()),
                    Layer::LayerNorm(n) => n.forward(x.view()),
                    Layer::Activation(a) => a.forward(x.view()),
                    Layer::Container(_) | Layer::Embedding(_) => {
                        return Err(Error::InvalidParameter(format!(
                            "`{name}` cannot be applied to hidden states"
                        )))
                    }
                };
                Ok(Flow::Hidden(y))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::state::StateTensor;
    use ndarray::array;

    fn tiny() -> Module {
        let fc = |i, o| Module::new(Layer::Linear(Linear::empty(i, o, false, ParamDtype::F32)));
        Module::sequential()
            .with_child(
                "block",
                Module::residual()
                    .with_child("up", fc(2, 4))
                    .with_child("act", Module::new(Layer::Activation(Activation::Relu)))
                    .with_child("down", fc(4, 2)),
            )
            .with_child("lm_head", fc(2, 3))
    }

    // ===== Traversal Tests =====

    #[test]
    fn test_named_modules_is_preorder() {
        let m = tiny();
        let names: Vec<String> = m.named_modules().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["", "block", "block.up", "block.act", "block.down", "lm_head"]);
    }

    #[test]
    fn test_replace_swaps_only_the_target() {
        let mut m = tiny();
        let new = Module::new(Layer::Linear(Linear::empty(2, 4, true, ParamDtype::F32)));
        let old = m.replace("block.up", new).unwrap();
        assert!(matches!(old.layer, Layer::Linear(ref l) if !l.has_bias()));
        assert!(matches!(m.get("block.up").unwrap().layer, Layer::Linear(ref l) if l.has_bias()));
        assert!(m.replace("block.missing", Module::sequential()).is_err());
    }

    #[test]
    fn test_linear_names() {
        assert_eq!(tiny().linear_names(), vec!["block.up", "block.down", "lm_head"]);
    }

    // ===== State Dict Tests =====

    #[test]
    fn test_load_reports_missing_and_unexpected() {
        let mut m = tiny();
        let mut sd = m.state_dict();
        sd.remove("lm_head.weight");
        sd.insert("extra.weight".into(), StateTensor::from_f32(vec![1], &[0.0], ParamDtype::F32));
        let report = m.load_state_dict(&sd).unwrap();
        assert_eq!(report.missing, vec!["lm_head.weight"]);
        assert_eq!(report.unexpected, vec!["extra.weight"]);
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let mut m = tiny();
        let mut sd = m.state_dict();
        sd.insert(
            "block.up.weight".into(),
            StateTensor::from_f32(vec![2, 2], &[0.0; 4], ParamDtype::F32),
        );
        assert!(matches!(m.load_state_dict(&sd), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_load_binds_values() {
        let mut m = tiny();
        let mut sd = m.state_dict();
        sd.insert(
            "lm_head.weight".into(),
            StateTensor::from_f32(vec![3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], ParamDtype::F32),
        );
        assert!(m.load_state_dict(&sd).unwrap().is_clean());
        let Layer::Linear(l) = &m.get("lm_head").unwrap().layer else {
            panic!("lm_head should be dense");
        };
        assert_eq!(l.weight, array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
    }

    // ===== Forward Tests =====

    struct Recorder(Vec<String>);

    impl ForwardHook for Recorder {
        fn on_linear_input(&mut self, name: &str, _x: ArrayView2<'_, f32>) -> Result<()> {
            self.0.push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_residual_adds_input_and_hooks_see_every_linear() {
        let m = tiny();
        let mut rec = Recorder(Vec::new());
        let x = array![[1.0f32, -2.0]];
        let out = m.forward(Flow::Hidden(x), &mut rec).unwrap().into_hidden().unwrap();
        // zero weights: block is the identity, lm_head maps to zeros
        assert_eq!(out, Array2::<f32>::zeros((1, 3)));
        assert_eq!(rec.0, vec!["block.up", "block.down", "lm_head"]);
    }
}
