//! Model graph and layers
//!
//! - [`Module`]: named tree of layers with explicit-stack traversal
//! - [`Linear`], [`PackedLinear`], [`Int8Linear`], [`QatLinear`]: the linear
//!   layer flavours the quantization paths swap between
//! - [`CausalLm`]: a loaded model with its configs and persister

mod int8;
mod layers;
mod linear;
mod model;
mod module;
mod packed;
mod qat_linear;
pub mod state;

pub use int8::{ActQuant, Int8Linear};
pub use layers::{Activation, Embedding, LayerNorm};
pub use linear::Linear;
pub use model::{
    CausalLm, MlpLmFactory, ModelConfig, ModelFactory, CONFIG_NAME, GENERATION_CONFIG_NAME,
};
pub use module::{ContainerKind, Flow, ForwardHook, Layer, LoadReport, Module, NoHook};
pub use packed::{PackFormat, PackedLinear, QWeight, QZeros, RecoveredQParams};
pub use qat_linear::QatLinear;
pub use state::{StateDict, StateTensor};
