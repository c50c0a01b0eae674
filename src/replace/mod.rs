//! Module replacement engine
//!
//! Walks a module tree and swaps dense linear layers for packed low-bit
//! layers, either empty (to be bound from a checkpoint) or filled from a
//! [`WeightQuantizer`](crate::quant::WeightQuantizer).

mod engine;
mod exclusion;
mod export;

pub use engine::{build_woq_model, pack_woq_layer, replace_linear, ReplaceMode, ReplaceOptions};
pub use exclusion::{Exclusion, ExclusionPredicate, DEFAULT_EXCLUDED_MODULES};
pub use export::recover_export_model;
