//! # Cuantizar: weight-only post-training quantization
//!
//! Cuantizar compresses the linear layers of causal language models to
//! 4/8-bit (and fp4/fp8/nf4) codes with per-group scales, persists them as
//! safetensors checkpoints and reloads them back into the same packed layout.
//!
//! ## Architecture
//!
//! - **config**: tagged `QuantizationConfig`, dtypes, YAML recipes, CLI schema
//! - **calibration**: tokenizer and dataset seams, batch building, bounded loader
//! - **nn**: model graph with dense, packed and int8 layers
//! - **quant**: RTN, AWQ, TEQ, GPTQ and AutoRound kernels, observers, packing
//! - **replace**: swapping dense linears for packed ones and exporting them
//! - **ptq** / **qat**: SmoothQuant, static, dynamic and quantization-aware training
//! - **optim**: SGD used by TEQ and QAT
//! - **dispatch**: the load-and-quantize state machine and the fast runtime
//! - **io**: checkpoint files, key manifest, save and reload
//! - **hub** (feature `hub`): fetching checkpoints from the HuggingFace Hub

pub mod calibration;
pub mod config;
pub mod dispatch;
pub mod io;
pub mod nn;
pub mod optim;
pub mod ptq;
pub mod qat;
pub mod quant;
pub mod replace;

#[cfg(feature = "hub")]
pub mod hub;

pub mod error;

// Re-export commonly used types
pub use config::QuantizationConfig;
pub use dispatch::{Dispatcher, LoadRequest, LoadedModel};
pub use error::{Error, Result};
pub use nn::CausalLm;
