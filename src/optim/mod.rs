//! Optimizers for the trainable parts of quantization (TEQ scales,
//! AutoRound offsets, QAT weights)

mod optimizer;
mod param;
mod sgd;


pub use optimizer::Optimizer;
pub use param::TrainableParam;
pub use sgd::{SignSGD, SGD};
