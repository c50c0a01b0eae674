//! Optimizer trait

use super::TrainableParam;

/// Trait for optimization algorithms
pub trait Optimizer {
    /// Perform a single optimization step
    fn step(&mut self, params: &mut [&mut TrainableParam]);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [&mut TrainableParam]) {
        for param in params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);
}
