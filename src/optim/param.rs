//! Trainable parameter with an attached gradient

use ndarray::Array2;

/// A dense parameter the optimizers update in place
#[derive(Debug, Clone, PartialEq)]
pub struct TrainableParam {
    pub value: Array2<f32>,
    pub grad: Option<Array2<f32>>,
}

impl TrainableParam {
    pub fn new(value: Array2<f32>) -> Self {
        Self { value, grad: None }
    }

    pub fn set_grad(&mut self, grad: Array2<f32>) {
        self.grad = Some(grad);
    }

    /// Add to the stored gradient, starting from zero
    pub fn accumulate_grad(&mut self, grad: &Array2<f32>) {
        match &mut self.grad {
            Some(g) => *g += grad,
            None => self.grad = Some(grad.clone()),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}
