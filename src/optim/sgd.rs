//! Stochastic Gradient Descent optimizer

use super::{Optimizer, TrainableParam};
use ndarray::Array2;

/// SGD optimizer with optional momentum
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
    momentum: f32,
    velocities: Vec<Option<Array2<f32>>>,
}

impl SGD {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocities: Vec::new(),
        }
    }

    fn ensure_velocities(&mut self, n: usize) {
        if self.velocities.len() != n {
            self.velocities = vec![None; n];
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [&mut TrainableParam]) {
        self.ensure_velocities(params.len());

        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad.as_ref() else {
                continue;
            };
            if self.momentum > 0.0 {
                // v = momentum * v - lr * grad
                let velocity = match &self.velocities[i] {
                    Some(v) => v * self.momentum - grad * self.lr,
                    None => grad * (-self.lr),
                };
                param.value += &velocity;
                self.velocities[i] = Some(velocity);
            } else {
                // param -= lr * grad
                let update = grad * self.lr;
                param.value -= &update;
            }
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Sign-of-gradient descent, as used by rounding-offset search
#[derive(Debug, Clone)]
pub struct SignSGD {
    lr: f32,
}

impl SignSGD {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for SignSGD {
    fn step(&mut self, params: &mut [&mut TrainableParam]) {
        for param in params.iter_mut() {
            let Some(grad) = param.grad.as_ref() else {
                continue;
            };
            let update = grad.mapv(|g| if g == 0.0 { 0.0 } else { g.signum() });
            param.value.scaled_add(-self.lr, &update);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
