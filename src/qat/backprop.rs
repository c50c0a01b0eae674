//! Reverse pass over the module tree
//!
//! The training forward records the input of every leaf on a [`Tape`];
//! the backward walks the tree in reverse, turning the loss gradient into
//! weight gradients for the fake-quantized layers. Every other parameter is
//! treated as a constant.

use crate::nn::{ContainerKind, Flow, Layer, LayerNorm, Module};
use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis, Zip};
use std::collections::HashMap;

/// Leaf inputs of one training forward, by qualified name
#[derive(Debug, Default)]
pub struct Tape {
    inputs: HashMap<String, Array2<f32>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    fn input(&self, name: &str) -> Result<&Array2<f32>> {
        self.inputs
            .get(name)
            .ok_or_else(|| Error::InvalidParameter(format!("no recorded input for `{name}`")))
    }
}

/// Gradients of one fake-quantized linear
#[derive(Debug, Clone)]
pub struct LayerGrad {
    pub name: String,
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Forward that updates QAT observers and records leaf inputs
pub fn forward_train(
    module: &mut Module,
    name: &str,
    input: Flow,
    tape: &mut Tape,
) -> Result<Flow> {
    let container = match module.layer {
        Layer::Container(kind) => Some(kind),
        _ => None,
    };
    if let Some(kind) = container {
        let skip = match (kind, &input) {
            (ContainerKind::Residual, Flow::Hidden(h)) => Some(h.clone()),
            _ => None,
        };
        let mut flow = input;
        for (child_name, child) in module.named_children_mut() {
            flow = forward_train(child, &join(name, child_name), flow, tape)?;
        }
        return match skip {
            Some(h) => Ok(Flow::Hidden(flow.into_hidden()? + h)),
            None => Ok(flow),
        };
    }

    if let Layer::Embedding(e) = &module.layer {
        return match input {
            Flow::Ids(ids) => Ok(Flow::Hidden(e.forward(&ids)?)),
            Flow::Hidden(_) => Err(Error::InvalidParameter(format!(
                "embedding `{name}` expects token ids"
            ))),
        };
    }

    let x = input.into_hidden()?;
    let y = match &mut module.layer {
        Layer::Qat(q) => q.forward_train(x.view()),
        Layer::Linear(l) => l.forward(x.view()),
        Layer::Packed(p) => p.forward(x.view())?,
        Layer::Int8(l) => l.forward(x.view()),
        Layer::LayerNorm(n) => n.forward(x.view()),
        Layer::Activation(a) => a.forward(x.view()),
        Layer::Container(_) | Layer::Embedding(_) => {
            return Err(Error::InvalidParameter(format!(
                "`{name}` cannot be applied to hidden states"
            )))
        }
    };
    tape.inputs.insert(name.to_string(), x);
    Ok(Flow::Hidden(y))
}

fn layer_norm_backward(norm: &LayerNorm, x: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
    let n = x.ncols() as f32;
    let xhat = norm.normalize(x.view());
    let mut out = Array2::<f32>::zeros(x.dim());
    for (((xr, hr), gr), mut or) in x
        .rows()
        .into_iter()
        .zip(xhat.rows())
        .zip(grad.rows())
        .zip(out.rows_mut())
    {
        let mean = xr.sum() / n;
        let var = xr.mapv(|v| (v - mean).powi(2)).sum() / n;
        let inv = 1.0 / (var + norm.eps).sqrt();
        let dxhat = &gr * &norm.weight;
        let m1 = dxhat.sum() / n;
        let m2 = (&dxhat * &hr).sum() / n;
        Zip::from(&mut or)
            .and(&dxhat)
            .and(&hr)
            .for_each(|o, &d, &h| *o = inv * (d - m1 - h * m2));
    }
    out
}

/// Propagate `grad` (w.r.t. the output of `module`) back to its input.
///
/// Returns `None` once the gradient reaches the token embedding.
pub fn backward(
    module: &Module,
    name: &str,
    grad: Array2<f32>,
    tape: &Tape,
    grads: &mut Vec<LayerGrad>,
) -> Result<Option<Array2<f32>>> {
    match &module.layer {
        Layer::Container(kind) => {
            let skip = (*kind == ContainerKind::Residual).then(|| grad.clone());
            let children: Vec<(&str, &Module)> = module.named_children().collect();
            let mut g = grad;
            for (child_name, child) in children.into_iter().rev() {
                match backward(child, &join(name, child_name), g, tape, grads)? {
                    Some(next) => g = next,
                    None => return Ok(None),
                }
            }
            Ok(Some(match skip {
                Some(s) => g + s,
                None => g,
            }))
        }
        Layer::Embedding(_) => Ok(None),
        Layer::Qat(q) => {
            let x = tape.input(name)?;
            let grad_w = q.weight_fq.backward(&grad.t().dot(x), &q.linear.weight);
            grads.push(LayerGrad {
                name: name.to_string(),
                weight: grad_w,
                bias: q.linear.bias.as_ref().map(|_| grad.sum_axis(Axis(0))),
            });
            Ok(Some(grad.dot(&q.effective_weight())))
        }
        Layer::Linear(l) => Ok(Some(grad.dot(&l.weight))),
        Layer::Packed(p) => Ok(Some(grad.dot(&p.dequantize()?))),
        Layer::Int8(l) => {
            let mut g = grad.dot(&l.dequantized_weight());
            if let Some(s) = &l.smooth_scale {
                g /= &s.view().insert_axis(Axis(0));
            }
            Ok(Some(g))
        }
        Layer::Activation(a) => {
            let x = tape.input(name)?;
            Ok(Some(grad * x.mapv(|v| a.grad(v))))
        }
        Layer::LayerNorm(n) => Ok(Some(layer_norm_backward(n, tape.input(name)?, &grad))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamDtype;
    use crate::nn::{Linear, NoHook, QatLinear};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn loss(m: &Module, x: &Array2<f32>) -> f32 {
        let y = m.forward(Flow::Hidden(x.clone()), &mut NoHook).unwrap().into_hidden().unwrap();
        y.sum()
    }

    #[test]
    fn test_layer_norm_gradient_matches_finite_difference() {
        let mut norm = LayerNorm::new(3, 1e-5, ParamDtype::F32);
        norm.weight = array![1.0, 2.0, 0.5];
        let m = Module::new(Layer::LayerNorm(norm.clone()));
        let x = array![[0.3, -1.2, 2.0]];
        let w = array![[1.0, 0.0, -1.0]];
        let analytic = layer_norm_backward(&norm, &x, &w);

        let h = 1e-3;
        for j in 0..3 {
            let f = |delta: f32| {
                let mut xp = x.clone();
                xp[[0, j]] += delta;
                let y = m.forward(Flow::Hidden(xp), &mut NoHook).unwrap().into_hidden().unwrap();
                (&y * &w).sum()
            };
            let numeric = (f(h) - f(-h)) / (2.0 * h);
            assert_abs_diff_eq!(analytic[[0, j]], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_qat_linear_weight_gradient() {
        let linear = Linear::new(
            array![[0.5, -0.25], [0.1, 0.4]],
            Some(array![0.0, 0.0]),
            ParamDtype::F32,
        );
        let mut m = Module::sequential().with_child(
            "fc",
            Module::new(Layer::Qat(QatLinear::wrap(linear))),
        );
        let x = array![[1.0, 2.0], [3.0, -1.0]];

        let mut tape = Tape::new();
        forward_train(&mut m, "", Flow::Hidden(x.clone()), &mut tape).unwrap();
        let mut grads = Vec::new();
        let gx = backward(&m, "", Array2::ones((2, 2)), &tape, &mut grads).unwrap().unwrap();

        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].name, "fc");
        // dL/dW = 1ᵀx for a sum loss; every weight is inside the int8 range
        assert_eq!(grads[0].weight, array![[4.0, 1.0], [4.0, 1.0]]);
        assert_eq!(grads[0].bias, Some(array![2.0, 2.0]));
        assert_eq!(gx.dim(), (2, 2));
        assert!(loss(&m, &x).is_finite());
    }
}
