//! Parameter update rules applied by trainable units during backward.

use std::fmt::Debug;

use dyn_clone::DynClone;
use rustc_hash::FxHashMap as HashMap;

use crate::{
    error::{Error, Result},
    hal,
    loom::tensor::{Tensor, TensorError, TensorId},
};

/// Updates a parameter in place from its gradient. The update is a write: it bumps the
/// parameter's state.
///
/// Every trainable unit receives its own clone of the optimizer chosen at compile time, so
/// per-parameter slots (velocities, moments) never cross unit boundaries.
pub trait Optimizer: Debug + Send + DynClone {
    fn name(&self) -> &'static str;

    fn optimize(&mut self, param: &mut Tensor, grad: &Tensor) -> Result<(), TensorError>;
}

dyn_clone::clone_trait_object!(Optimizer);

#[inline]
fn check(param: &Tensor, grad: &Tensor) -> Result<(), TensorError> {
    if param.shape() != grad.shape() {
        return Err(TensorError::Shape(param.shape().clone(), grad.shape().clone()));
    }
    if param.len() != grad.len() {
        let expected = param.len();
        let got = grad.len();
        return Err(TensorError::Size { expected, got });
    }
    Ok(())
}

/// Plain gradient descent: `θ ← θ - η·g`.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn optimize(&mut self, param: &mut Tensor, grad: &Tensor) -> Result<(), TensorError> {
        check(param, grad)?;
        let mut step = vec![0.0; grad.len()];
        hal::scalar_mul(&mut step, grad.data(), self.learning_rate);
        let data = param.data().to_vec();
        param.write_with(|output| hal::sub(output, &data, &step));
        Ok(())
    }
}

/// Gradient descent with momentum: `v ← μ·v + g`, `θ ← θ - η·v`.
#[derive(Debug, Clone)]
pub struct Momentum {
    pub learning_rate: f32,
    pub momentum: f32,
    velocity: HashMap<uid::Id<TensorId>, Vec<f32>>,
}

impl Momentum {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: Default::default(),
        }
    }
}

impl Optimizer for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn optimize(&mut self, param: &mut Tensor, grad: &Tensor) -> Result<(), TensorError> {
        check(param, grad)?;
        let (lr, mu) = (self.learning_rate, self.momentum);
        let velocity = self
            .velocity
            .entry(param.id())
            .or_insert_with(|| vec![0.0; grad.len()]);
        velocity
            .iter_mut()
            .zip(grad.data())
            .for_each(|(v, &g)| *v = mu * *v + g);
        param.write_with(|data| {
            data.iter_mut()
                .zip(velocity.iter())
                .for_each(|(x, &v)| *x -= lr * v)
        });
        Ok(())
    }
}

/// Builds an optimizer by name. Names are case-insensitive.
///
/// | name       | parameters                   |
/// |------------|------------------------------|
/// | `sgd`      | `[learning_rate]`            |
/// | `momentum` | `[learning_rate, momentum]`  |
pub fn create(name: &str, params: &[f32]) -> Result<Box<dyn Optimizer>> {
    let invalid = |expected: usize| Error::InvalidParams {
        optimizer: name.to_owned(),
        expected,
        got: params.to_vec(),
    };
    let valid_rate = |lr: f32| lr.is_finite() && lr >= 0.0;

    match name.to_ascii_lowercase().as_str() {
        "sgd" => match *params {
            [learning_rate] if valid_rate(learning_rate) => Ok(Box::new(Sgd { learning_rate })),
            _ => Err(invalid(1)),
        },
        "momentum" => match *params {
            [learning_rate, momentum] if valid_rate(learning_rate) && momentum.is_finite() => {
                Ok(Box::new(Momentum::new(learning_rate, momentum)))
            }
            _ => Err(invalid(2)),
        },
        _ => Err(Error::UnsupportedOptimizer(name.to_owned())),
    }
}
