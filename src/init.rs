//! Strategies filling a tensor once, for constants and trainable parameters.

use std::fmt::Debug;

use crate::loom::tensor::Tensor;

/// Fills a tensor in place. Filling counts as a write and bumps the tensor's state.
pub trait Initializer: Debug + Send + Sync {
    fn initialize(&self, tensor: &mut Tensor);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Zeros;

impl Initializer for Zeros {
    fn initialize(&self, tensor: &mut Tensor) {
        tensor.write_with(|data| data.fill(0.0));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ones;

impl Initializer for Ones {
    fn initialize(&self, tensor: &mut Tensor) {
        tensor.write_with(|data| data.fill(1.0));
    }
}

/// Every element set to the same value.
#[derive(Debug, Clone, Copy)]
pub struct Fill(pub f32);

impl Initializer for Fill {
    fn initialize(&self, tensor: &mut Tensor) {
        tensor.write_with(|data| data.fill(self.0));
    }
}

/// Repeats `values` over the whole buffer; for each sample of a batch when its length is one
/// sample's size.
#[derive(Debug, Clone)]
pub struct Values(pub Vec<f32>);

impl Initializer for Values {
    fn initialize(&self, tensor: &mut Tensor) {
        let values = &self.0;
        tensor.write_with(|data| {
            if values.is_empty() {
                data.fill(0.0);
                return;
            }
            data.iter_mut()
                .zip(values.iter().cycle())
                .for_each(|(x, &v)| *x = v);
        });
    }
}

#[inline]
fn rng(seed: Option<u64>) -> fastrand::Rng {
    match seed {
        Some(seed) => fastrand::Rng::with_seed(seed),
        None => fastrand::Rng::new(),
    }
}

/// Samples from `U(low, high)`.
#[derive(Debug, Clone, Copy)]
pub struct Uniform {
    pub low: f32,
    pub high: f32,
    pub seed: Option<u64>,
}

impl Initializer for Uniform {
    fn initialize(&self, tensor: &mut Tensor) {
        let mut rng = rng(self.seed);
        let range = self.high - self.low;
        tensor.write_with(|data| {
            data.iter_mut()
                .for_each(|x| *x = self.low + range * rng.f32())
        });
    }
}

/// Samples from `N(mean, std²)` with the Box-Muller transform.
#[derive(Debug, Clone, Copy)]
pub struct Normal {
    pub mean: f32,
    pub std: f32,
    pub seed: Option<u64>,
}

impl Initializer for Normal {
    fn initialize(&self, tensor: &mut Tensor) {
        let mut rng = rng(self.seed);
        tensor.write_with(|data| {
            for x in data.iter_mut() {
                let u = 1.0 - rng.f32();
                let v = rng.f32();
                let z = (-2.0 * u.ln()).sqrt() * (std::f32::consts::TAU * v).cos();
                *x = self.mean + self.std * z;
            }
        });
    }
}

/// Glorot uniform: `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`, fans taken from the
/// tensor's shape viewed as `[fan_in, fan_out]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xavier {
    pub seed: Option<u64>,
}

impl Initializer for Xavier {
    fn initialize(&self, tensor: &mut Tensor) {
        let (fan_in, fan_out) = tensor.shape().rows_cols();
        let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
        Uniform {
            low: -bound,
            high: bound,
            seed: self.seed,
        }
        .initialize(tensor)
    }
}
