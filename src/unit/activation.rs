use weft_derive::Unit;

use super::{ComputableUnit, Graph, UnitBase, UnitMetaData, check_inputs, check_same_shape};
use crate::{error::Result, hal};

pub const RELU: &str = "ReLU";
pub const SIGMOID: &str = "Sigmoid";
pub const SOFTMAX: &str = "SoftMax";

/// Name of the single input of an activation.
pub const INPUT: &str = "input";

fn build(meta: &UnitMetaData, graph: &Graph) -> Result<UnitBase> {
    check_inputs(meta, &[INPUT])?;
    check_same_shape(meta, INPUT)?;
    UnitBase::new(meta, graph)
}

/// Writes `f(x)` into the output, `x` being the copy of the single input.
fn forward_with(base: &mut UnitBase, f: impl FnOnce(&mut [f32], &[f32])) -> Result<()> {
    let x = base.input(INPUT)?.data().to_vec();
    base.forward_output.write_with(|y| f(y, &x));
    Ok(())
}

/// Writes `f(dx, g, y)` into the gradient sent to the producer, `g` being the mean gradient
/// received and `y` the last forward output.
fn backward_with(base: &mut UnitBase, f: impl Fn(&mut [f32], &[f32], &[f32])) -> Result<()> {
    let g = base.average_gradient();
    let UnitBase {
        forward_output,
        backward_outputs,
        ..
    } = base;
    for dx in backward_outputs.values_mut() {
        dx.write_with(|dx| f(dx, &g, forward_output.data()));
    }
    Ok(())
}

/// Rectified linear unit: `y = max(x, 0)`.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct Relu(UnitBase);

impl Relu {
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        build(meta, graph).map(Self)
    }
}

impl ComputableUnit for Relu {
    fn forward(&mut self) -> Result<()> {
        forward_with(&mut self.0, |y, x| hal::apply(y, x, |x| x.max(0.0)))
    }

    fn backward(&mut self) -> Result<()> {
        backward_with(&mut self.0, |dx, g, y| {
            let mut mask = vec![0.0; y.len()];
            hal::apply(&mut mask, y, |y| if y > 0.0 { 1.0 } else { 0.0 });
            hal::dot(dx, g, &mask);
        })
    }
}

/// Logistic function: `y = 1 / (1 + e⁻ˣ)`.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct Sigmoid(UnitBase);

impl Sigmoid {
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        build(meta, graph).map(Self)
    }
}

impl ComputableUnit for Sigmoid {
    fn forward(&mut self) -> Result<()> {
        forward_with(&mut self.0, |y, x| {
            hal::apply(y, x, |x| 1.0 / (1.0 + (-x).exp()))
        })
    }

    fn backward(&mut self) -> Result<()> {
        backward_with(&mut self.0, |dx, g, y| {
            let mut slope = vec![0.0; y.len()];
            hal::apply(&mut slope, y, |y| y * (1.0 - y));
            hal::dot(dx, g, &slope);
        })
    }
}

/// Softmax over the last dimension of each sample.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct Softmax(UnitBase);

impl Softmax {
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        build(meta, graph).map(Self)
    }

    #[inline]
    fn cols(&self) -> usize {
        self.0.forward_output.shape().rows_cols().1
    }
}

impl ComputableUnit for Softmax {
    fn forward(&mut self) -> Result<()> {
        let cols = self.cols();
        forward_with(&mut self.0, |y, x| hal::softmax(y, x, cols))
    }

    fn backward(&mut self) -> Result<()> {
        let cols = self.cols();
        // dxᵢ = yᵢ·(gᵢ - Σⱼ gⱼ·yⱼ)
        backward_with(&mut self.0, |dx, g, y| {
            for ((dx, g), y) in dx
                .chunks_exact_mut(cols)
                .zip(g.chunks_exact(cols))
                .zip(y.chunks_exact(cols))
            {
                let inner: f32 = g.iter().zip(y).map(|(g, y)| g * y).sum();
                dx.iter_mut()
                    .zip(g.iter().zip(y))
                    .for_each(|(dx, (g, y))| *dx = y * (g - inner));
            }
        })
    }
}
