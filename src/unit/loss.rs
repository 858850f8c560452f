use weft_derive::Unit;

use super::{ComputableUnit, Graph, UnitBase, UnitMetaData, check_inputs};
use crate::{
    error::{Error, Result},
    hal,
};

pub const MSE: &str = "MSE";
pub const CROSS_ENTROPY: &str = "CrossEntropy";

pub const PREDICTION: &str = "prediction";
pub const LABEL: &str = "label";

const EPSILON: f32 = 1e-7;

/// Checks the inputs of a loss and builds its base. Each sample's loss is one value.
fn build(meta: &UnitMetaData, graph: &Graph) -> Result<UnitBase> {
    check_inputs(meta, &[PREDICTION, LABEL])?;
    let unit = meta.id();
    let (Some(prediction), Some(label)) = (meta.input(PREDICTION), meta.input(LABEL)) else {
        return Err(Error::Arity {
            unit: unit.clone(),
            expected: 2,
            got: meta.inputs().len(),
        });
    };
    if prediction.shape != label.shape {
        return Err(Error::ShapeMismatch {
            unit: unit.clone(),
            name: LABEL.into(),
            expected: prediction.shape.clone(),
            got: label.shape.clone(),
        });
    }
    if meta.output_shape().size() != 1 {
        return Err(Error::ShapeMismatch {
            unit: unit.clone(),
            name: "output".into(),
            expected: [1].into(),
            got: meta.output_shape().clone(),
        });
    }
    UnitBase::new(meta, graph)
}

/// Runs `f(prediction, label)` per sample, writing one loss value per sample.
fn forward_with(base: &mut UnitBase, f: impl Fn(&[f32], &[f32]) -> f32) -> Result<()> {
    let prediction = base.input(PREDICTION)?;
    let size = prediction.shape().size().max(1);
    let p = prediction.data().to_vec();
    let l = base.input(LABEL)?.data().to_vec();
    base.forward_output.write_with(|loss| {
        for ((loss, p), l) in loss
            .iter_mut()
            .zip(p.chunks_exact(size))
            .zip(l.chunks_exact(size))
        {
            *loss = f(p, l);
        }
    });
    Ok(())
}

/// Hands `f` the gradient sent to the prediction's producer, along with the prediction and
/// the label.
fn backward_with(base: &mut UnitBase, f: impl FnOnce(&mut [f32], &[f32], &[f32])) -> Result<()> {
    let (p, l) = (
        base.input(PREDICTION)?.data().to_vec(),
        base.input(LABEL)?.data().to_vec(),
    );
    let Some(producer) = base.inputs.get(PREDICTION) else {
        return Ok(());
    };
    if let Some(dp) = base.backward_outputs.get_mut(producer) {
        dp.write_with(|dp| f(dp, &p, &l));
    }
    Ok(())
}

#[inline]
fn mean_loss(base: &UnitBase) -> f32 {
    let loss = base.forward_output.data();
    loss.iter().sum::<f32>() / loss.len().max(1) as f32
}

/// Mean squared error: `L = mean((p - l)²)` per sample, averaged over the batch.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct Mse(UnitBase);

impl Mse {
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        build(meta, graph).map(Self)
    }
}

impl ComputableUnit for Mse {
    fn forward(&mut self) -> Result<()> {
        forward_with(&mut self.0, |p, l| {
            let n = p.len().max(1) as f32;
            p.iter().zip(l).map(|(p, l)| (p - l).powi(2)).sum::<f32>() / n
        })
    }

    fn backward(&mut self) -> Result<()> {
        let batch = self.0.forward_output.batch().max(1) as f32;
        let n = self.0.input(PREDICTION)?.shape().size().max(1) as f32;
        backward_with(&mut self.0, |dp, p, l| {
            let mut diff = vec![0.0; p.len()];
            hal::sub(&mut diff, p, l);
            hal::scalar_mul(dp, &diff, 2.0 / (n * batch));
        })
    }

    fn loss(&self) -> Option<f32> {
        Some(mean_loss(&self.0))
    }
}

/// Cross entropy against a probability label: `L = -Σ l·ln(p)` per sample, averaged over the
/// batch. Expects `p` to be a distribution, typically a softmax output.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct CrossEntropy(UnitBase);

impl CrossEntropy {
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        build(meta, graph).map(Self)
    }
}

impl ComputableUnit for CrossEntropy {
    fn forward(&mut self) -> Result<()> {
        forward_with(&mut self.0, |p, l| {
            -p.iter()
                .zip(l)
                .map(|(p, l)| l * (p + EPSILON).ln())
                .sum::<f32>()
        })
    }

    fn backward(&mut self) -> Result<()> {
        let batch = self.0.forward_output.batch().max(1) as f32;
        backward_with(&mut self.0, |dp, p, l| {
            dp.iter_mut()
                .zip(p.iter().zip(l))
                .for_each(|(dp, (&p, &l))| *dp = -l / ((p + EPSILON) * batch))
        })
    }

    fn loss(&self) -> Option<f32> {
        Some(mean_loss(&self.0))
    }
}
