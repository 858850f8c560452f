use itertools::Itertools;
use weft_derive::Unit;

use super::{ComputableUnit, Graph, UnitBase, UnitId, UnitMetaData};
use crate::{
    error::{Error, Result, TensorResultExt},
    hal,
    loom::tensor::Tensor,
    optim::Optimizer,
};

pub const DENSE: &str = "Dense";
pub const BIAS: &str = "bias";

/// Name of the weight variable applied to input `input`.
pub fn weight_name(input: &str) -> String {
    format!("weight.{input}")
}

#[derive(Debug)]
struct Weight {
    input: String,
    variable: String,
    producer: UnitId,
    size: usize,
    tensor: Tensor,
}

/// Fully connected layer over any number of named inputs: `y = Σᵢ xᵢ·Wᵢ + b`.
///
/// Each input `name` of per-sample size `n` needs a variable `weight.<name>` of shape
/// `[n, m]`, where `m` is the output size; the bias variable `bias` has shape `[m]`.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct Dense {
    #[unit]
    base: UnitBase,
    weights: Vec<Weight>,
    bias: Tensor,
    optimizer: Box<dyn Optimizer>,
}

impl Dense {
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        let id = meta.id();
        if meta.inputs().is_empty() {
            return Err(Error::Arity {
                unit: id.clone(),
                expected: 1,
                got: 0,
            });
        }
        let base = UnitBase::new(meta, graph)?;
        let out = meta.output_shape().size();

        let variable = |name: &str, shape: Vec<usize>| {
            let Some(variable) = meta.variable(name) else {
                return Err(Error::MissingVariable {
                    unit: id.clone(),
                    name: name.to_owned(),
                });
            };
            if variable.shape.to_vec() != shape {
                return Err(Error::ShapeMismatch {
                    unit: id.clone(),
                    name: name.to_owned(),
                    expected: shape.into(),
                    got: variable.shape.clone(),
                });
            }
            let mut tensor = Tensor::zeros(variable.shape.clone(), 1);
            variable.initializer.initialize(&mut tensor);
            Ok(tensor)
        };

        let weights = meta
            .inputs()
            .iter()
            .sorted_by(|(x, _), (y, _)| x.cmp(y))
            .map(|(input, declared)| {
                let size = declared.shape.size();
                let name = weight_name(input);
                let tensor = variable(&name, vec![size, out])?;
                Ok(Weight {
                    input: input.clone(),
                    variable: name,
                    producer: declared.producer.clone(),
                    size,
                    tensor,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let bias = variable(BIAS, vec![out])?;
        let optimizer = graph.optimizer();

        Ok(Self {
            base,
            weights,
            bias,
            optimizer,
        })
    }
}

impl ComputableUnit for Dense {
    fn forward(&mut self) -> Result<()> {
        let UnitBase {
            id,
            forward_inputs,
            forward_output,
            ..
        } = &mut self.base;
        let batch = forward_output.batch();
        let out = self.bias.len();

        let xs = self
            .weights
            .iter()
            .map(|w| {
                forward_inputs
                    .get(&w.producer)
                    .map(Tensor::data)
                    .ok_or_else(|| Error::MissingInput {
                        unit: id.clone(),
                        name: w.input.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut product = vec![0.0; batch * out];
        forward_output.write_with(|y| {
            for row in y.chunks_exact_mut(out) {
                row.copy_from_slice(self.bias.data());
            }
            for (w, x) in self.weights.iter().zip_eq(xs) {
                hal::multiply(&mut product, x, w.tensor.data(), batch, w.size, out);
                y.iter_mut().zip(&product).for_each(|(y, &p)| *y += p);
            }
        });
        Ok(())
    }

    fn backward(&mut self) -> Result<()> {
        let g = self.base.average_gradient();
        let UnitBase {
            id,
            forward_inputs,
            forward_output,
            backward_outputs,
            ..
        } = &mut self.base;
        let batch = forward_output.batch();
        let out = self.bias.len();

        let mut grads = Vec::with_capacity(self.weights.len());
        for w in &self.weights {
            let x = forward_inputs
                .get(&w.producer)
                .ok_or_else(|| Error::MissingInput {
                    unit: id.clone(),
                    name: w.input.clone(),
                })?;

            // dx = g·Wᵀ
            if let Some(dx) = backward_outputs.get_mut(&w.producer) {
                let mut wt = vec![0.0; w.size * out];
                hal::transpose(&mut wt, w.tensor.data(), w.size, out);
                dx.write_with(|dx| hal::multiply(dx, &g, &wt, batch, out, w.size));
            }

            // dW = xᵀ·g
            let mut xt = vec![0.0; w.size * batch];
            hal::transpose(&mut xt, x.data(), batch, w.size);
            let mut dw = vec![0.0; w.size * out];
            hal::multiply(&mut dw, &xt, &g, w.size, batch, out);
            grads.push(Tensor::from_data(w.tensor.shape().clone(), 1, dw).on_unit(id)?);
        }

        let mut db = vec![0.0; out];
        hal::shrink(&mut db, &g, out);
        let db = Tensor::from_data(self.bias.shape().clone(), 1, db).on_unit(id)?;

        for (w, grad) in self.weights.iter_mut().zip_eq(&grads) {
            self.optimizer.optimize(&mut w.tensor, grad).on_unit(id)?;
        }
        self.optimizer.optimize(&mut self.bias, &db).on_unit(id)?;

        log::trace!("[{id}] updated {} parameters", grads.len() + 1);
        Ok(())
    }

    fn reset_state(&mut self) {
        self.base.reset_state();
        self.weights.iter_mut().for_each(|w| w.tensor.reset_state());
        self.bias.reset_state();
    }

    fn trainables(&self) -> Vec<(&str, &Tensor)> {
        self.weights
            .iter()
            .map(|w| (w.variable.as_str(), &w.tensor))
            .chain(std::iter::once((BIAS, &self.bias)))
            .collect()
    }
}
