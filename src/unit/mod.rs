//! Graph nodes.
//!
//! A unit owns the tensors at its end of every edge it touches:
//! - `forward_inputs`: one tensor per producer, receiving copies of the producer's output;
//! - `forward_output`: the unit's own result, read by the manager when propagating;
//! - `backward_inputs`: one tensor per consumer, receiving the gradient the consumer computed;
//! - `backward_outputs`: one tensor per producer, holding the gradient sent back to it.
//!
//! A unit only ever writes its own output side. Copying across edges belongs to
//! [`UnitManager`](crate::manager::UnitManager).

use std::{fmt::Debug, sync::Arc};

use derive_more::Display;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use crate::{
    error::{Error, Result},
    loader::SharedLoader,
    loom::{shape::Shape, tensor::Tensor},
    optim::Optimizer,
};

pub use activation::{Relu, Sigmoid, Softmax};
pub use dense::Dense;
pub use loss::{CrossEntropy, Mse};
pub use meta::{UnitMetaData, Variable};
pub use source::{Constant, Fetcher};
pub use task::{Pass, UnitTask};

pub mod activation;
pub mod dense;
pub mod loss;
pub mod meta;
pub mod source;
pub mod task;

/// Topological role of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnitBaseType {
    /// Source pulling fresh data every forward pass.
    Fetcher,
    /// Source holding fixed data.
    Constant,
    /// Interior node.
    Hidden,
    /// Sink computing a loss.
    Loss,
}

impl UnitBaseType {
    #[inline]
    pub fn is_source(self) -> bool {
        matches!(self, UnitBaseType::Fetcher | UnitBaseType::Constant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("{base}:{name}")]
pub struct UnitType {
    pub base: UnitBaseType,
    pub name: Arc<str>,
}

impl UnitType {
    pub fn new(base: UnitBaseType, name: impl AsRef<str>) -> Self {
        let name = name.as_ref().into();
        Self { base, name }
    }

    pub fn fetcher() -> Self {
        Self::new(UnitBaseType::Fetcher, source::FETCHER)
    }

    pub fn constant() -> Self {
        Self::new(UnitBaseType::Constant, source::CONSTANT)
    }

    pub fn dense() -> Self {
        Self::new(UnitBaseType::Hidden, dense::DENSE)
    }

    pub fn relu() -> Self {
        Self::new(UnitBaseType::Hidden, activation::RELU)
    }

    pub fn sigmoid() -> Self {
        Self::new(UnitBaseType::Hidden, activation::SIGMOID)
    }

    pub fn softmax() -> Self {
        Self::new(UnitBaseType::Hidden, activation::SOFTMAX)
    }

    pub fn mse() -> Self {
        Self::new(UnitBaseType::Loss, loss::MSE)
    }

    pub fn cross_entropy() -> Self {
        Self::new(UnitBaseType::Loss, loss::CROSS_ENTROPY)
    }
}

/// Identity of a unit, unique within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("{name}#{id}")]
pub struct UnitId {
    pub r#type: UnitType,
    pub id: u64,
    pub name: Arc<str>,
}

impl UnitId {
    pub fn new(r#type: UnitType, id: u64, name: impl AsRef<str>) -> Self {
        let name = name.as_ref().into();
        Self { r#type, id, name }
    }

    #[inline]
    pub fn base(&self) -> UnitBaseType {
        self.r#type.base
    }
}

/// The edge tensors of a unit. Map keys are fixed once the unit is built.
#[derive(Debug)]
pub struct UnitBase {
    pub id: UnitId,
    /// Input name → producer.
    pub inputs: HashMap<String, UnitId>,
    /// Producer → copy of its output.
    pub forward_inputs: HashMap<UnitId, Tensor>,
    pub forward_output: Tensor,
    /// Consumer → gradient received from it.
    pub backward_inputs: HashMap<UnitId, Tensor>,
    /// Producer → gradient sent to it.
    pub backward_outputs: HashMap<UnitId, Tensor>,
}

impl UnitBase {
    /// Allocates the edge tensors of `meta`, checking it against its producers.
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        let id = meta.id().clone();
        let batch = meta.batch();

        if !meta.device().is_supported() {
            let device = meta.device();
            return Err(Error::UnsupportedDevice { unit: id, device });
        }
        if !meta.data_type().is_supported() {
            let data_type = meta.data_type();
            return Err(Error::UnsupportedType {
                unit: id,
                data_type,
            });
        }

        let empty = |name: &str, shape: &Shape| Error::EmptyShape {
            unit: id.clone(),
            name: name.to_owned(),
            shape: shape.clone(),
        };
        if meta.output_shape().is_degenerate() {
            return Err(empty("output", meta.output_shape()));
        }

        let mut inputs = HashMap::default();
        let mut forward_inputs = HashMap::default();
        for (name, input) in meta.inputs() {
            if input.shape.is_degenerate() {
                return Err(empty(name, &input.shape));
            }
            let producer = graph.meta(&input.producer)?;
            if producer.output_shape() != &input.shape {
                return Err(Error::ShapeMismatch {
                    unit: id,
                    name: name.clone(),
                    expected: input.shape.clone(),
                    got: producer.output_shape().clone(),
                });
            }
            if producer.batch() != batch {
                return Err(Error::BatchMismatch {
                    unit: id,
                    producer: input.producer.clone(),
                    expected: batch,
                    got: producer.batch(),
                });
            }
            if producer.device() != meta.device() {
                return Err(Error::DeviceMismatch {
                    unit: id,
                    producer: input.producer.clone(),
                    expected: meta.device(),
                    got: producer.device(),
                });
            }
            if producer.data_type() != meta.data_type() {
                return Err(Error::TypeMismatch {
                    unit: id,
                    producer: input.producer.clone(),
                    expected: meta.data_type(),
                    got: producer.data_type(),
                });
            }
            inputs.insert(name.clone(), input.producer.clone());
            let tensor = Tensor::zeros(input.shape.clone(), batch);
            forward_inputs.insert(input.producer.clone(), tensor);
        }

        let forward_output = Tensor::zeros(meta.output_shape().clone(), batch);

        let mut backward_outputs = HashMap::default();
        if graph.participates(&id) {
            for (_, producer) in meta.gradient_inputs() {
                let shape = graph.meta(producer)?.output_shape().clone();
                backward_outputs.insert(producer.clone(), Tensor::zeros(shape, batch));
            }
        }

        let mut backward_inputs = HashMap::default();
        for consumer in meta.output_ids() {
            let sends = graph.participates(consumer)
                && graph
                    .meta(consumer)?
                    .gradient_inputs()
                    .any(|(_, producer)| producer == &id);
            if sends {
                let tensor = Tensor::zeros(meta.output_shape().clone(), batch);
                backward_inputs.insert(consumer.clone(), tensor);
            }
        }

        Ok(Self {
            id,
            inputs,
            forward_inputs,
            forward_output,
            backward_inputs,
            backward_outputs,
        })
    }

    /// The copy of the producer feeding input `name`.
    pub fn input(&self, name: &str) -> Result<&Tensor> {
        self.inputs
            .get(name)
            .and_then(|producer| self.forward_inputs.get(producer))
            .ok_or_else(|| Error::MissingInput {
                unit: self.id.clone(),
                name: name.to_owned(),
            })
    }

    /// Number of forward passes this unit computed since the last reset.
    #[inline]
    pub fn forward_state(&self) -> u64 {
        self.forward_output.state()
    }

    /// Number of backward passes this unit computed since the last reset, or `None` if it
    /// never sends gradients.
    #[inline]
    pub fn backward_state(&self) -> Option<u64> {
        self.backward_outputs.values().map(Tensor::state).min()
    }

    pub fn is_forward_ready(&self, pass: u64) -> bool {
        self.forward_state() + 1 == pass
            && self.forward_inputs.values().all(|x| x.state() == pass)
    }

    pub fn is_backward_ready(&self, pass: u64) -> bool {
        let Some(state) = self.backward_state() else {
            return false;
        };
        let seeded = match self.id.base() {
            UnitBaseType::Loss => self.forward_state() >= pass,
            _ => !self.backward_inputs.is_empty(),
        };
        seeded
            && state + 1 == pass
            && self.backward_inputs.values().all(|x| x.state() == pass)
    }

    /// Element-wise mean of every gradient received, shaped like the forward output.
    pub fn average_gradient(&self) -> Vec<f32> {
        let inputs: Vec<_> = self.backward_inputs.values().map(Tensor::data).collect();
        let mut output = vec![0.0; self.forward_output.len()];
        crate::hal::average(&mut output, &inputs);
        output
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.forward_inputs
            .values()
            .chain(std::iter::once(&self.forward_output))
            .chain(self.backward_inputs.values())
            .chain(self.backward_outputs.values())
    }

    fn tensors_mut(&mut self) -> impl Iterator<Item = &mut Tensor> {
        self.forward_inputs
            .values_mut()
            .chain(std::iter::once(&mut self.forward_output))
            .chain(self.backward_inputs.values_mut())
            .chain(self.backward_outputs.values_mut())
    }

    pub fn reset_state(&mut self) {
        self.tensors_mut().for_each(Tensor::reset_state);
    }

    pub fn resize(&mut self, batch: usize) {
        self.tensors_mut().for_each(|tensor| tensor.resize(batch));
    }
}

/// Access to the [`UnitBase`] of a unit. Derive it with `#[derive(Unit)]`.
pub trait Unit {
    fn base(&self) -> &UnitBase;
    fn base_mut(&mut self) -> &mut UnitBase;
}

/// A runtime graph node.
pub trait ComputableUnit: Unit + Debug + Send {
    /// Computes the forward output from the forward inputs, bumping the output's state.
    fn forward(&mut self) -> Result<()>;

    /// Computes the gradients sent to producers from the gradients received, bumping every
    /// backward output's state, and updates the trainable parameters.
    fn backward(&mut self) -> Result<()>;

    #[inline]
    fn id(&self) -> &UnitId {
        &self.base().id
    }

    #[inline]
    fn is_forward_ready(&self, pass: u64) -> bool {
        self.base().is_forward_ready(pass)
    }

    #[inline]
    fn is_backward_ready(&self, pass: u64) -> bool {
        self.base().is_backward_ready(pass)
    }

    /// Reallocates every batch-dependent tensor.
    fn change_batch_size(&mut self, batch: usize) {
        self.base_mut().resize(batch)
    }

    /// Rewinds every tensor's state to the baseline.
    fn reset_state(&mut self) {
        self.base_mut().reset_state()
    }

    /// Trainable parameters by name.
    fn trainables(&self) -> Vec<(&str, &Tensor)> {
        vec![]
    }

    /// Batch-mean of the loss computed by the last forward pass, for loss units.
    fn loss(&self) -> Option<f32> {
        None
    }
}

/// Read-only view of the declared graph used while building units.
#[derive(Debug)]
pub struct Graph<'a> {
    metadata: &'a HashMap<UnitId, UnitMetaData>,
    participants: HashSet<UnitId>,
    optimizer: &'a (dyn Optimizer + 'static),
}

impl<'a> Graph<'a> {
    /// `order` must list every unit after its producers.
    pub fn new(
        metadata: &'a HashMap<UnitId, UnitMetaData>,
        order: &[UnitId],
        optimizer: &'a (dyn Optimizer + 'static),
    ) -> Self {
        let mut participants = HashSet::default();
        for id in order.iter().rev() {
            let Some(meta) = metadata.get(id) else {
                continue;
            };
            let participates = match id.base() {
                UnitBaseType::Loss => true,
                UnitBaseType::Hidden => meta.output_ids().iter().any(|consumer| {
                    participants.contains(consumer)
                        && metadata.get(consumer).is_some_and(|consumer| {
                            consumer.gradient_inputs().any(|(_, producer)| producer == id)
                        })
                }),
                UnitBaseType::Fetcher | UnitBaseType::Constant => false,
            };
            if participates {
                participants.insert(id.clone());
            }
        }
        Self {
            metadata,
            participants,
            optimizer,
        }
    }

    pub fn meta(&self, id: &UnitId) -> Result<&'a UnitMetaData> {
        self.metadata
            .get(id)
            .ok_or_else(|| Error::MissingUnit(id.clone()))
    }

    /// Returns `true` if the unit computes gradients during backward.
    #[inline]
    pub fn participates(&self, id: &UnitId) -> bool {
        self.participants.contains(id)
    }

    /// A fresh copy of the optimizer for one unit.
    #[inline]
    pub fn optimizer(&self) -> Box<dyn Optimizer> {
        dyn_clone::clone_box(self.optimizer)
    }
}

/// Builds the unit described by `meta`, dispatching on its base type, then its type name.
/// Fetchers take `loader`; other units ignore it.
pub fn build(
    meta: &UnitMetaData,
    graph: &Graph,
    loader: Option<SharedLoader>,
) -> Result<Box<dyn ComputableUnit>> {
    let r#type = &meta.id().r#type;
    let unsupported = || Error::UnsupportedUnit(r#type.clone());

    let unit: Box<dyn ComputableUnit> = match r#type.base {
        UnitBaseType::Fetcher => match &*r#type.name {
            source::FETCHER => {
                let loader = loader.ok_or_else(|| Error::MissingLoader(meta.id().clone()))?;
                Box::new(Fetcher::new(meta, graph, loader)?)
            }
            _ => return Err(unsupported()),
        },
        UnitBaseType::Constant => match &*r#type.name {
            source::CONSTANT => Box::new(Constant::new(meta, graph)?),
            _ => return Err(unsupported()),
        },
        UnitBaseType::Hidden => match &*r#type.name {
            dense::DENSE => Box::new(Dense::new(meta, graph)?),
            activation::RELU => Box::new(Relu::new(meta, graph)?),
            activation::SIGMOID => Box::new(Sigmoid::new(meta, graph)?),
            activation::SOFTMAX => Box::new(Softmax::new(meta, graph)?),
            _ => return Err(unsupported()),
        },
        UnitBaseType::Loss => match &*r#type.name {
            loss::MSE => Box::new(Mse::new(meta, graph)?),
            loss::CROSS_ENTROPY => Box::new(CrossEntropy::new(meta, graph)?),
            _ => return Err(unsupported()),
        },
    };
    Ok(unit)
}

/// Checks that `meta` declares exactly the inputs in `names`.
pub(crate) fn check_inputs(meta: &UnitMetaData, names: &[&str]) -> Result<()> {
    if meta.inputs().len() != names.len() {
        return Err(Error::Arity {
            unit: meta.id().clone(),
            expected: names.len(),
            got: meta.inputs().len(),
        });
    }
    for &name in names {
        if meta.input(name).is_none() {
            return Err(Error::MissingInput {
                unit: meta.id().clone(),
                name: name.to_owned(),
            });
        }
    }
    Ok(())
}

/// Checks that the input `name` has the same per-sample shape as the output.
pub(crate) fn check_same_shape(meta: &UnitMetaData, name: &str) -> Result<()> {
    let Some(input) = meta.input(name) else {
        return Err(Error::MissingInput {
            unit: meta.id().clone(),
            name: name.to_owned(),
        });
    };
    if &input.shape != meta.output_shape() {
        return Err(Error::ShapeMismatch {
            unit: meta.id().clone(),
            name: name.to_owned(),
            expected: meta.output_shape().clone(),
            got: input.shape.clone(),
        });
    }
    Ok(())
}
