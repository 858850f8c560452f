use std::sync::Arc;

use rustc_hash::FxHashMap as HashMap;

use super::{UnitBaseType, UnitId, loss};
use crate::{
    init::Initializer,
    loom::{device::Device, num::DataType, shape::Shape},
};

/// A named input: the producer feeding it and the per-sample shape expected from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub producer: UnitId,
    pub shape: Shape,
}

/// A tensor private to a unit, allocated and filled at compile time.
#[derive(Debug, Clone)]
pub struct Variable {
    pub shape: Shape,
    pub initializer: Arc<dyn Initializer>,
}

/// Static declaration of a unit: what it consumes, what it produces, and where it runs.
///
/// Build one with [`UnitMetaData::new`] and the `with_*` methods, then hand it to
/// [`UnitManager::append_unit`](crate::manager::UnitManager::append_unit). Consumers are
/// recorded by the manager as later units declare this one as a producer.
#[derive(Debug, Clone)]
pub struct UnitMetaData {
    id: UnitId,
    batch: usize,
    device: Device,
    data_type: DataType,
    inputs: HashMap<String, Input>,
    output_shape: Shape,
    output_ids: Vec<UnitId>,
    variables: HashMap<String, Variable>,
}

impl UnitMetaData {
    pub fn new(id: UnitId, batch: usize) -> Self {
        Self {
            id,
            batch,
            device: Device::default(),
            data_type: DataType::default(),
            inputs: Default::default(),
            output_shape: Shape::default(),
            output_ids: vec![],
            variables: Default::default(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_input(
        mut self,
        name: impl Into<String>,
        producer: &UnitId,
        shape: impl Into<Shape>,
    ) -> Self {
        let producer = producer.clone();
        let shape = shape.into();
        self.inputs.insert(name.into(), Input { producer, shape });
        self
    }

    pub fn with_output(mut self, shape: impl Into<Shape>) -> Self {
        self.output_shape = shape.into();
        self
    }

    pub fn with_variable(
        mut self,
        name: impl Into<String>,
        shape: impl Into<Shape>,
        initializer: impl Initializer + 'static,
    ) -> Self {
        let shape = shape.into();
        let initializer = Arc::new(initializer);
        self.variables
            .insert(name.into(), Variable { shape, initializer });
        self
    }

    #[inline]
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[inline]
    pub fn inputs(&self) -> &HashMap<String, Input> {
        &self.inputs
    }

    #[inline]
    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.get(name)
    }

    #[inline]
    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    /// Consumers of this unit's output, in declaration order.
    #[inline]
    pub fn output_ids(&self) -> &[UnitId] {
        &self.output_ids
    }

    #[inline]
    pub fn variables(&self) -> &HashMap<String, Variable> {
        &self.variables
    }

    #[inline]
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Every producer, once per input name.
    pub fn producers(&self) -> impl Iterator<Item = &UnitId> {
        self.inputs.values().map(|input| &input.producer)
    }

    /// Inputs this unit sends a gradient back through. A loss unit never differentiates
    /// with respect to its label; sources have no inputs at all.
    pub fn gradient_inputs(&self) -> impl Iterator<Item = (&str, &UnitId)> {
        let base = self.id.base();
        self.inputs
            .iter()
            .filter(move |(name, _)| match base {
                UnitBaseType::Loss => name.as_str() == loss::PREDICTION,
                UnitBaseType::Hidden => true,
                UnitBaseType::Fetcher | UnitBaseType::Constant => false,
            })
            .map(|(name, input)| (name.as_str(), &input.producer))
    }

    pub(crate) fn set_batch(&mut self, batch: usize) {
        self.batch = batch;
    }

    pub(crate) fn append_output_unit_id(&mut self, id: UnitId) {
        self.output_ids.push(id);
    }
}
