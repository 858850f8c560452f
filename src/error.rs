use derive_more::Display;
use thiserror::Error;

use crate::{
    loom::{device::Device, num::DataType, shape::Shape, tensor::TensorError},
    unit::{Pass, UnitId, UnitType},
};

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// The declared graph is inconsistent. Raised while declaring or compiling.
    Configuration,
    /// The graph asks for a unit type, optimizer, device or numeric type that has no backend.
    Unsupported,
    /// An operation was called out of order.
    Precondition,
    /// A unit failed while computing a pass.
    Runtime,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unit {0} is already registered")]
    DuplicateUnit(UnitId),
    #[error("unit {0} is not registered")]
    MissingUnit(UnitId),
    #[error("unit {unit} consumes producer {producer} more than once")]
    DuplicateProducer { unit: UnitId, producer: UnitId },
    #[error("unit {unit} has no input named `{name}`")]
    MissingInput { unit: UnitId, name: String },
    #[error("unit {unit} has no internal variable named `{name}`")]
    MissingVariable { unit: UnitId, name: String },
    #[error("fetcher {0} has no loader attached")]
    MissingLoader(UnitId),
    #[error("unit {unit} shape error: `{name}` is declared as {expected} but got {got}")]
    ShapeMismatch {
        unit: UnitId,
        name: String,
        expected: Shape,
        got: Shape,
    },
    #[error("unit {unit} declares `{name}` with shape {shape}, which holds no values")]
    EmptyShape {
        unit: UnitId,
        name: String,
        shape: Shape,
    },
    #[error("unit {unit} batch error: {producer} has batch size {got}, expected {expected}")]
    BatchMismatch {
        unit: UnitId,
        producer: UnitId,
        expected: usize,
        got: usize,
    },
    #[error("unit {unit} device error: {producer} is placed on {got}, expected {expected}")]
    DeviceMismatch {
        unit: UnitId,
        producer: UnitId,
        expected: Device,
        got: Device,
    },
    #[error("unit {unit} type error: {producer} holds {got}, expected {expected}")]
    TypeMismatch {
        unit: UnitId,
        producer: UnitId,
        expected: DataType,
        got: DataType,
    },
    #[error("unit {unit} expects {expected} inputs, got {got}")]
    Arity {
        unit: UnitId,
        expected: usize,
        got: usize,
    },
    #[error("optimizer `{optimizer}` expects {expected} parameters, got {got:?}")]
    InvalidParams {
        optimizer: String,
        expected: usize,
        got: Vec<f32>,
    },
    #[error("fetcher {unit} loader yielded {got} values, expected {expected}")]
    Loader {
        unit: UnitId,
        expected: usize,
        got: usize,
    },
    #[error("unit {unit} tensor error: {source}")]
    Tensor {
        unit: UnitId,
        #[source]
        source: TensorError,
    },

    #[error("unit type {0} is not supported")]
    UnsupportedUnit(UnitType),
    #[error("optimizer `{0}` is not supported")]
    UnsupportedOptimizer(String),
    #[error("unit {unit} is placed on unsupported device {device}")]
    UnsupportedDevice { unit: UnitId, device: Device },
    #[error("unit {unit} uses unsupported numeric type {data_type}")]
    UnsupportedType { unit: UnitId, data_type: DataType },

    #[error("the graph is not compiled")]
    NotCompiled,
    #[error("the graph is already compiled")]
    AlreadyCompiled,
    #[error("backward pass {backward} requested but only {forward} forward passes completed")]
    BackwardBeforeForward { forward: u64, backward: u64 },
    #[error("the task of unit {0} was already awaited or lost")]
    TaskConsumed(UnitId),
    #[error("unit {0} is not a loss unit")]
    NotLoss(UnitId),
    #[error("edge {producer} → {consumer} is out of sync: {producer_state} vs {consumer_state}")]
    Desynchronized {
        producer: UnitId,
        consumer: UnitId,
        producer_state: u64,
        consumer_state: u64,
    },
    #[error("unit {unit} panicked during its {pass} pass: {message}")]
    TaskPanicked {
        unit: UnitId,
        pass: Pass,
        message: String,
    },
    #[error("pass {pass} reached a fixed point with unit {unit} still pending")]
    Stalled { pass: u64, unit: UnitId },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateUnit(_)
            | Error::MissingUnit(_)
            | Error::DuplicateProducer { .. }
            | Error::MissingInput { .. }
            | Error::MissingVariable { .. }
            | Error::MissingLoader(_)
            | Error::ShapeMismatch { .. }
            | Error::EmptyShape { .. }
            | Error::BatchMismatch { .. }
            | Error::DeviceMismatch { .. }
            | Error::TypeMismatch { .. }
            | Error::Arity { .. }
            | Error::InvalidParams { .. }
            | Error::Tensor { .. } => ErrorKind::Configuration,
            Error::UnsupportedUnit(_)
            | Error::UnsupportedOptimizer(_)
            | Error::UnsupportedDevice { .. }
            | Error::UnsupportedType { .. } => ErrorKind::Unsupported,
            Error::NotCompiled
            | Error::AlreadyCompiled
            | Error::BackwardBeforeForward { .. }
            | Error::TaskConsumed(_)
            | Error::NotLoss(_)
            | Error::Desynchronized { .. }
            | Error::Stalled { .. } => ErrorKind::Precondition,
            Error::Loader { .. } | Error::TaskPanicked { .. } => ErrorKind::Runtime,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attaches the failing unit to a [`TensorError`].
pub(crate) trait TensorResultExt<T> {
    fn on_unit(self, unit: &UnitId) -> Result<T>;
}

impl<T> TensorResultExt<T> for Result<T, TensorError> {
    #[inline]
    fn on_unit(self, unit: &UnitId) -> Result<T> {
        self.map_err(|source| Error::Tensor {
            unit: unit.clone(),
            source,
        })
    }
}
