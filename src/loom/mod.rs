//! The `loom` module provides the value objects every other part of the engine is woven from.
//!
//! ## Key Components
//! 1. **Shapes** (`Shape`): per-sample dimensions of a tensor; the batch dimension is kept apart.
//!
//! 2. **Versioned Tensors** (`Tensor`):
//!    - A dense `f32` buffer sized `batch × shape`.
//!    - An atomic `State` counter bumped once per completed write, used as a logical clock
//!      between the producer and the consumer of an edge.
//!
//! 3. **Descriptors**: numeric type (`DataType`) and placement (`Device`) of a unit's tensors.
//!
//! 4. **Platform Shims** (`platform`): task spawning on native (tokio) and wasm targets.

pub mod device;
pub mod num;
pub mod platform;
pub mod shape;
pub mod tensor;
