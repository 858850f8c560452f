//! A dataflow training engine for small neural networks.
//!
//! A network is declared as a graph of units with [`UnitMetaData`], registered in a
//! [`UnitManager`] and compiled into runtime units. Units never call one another: each edge
//! is a pair of versioned [`Tensor`](loom::tensor::Tensor)s, and the manager copies the
//! producer's end into the consumer's end whenever the producer is exactly one version ahead.
//!
//! ```no_run
//! use weft::{
//!     UnitManager,
//!     init::{Xavier, Zeros},
//!     loader::BatchLoader,
//!     unit::{UnitBaseType, UnitMetaData},
//! };
//!
//! # fn main() -> weft::Result<()> {
//! let mut manager = UnitManager::new();
//! let x = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "x");
//! let y = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "y");
//! let dense = manager.next_id(UnitBaseType::Hidden, "Dense", "dense");
//! let loss = manager.next_id(UnitBaseType::Loss, "MSE", "loss");
//!
//! manager.append_unit(UnitMetaData::new(x.clone(), 1).with_output([2]))?;
//! manager.append_unit(UnitMetaData::new(y.clone(), 1).with_output([1]))?;
//! manager.append_unit(
//!     UnitMetaData::new(dense.clone(), 1)
//!         .with_input("x", &x, [2])
//!         .with_output([1])
//!         .with_variable("weight.x", [2, 1], Xavier::default())
//!         .with_variable("bias", [1], Zeros),
//! )?;
//! manager.append_unit(
//!     UnitMetaData::new(loss.clone(), 1)
//!         .with_input("prediction", &dense, [1])
//!         .with_input("label", &y, [1])
//!         .with_output([1]),
//! )?;
//! manager.attach_loader(&x, BatchLoader::repeat([1.0, 2.0]))?;
//! manager.attach_loader(&y, BatchLoader::repeat([3.0]))?;
//!
//! manager.compile("sgd", &[0.05])?;
//! for _ in 0..100 {
//!     manager.forward()?;
//!     manager.backward()?;
//! }
//! println!("loss: {}", manager.loss(&loss)?);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod hal;
pub mod init;
pub mod loader;
pub mod loom;
pub mod manager;
pub mod optim;
pub mod unit;

pub use error::{Error, ErrorKind, Result};
pub use manager::UnitManager;
pub use unit::{ComputableUnit, UnitId, UnitMetaData, UnitType};
pub use weft_derive::Unit;
