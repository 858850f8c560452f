use std::sync::{Arc, PoisonError};

use weft_derive::Unit;

use super::{ComputableUnit, Graph, UnitBase, UnitMetaData, check_inputs};
use crate::{
    error::{Error, Result, TensorResultExt},
    init::Initializer,
    loader::SharedLoader,
};

pub const FETCHER: &str = "Fetcher";
pub const CONSTANT: &str = "Constant";

/// Name of the variable holding a constant's value.
pub const VALUE: &str = "value";

/// Source unit pulling one batch from its loader on every forward pass.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct Fetcher {
    #[unit]
    base: UnitBase,
    loader: SharedLoader,
}

impl Fetcher {
    pub fn new(meta: &UnitMetaData, graph: &Graph, loader: SharedLoader) -> Result<Self> {
        check_inputs(meta, &[])?;
        let base = UnitBase::new(meta, graph)?;
        Ok(Self { base, loader })
    }
}

impl ComputableUnit for Fetcher {
    fn forward(&mut self) -> Result<()> {
        let data = self
            .loader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next();
        let output = &mut self.base.forward_output;
        if data.len() != output.len() {
            return Err(Error::Loader {
                unit: self.base.id.clone(),
                expected: output.len(),
                got: data.len(),
            });
        }
        output.write(&data).on_unit(&self.base.id)?;
        log::trace!("[{}] fetched {} values", self.base.id, data.len());
        Ok(())
    }

    fn backward(&mut self) -> Result<()> {
        Ok(())
    }

    fn change_batch_size(&mut self, batch: usize) {
        self.base.resize(batch);
        self.loader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .change_batch_size(batch);
    }
}

/// Source unit republishing a fixed value on every forward pass.
#[derive(Debug, Unit)]
#[unit(crate = "crate")]
pub struct Constant {
    #[unit]
    base: UnitBase,
    initializer: Arc<dyn Initializer>,
}

impl Constant {
    pub fn new(meta: &UnitMetaData, graph: &Graph) -> Result<Self> {
        check_inputs(meta, &[])?;
        let Some(variable) = meta.variable(VALUE) else {
            return Err(Error::MissingVariable {
                unit: meta.id().clone(),
                name: VALUE.into(),
            });
        };
        let mut base = UnitBase::new(meta, graph)?;
        let initializer = variable.initializer.clone();
        initializer.initialize(&mut base.forward_output);
        Ok(Self { base, initializer })
    }
}

impl ComputableUnit for Constant {
    fn forward(&mut self) -> Result<()> {
        self.base.forward_output.commit();
        Ok(())
    }

    fn backward(&mut self) -> Result<()> {
        Ok(())
    }

    fn change_batch_size(&mut self, batch: usize) {
        self.base.resize(batch);
        self.initializer.initialize(&mut self.base.forward_output);
    }
}
