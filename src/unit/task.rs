use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use derive_more::Display;

use super::{ComputableUnit, UnitId};
use crate::{
    error::{Error, Result},
    loom::platform,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Pass {
    #[display("forward")]
    Forward,
    #[display("backward")]
    Backward,
}

/// A unit handed back by its task, along with the result of its computation.
pub type TaskOutput = (Box<dyn ComputableUnit>, Result<()>);

/// An in-flight computation of one unit.
///
/// The unit is moved into a blocking worker and comes back through a one-shot channel once its
/// output states are bumped. A panic inside the computation is caught and reported as
/// [`Error::TaskPanicked`], with the unit still handed back. The receiver can only deliver it
/// once.
#[derive(Debug)]
pub struct UnitTask {
    id: UnitId,
    pass: Pass,
    receiver: flume::Receiver<TaskOutput>,
}

impl UnitTask {
    pub fn spawn(mut unit: Box<dyn ComputableUnit>, pass: Pass) -> Self {
        let id = unit.id().clone();
        let (sender, receiver) = flume::bounded(1);
        platform::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| match pass {
                Pass::Forward => unit.forward(),
                Pass::Backward => unit.backward(),
            }));
            let result = result.unwrap_or_else(|payload| {
                let unit = unit.id().clone();
                let message = panic_message(payload.as_ref());
                Err(Error::TaskPanicked {
                    unit,
                    pass,
                    message,
                })
            });
            _ = sender.send((unit, result));
        });
        Self { id, pass, receiver }
    }

    #[inline]
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    #[inline]
    pub fn pass(&self) -> Pass {
        self.pass
    }

    /// Waits for the unit to finish and takes it back. Awaiting a task that already delivered
    /// its unit fails with [`Error::TaskConsumed`].
    pub async fn wait(&self) -> Result<TaskOutput> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| Error::TaskConsumed(self.id.clone()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    match payload.downcast_ref::<&str>() {
        Some(message) => message.to_string(),
        None => match payload.downcast_ref::<String>() {
            Some(message) => message.clone(),
            None => "unknown panic".into(),
        },
    }
}

impl dyn ComputableUnit {
    /// Moves the unit into a task computing its forward pass.
    pub fn async_forward(self: Box<Self>) -> UnitTask {
        UnitTask::spawn(self, Pass::Forward)
    }

    /// Moves the unit into a task computing its backward pass.
    pub fn async_backward(self: Box<Self>) -> UnitTask {
        UnitTask::spawn(self, Pass::Backward)
    }
}
