//! Graph ownership and pass scheduling.
//!
//! [`UnitManager`] holds the declared graph, builds it into runtime units, and drives forward
//! and backward passes. Passes are numbered from 1 since the last reset; a unit is ready for
//! pass `k` once it has computed `k - 1` passes and every input it reads carries version `k`.
//!
//! Two schedulers share that readiness rule:
//! - [`forward`](UnitManager::forward) and [`backward`](UnitManager::backward) sweep the graph
//!   until a fixed point, completing a whole pass per call;
//! - [`async_forward`](UnitManager::async_forward) and
//!   [`async_backward`](UnitManager::async_backward) dispatch one wave of ready units as
//!   concurrent tasks, advancing the pass by one depth level per call.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use instant::Instant;
use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use crate::{
    error::{Error, Result, TensorResultExt},
    loader::{Loader, SharedLoader},
    loom::tensor::{EdgeSync, Tensor},
    optim,
    unit::{self, ComputableUnit, Graph, Pass, UnitBaseType, UnitId, UnitMetaData, UnitTask},
};

type Units = HashMap<UnitId, Box<dyn ComputableUnit>>;

#[derive(Debug, Default)]
pub struct UnitManager {
    metadata: HashMap<UnitId, UnitMetaData>,
    /// Declaration order. Every unit comes after its producers.
    order: Vec<UnitId>,
    units: Units,
    loaders: HashMap<UnitId, SharedLoader>,
    compiled: bool,
    next_id: u64,
    forward_passes: u64,
    backward_passes: u64,
}

impl UnitManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id for a unit of type `name` under `base`, labelled `label`.
    pub fn next_id(
        &mut self,
        base: UnitBaseType,
        name: impl AsRef<str>,
        label: impl AsRef<str>,
    ) -> UnitId {
        let r#type = unit::UnitType::new(base, name);
        let id = UnitId::new(r#type, self.next_id, label);
        self.next_id += 1;
        id
    }

    /// Registers a unit. Its producers must already be registered, each consumed once.
    ///
    /// On error the graph is left untouched.
    pub fn append_unit(&mut self, meta: UnitMetaData) -> Result<()> {
        if self.compiled {
            return Err(Error::AlreadyCompiled);
        }
        let id = meta.id().clone();
        if self.metadata.contains_key(&id) {
            return Err(Error::DuplicateUnit(id));
        }

        let mut producers = HashSet::default();
        for producer in meta.producers() {
            if !self.metadata.contains_key(producer) {
                return Err(Error::MissingUnit(producer.clone()));
            }
            if !producers.insert(producer) {
                return Err(Error::DuplicateProducer {
                    unit: id,
                    producer: producer.clone(),
                });
            }
        }

        for producer in meta.producers() {
            if let Some(producer) = self.metadata.get_mut(producer) {
                producer.append_output_unit_id(id.clone());
            }
        }
        log::debug!("appended unit {id} of type {}", id.r#type);
        self.metadata.insert(id.clone(), meta);
        self.order.push(id);
        Ok(())
    }

    /// Registers the data source of a fetcher. Replaces any loader attached before.
    pub fn attach_loader(&mut self, id: &UnitId, loader: impl Loader + 'static) -> Result<()> {
        if self.compiled {
            return Err(Error::AlreadyCompiled);
        }
        if !self.metadata.contains_key(id) {
            return Err(Error::MissingUnit(id.clone()));
        }
        if id.base() != UnitBaseType::Fetcher {
            return Err(Error::UnsupportedUnit(id.r#type.clone()));
        }
        let loader: SharedLoader = Arc::new(Mutex::new(loader));
        self.loaders.insert(id.clone(), loader);
        Ok(())
    }

    /// Builds every declared unit, giving each trainable unit its own copy of the optimizer
    /// `optimizer` configured by `params`. Every state starts at the baseline afterwards.
    ///
    /// On error nothing is built and the graph can still be amended.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn compile(&mut self, optimizer: &str, params: &[f32]) -> Result<()> {
        if self.compiled {
            return Err(Error::AlreadyCompiled);
        }
        let now = Instant::now();
        let optimizer = optim::create(optimizer, params)?;
        let graph = Graph::new(&self.metadata, &self.order, optimizer.as_ref());

        let mut units = Units::default();
        for id in &self.order {
            let meta = graph.meta(id)?;
            let loader = self.loaders.get(id).cloned();
            let mut unit = unit::build(meta, &graph, loader)?;
            unit.reset_state();
            units.insert(id.clone(), unit);
        }

        let trainable = units
            .values()
            .filter(|unit| !unit.trainables().is_empty())
            .count();
        self.units = units;
        self.compiled = true;
        self.forward_passes = 0;
        self.backward_passes = 0;

        log::info!(
            "compiled {} units ({trainable} trainable) with {} in {:?}",
            self.units.len(),
            optimizer.name(),
            now.elapsed()
        );
        Ok(())
    }

    /// Runs a whole forward pass: sources first, then sweeps over every ready unit until none
    /// is left. Returns the number of sweeps after the sources, at most the depth of the graph.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn forward(&mut self) -> Result<usize> {
        self.check_compiled()?;
        let pass = self.forward_passes + 1;
        let now = Instant::now();

        for unit in self.units.values_mut() {
            if unit.id().base().is_source() && unit.is_forward_ready(pass) {
                unit.forward()?;
            }
        }
        self.propagate_all(Pass::Forward)?;

        let sweeps = self.sweep(Pass::Forward, pass)?;
        self.complete(Pass::Forward, pass)?;

        log::debug!("forward pass {pass}: {sweeps} sweeps in {:?}", now.elapsed());
        Ok(sweeps)
    }

    /// Runs a whole backward pass, starting from the loss units. Requires a forward pass that
    /// has not been differentiated yet.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn backward(&mut self) -> Result<usize> {
        self.check_compiled()?;
        let pass = self.next_backward_pass()?;
        let now = Instant::now();

        for unit in self.units.values_mut() {
            if unit.id().base() == UnitBaseType::Loss && unit.is_backward_ready(pass) {
                unit.backward()?;
            }
        }
        self.propagate_all(Pass::Backward)?;

        let sweeps = self.sweep(Pass::Backward, pass)?;
        self.complete(Pass::Backward, pass)?;

        log::debug!("backward pass {pass}: {sweeps} sweeps in {:?}", now.elapsed());
        Ok(sweeps)
    }

    /// Dispatches every unit ready for the current forward pass as a concurrent task, waits for
    /// all of them, then propagates their outputs. Passes beyond `cycle` are never started.
    ///
    /// Returns the number of units dispatched; zero once the graph reached `cycle`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub async fn async_forward(&mut self, cycle: u64) -> Result<usize> {
        self.check_compiled()?;
        let pass = self.forward_passes + 1;
        if pass > cycle {
            return Ok(0);
        }
        self.wave(Pass::Forward, pass).await
    }

    /// Dispatches every unit ready for the current backward pass as a concurrent task. Passes
    /// beyond `cycle` are never started.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub async fn async_backward(&mut self, cycle: u64) -> Result<usize> {
        self.check_compiled()?;
        let pass = self.backward_passes + 1;
        if pass > cycle {
            return Ok(0);
        }
        let pass = self.next_backward_pass()?;
        self.wave(Pass::Backward, pass).await
    }

    /// Rewinds every tensor to the baseline state. Data and parameters are kept.
    pub fn reset_state(&mut self) {
        self.units.values_mut().for_each(|unit| unit.reset_state());
        self.forward_passes = 0;
        self.backward_passes = 0;
    }

    /// Reallocates every batch-dependent tensor for `batch` samples and resets all states.
    /// Constants are refilled; other contents are zeroed.
    pub fn change_batch_size(&mut self, batch: usize) {
        self.metadata
            .values_mut()
            .for_each(|meta| meta.set_batch(batch));
        self.units
            .values_mut()
            .for_each(|unit| unit.change_batch_size(batch));
        self.reset_state();
        log::info!("changed batch size to {batch}");
    }

    /// Batch-mean loss of the last forward pass of loss unit `id`.
    pub fn loss(&self, id: &UnitId) -> Result<f32> {
        self.check_compiled()?;
        let unit = self
            .units
            .get(id)
            .ok_or_else(|| Error::MissingUnit(id.clone()))?;
        unit.loss().ok_or_else(|| Error::NotLoss(id.clone()))
    }

    /// Checks that both ends of every edge carry the same version.
    pub fn verify_edges(&self) -> Result<()> {
        let desynchronized = |producer: &UnitId, consumer: &UnitId, p: &Tensor, c: &Tensor| {
            Error::Desynchronized {
                producer: producer.clone(),
                consumer: consumer.clone(),
                producer_state: p.state(),
                consumer_state: c.state(),
            }
        };

        for (id, unit) in &self.units {
            let output = &unit.base().forward_output;
            let consumers = self.metadata.get(id).map(UnitMetaData::output_ids);
            for consumer in consumers.unwrap_or_default() {
                let input = self
                    .units
                    .get(consumer)
                    .and_then(|unit| unit.base().forward_inputs.get(id))
                    .filter(|input| EdgeSync::of(output, input) != EdgeSync::Synchronized);
                if let Some(input) = input {
                    return Err(desynchronized(id, consumer, output, input));
                }
            }

            for (producer, output) in &unit.base().backward_outputs {
                let input = self
                    .units
                    .get(producer)
                    .and_then(|unit| unit.base().backward_inputs.get(id))
                    .filter(|input| EdgeSync::of(output, input) != EdgeSync::Synchronized);
                if let Some(input) = input {
                    return Err(desynchronized(id, producer, output, input));
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Forward passes completed since the last reset.
    #[inline]
    pub fn forward_passes(&self) -> u64 {
        self.forward_passes
    }

    /// Backward passes completed since the last reset.
    #[inline]
    pub fn backward_passes(&self) -> u64 {
        self.backward_passes
    }

    /// Unit ids in declaration order.
    #[inline]
    pub fn order(&self) -> &[UnitId] {
        &self.order
    }

    pub fn metadata(&self, id: &UnitId) -> Option<&UnitMetaData> {
        self.metadata.get(id)
    }

    pub fn unit(&self, id: &UnitId) -> Option<&dyn ComputableUnit> {
        self.units.get(id).map(Box::as_ref)
    }

    pub fn unit_mut(&mut self, id: &UnitId) -> Option<&mut (dyn ComputableUnit + 'static)> {
        self.units.get_mut(id).map(Box::as_mut)
    }

    pub fn units(&self) -> impl Iterator<Item = &(dyn ComputableUnit + 'static)> {
        self.units.values().map(Box::as_ref)
    }

    #[inline]
    fn check_compiled(&self) -> Result<()> {
        match self.compiled {
            true => Ok(()),
            false => Err(Error::NotCompiled),
        }
    }

    fn next_backward_pass(&self) -> Result<u64> {
        let pass = self.backward_passes + 1;
        match pass <= self.forward_passes {
            true => Ok(pass),
            false => Err(Error::BackwardBeforeForward {
                forward: self.forward_passes,
                backward: pass,
            }),
        }
    }

    /// Computes every ready unit, propagates, and repeats until nothing is ready.
    fn sweep(&mut self, direction: Pass, pass: u64) -> Result<usize> {
        let mut sweeps = 0;
        loop {
            let mut computed = 0;
            for unit in self.units.values_mut() {
                match direction {
                    Pass::Forward if unit.is_forward_ready(pass) => unit.forward()?,
                    Pass::Backward if unit.is_backward_ready(pass) => unit.backward()?,
                    _ => continue,
                }
                log::trace!("[{}] {direction} pass {pass}", unit.id());
                computed += 1;
            }
            if computed == 0 {
                break Ok(sweeps);
            }
            self.propagate_all(direction)?;
            sweeps += 1;
        }
    }

    /// Dispatches one wave of ready units as tasks and joins them.
    async fn wave(&mut self, direction: Pass, pass: u64) -> Result<usize> {
        let now = Instant::now();
        let ready = self
            .order
            .iter()
            .filter(|id| {
                self.units.get(*id).is_some_and(|unit| match direction {
                    Pass::Forward => unit.is_forward_ready(pass),
                    Pass::Backward => unit.is_backward_ready(pass),
                })
            })
            .cloned()
            .collect_vec();

        if ready.is_empty() {
            if let Some(unit) = self.pending(direction, pass) {
                let unit = unit.clone();
                return Err(Error::Stalled { pass, unit });
            }
        }

        let tasks = ready
            .iter()
            .filter_map(|id| self.units.remove(id))
            .map(|unit| UnitTask::spawn(unit, direction))
            .collect_vec();
        let outputs = join_all(tasks.iter().map(UnitTask::wait)).await;

        // reinsert every unit and propagate the finished ones before failing
        let mut result = Ok(());
        let mut computed = Vec::with_capacity(ready.len());
        for output in outputs {
            match output {
                Ok((unit, Ok(()))) => {
                    computed.push(unit.id().clone());
                    self.units.insert(unit.id().clone(), unit);
                }
                Ok((unit, Err(err))) => {
                    log::warn!("[{}] {direction} pass {pass} failed: {err}", unit.id());
                    self.units.insert(unit.id().clone(), unit);
                    result = result.and(Err(err));
                }
                Err(err) => result = result.and(Err(err)),
            }
        }
        for id in &computed {
            propagate(&self.metadata, &mut self.units, id, direction)?;
        }
        result?;
        #[cfg(feature = "strict")]
        self.verify_edges()?;

        log::debug!(
            "{direction} pass {pass}: dispatched {} units in {:?}",
            ready.len(),
            now.elapsed()
        );
        if self.pending(direction, pass).is_none() {
            self.complete(direction, pass)?;
        }
        Ok(ready.len())
    }

    fn propagate_all(&mut self, direction: Pass) -> Result<usize> {
        let mut copied = 0;
        for id in &self.order {
            copied += propagate(&self.metadata, &mut self.units, id, direction)?;
        }
        Ok(copied)
    }

    /// The first unit that has not computed pass `pass` yet.
    fn pending(&self, direction: Pass, pass: u64) -> Option<&UnitId> {
        self.units
            .values()
            .find(|unit| match direction {
                Pass::Forward => unit.base().forward_state() != pass,
                Pass::Backward => unit.base().backward_state().is_some_and(|s| s != pass),
            })
            .map(|unit| unit.id())
    }

    fn complete(&mut self, direction: Pass, pass: u64) -> Result<()> {
        if let Some(unit) = self.pending(direction, pass) {
            let unit = unit.clone();
            return Err(Error::Stalled { pass, unit });
        }
        #[cfg(feature = "strict")]
        self.verify_edges()?;

        match direction {
            Pass::Forward => self.forward_passes = pass,
            Pass::Backward => self.backward_passes = pass,
        }
        Ok(())
    }
}

/// Copies the outputs of unit `id` across every edge leaving it in `direction` that is due.
/// Returns the number of copies.
fn propagate(
    metadata: &HashMap<UnitId, UnitMetaData>,
    units: &mut Units,
    id: &UnitId,
    direction: Pass,
) -> Result<usize> {
    let Some(unit) = units.remove(id) else {
        return Err(Error::MissingUnit(id.clone()));
    };
    let result = match direction {
        Pass::Forward => {
            let output = &unit.base().forward_output;
            let consumers = metadata.get(id).map(UnitMetaData::output_ids);
            consumers
                .unwrap_or_default()
                .iter()
                .map(|consumer| {
                    let input = units
                        .get_mut(consumer)
                        .and_then(|unit| unit.base_mut().forward_inputs.get_mut(id));
                    copy_edge(id, consumer, output, input)
                })
                .fold_ok(0, |acc, copied| acc + copied)
        }
        Pass::Backward => unit
            .base()
            .backward_outputs
            .iter()
            .map(|(producer, output)| {
                let input = units
                    .get_mut(producer)
                    .and_then(|unit| unit.base_mut().backward_inputs.get_mut(id));
                copy_edge(id, producer, output, input)
            })
            .fold_ok(0, |acc, copied| acc + copied),
    };
    units.insert(id.clone(), unit);
    result
}

/// Copies `output` into `input` if the edge is due.
fn copy_edge(
    from: &UnitId,
    to: &UnitId,
    output: &Tensor,
    input: Option<&mut Tensor>,
) -> Result<usize> {
    let Some(input) = input else {
        return Ok(0);
    };
    match EdgeSync::of(output, input) {
        EdgeSync::Synchronized => Ok(0),
        EdgeSync::Due => {
            input.copy_from(output).on_unit(to)?;
            log::trace!("{from} → {to}: version {}", input.state());
            Ok(1)
        }
        EdgeSync::Broken(p, c) => {
            log::warn!("edge {from} → {to} skipped: versions {p} and {c} are out of step");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::UnitManager;
    use crate::{
        error::ErrorKind,
        init::{Fill, Values, Xavier, Zeros},
        loader::{BatchLoader, Loader},
        loom::{device::Device, num::DataType},
        unit::{UnitBaseType, UnitId, UnitMetaData, source::VALUE},
    };

    macro_rules! assert_approx_eq {
        ($a:expr, $b:expr) => {
            assert!(($a - $b).abs() < 1e-5, "{} != {}", $a, $b);
        };
    }

    struct Chain {
        x: UnitId,
        label: UnitId,
        dense: UnitId,
        activation: UnitId,
        loss: UnitId,
    }

    /// `x[4] → Dense(4 → 3) → activation → MSE ← label[3]`.
    fn chain(
        manager: &mut UnitManager,
        activation: &str,
        batch: usize,
        input: Vec<f32>,
        label: Vec<f32>,
    ) -> Result<Chain, Box<dyn Error>> {
        let x = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "x");
        let label_id = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "label");
        let dense = manager.next_id(UnitBaseType::Hidden, "Dense", "dense");
        let activation_id = manager.next_id(UnitBaseType::Hidden, activation, "activation");
        let loss = manager.next_id(UnitBaseType::Loss, "MSE", "loss");

        manager.append_unit(UnitMetaData::new(x.clone(), batch).with_output([4]))?;
        manager.attach_loader(&x, BatchLoader::new(input, 4, batch))?;
        manager.append_unit(UnitMetaData::new(label_id.clone(), batch).with_output([3]))?;
        manager.attach_loader(&label_id, BatchLoader::new(label, 3, batch))?;
        manager.append_unit(
            UnitMetaData::new(dense.clone(), batch)
                .with_input("x", &x, [4])
                .with_output([3])
                .with_variable("weight.x", [4, 3], Xavier { seed: Some(42) })
                .with_variable("bias", [3], Zeros),
        )?;
        manager.append_unit(
            UnitMetaData::new(activation_id.clone(), batch)
                .with_input("input", &dense, [3])
                .with_output([3]),
        )?;
        manager.append_unit(
            UnitMetaData::new(loss.clone(), batch)
                .with_input("prediction", &activation_id, [3])
                .with_input("label", &label_id, [3])
                .with_output([1]),
        )?;

        Ok(Chain {
            x,
            label: label_id,
            dense,
            activation: activation_id,
            loss,
        })
    }

    fn relu_chain() -> Result<(UnitManager, Chain), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let chain = chain(
            &mut manager,
            "ReLU",
            1,
            vec![1.0, 1.0, 1.0, 1.0],
            vec![0.0, 0.0, 0.0],
        )?;
        manager.compile("sgd", &[0.1])?;
        Ok((manager, chain))
    }

    fn output(manager: &UnitManager, id: &UnitId) -> Result<Vec<f32>, Box<dyn Error>> {
        let unit = manager.unit(id).ok_or("missing unit")?;
        Ok(unit.base().forward_output.data().to_vec())
    }

    /// States of every gradient tensor sent, keyed by edge.
    fn backward_states(manager: &UnitManager) -> Vec<(UnitId, UnitId, u64)> {
        manager
            .units()
            .flat_map(|unit| {
                let id = unit.id().clone();
                unit.base()
                    .backward_outputs
                    .iter()
                    .map(move |(producer, tensor)| (id.clone(), producer.clone(), tensor.state()))
            })
            .collect()
    }

    #[test]
    fn test_forward_backward() -> Result<(), Box<dyn Error>> {
        let (mut manager, chain) = relu_chain()?;

        let sweeps = manager.forward()?;
        assert_eq!(sweeps, 3);
        assert_eq!(manager.forward_passes(), 1);

        let loss = manager.loss(&chain.loss)?;
        assert!(loss.is_finite());
        assert!(loss >= 0.0);

        // the label is zero, so the loss is the mean square of the activations
        let y = output(&manager, &chain.activation)?;
        let expected = y.iter().map(|y| y * y).sum::<f32>() / 3.0;
        assert_approx_eq!(loss, expected);

        let before = backward_states(&manager);
        assert_eq!(before.len(), 3);
        manager.backward()?;
        let after = backward_states(&manager);
        assert_eq!(after.len(), before.len());
        for (from, to, state) in before {
            let next = after
                .iter()
                .find(|(f, t, _)| f == &from && t == &to)
                .map(|(_, _, state)| *state);
            assert_eq!(next, Some(state + 1), "gradient {from} → {to}");
        }
        assert_eq!(manager.backward_passes(), 1);
        manager.verify_edges()?;
        Ok(())
    }

    #[test]
    fn test_backward_participation() -> Result<(), Box<dyn Error>> {
        let (manager, chain) = relu_chain()?;

        let x = manager.unit(&chain.x).ok_or("missing unit")?;
        assert!(x.base().backward_outputs.is_empty());
        assert!(x.base().backward_inputs.contains_key(&chain.dense));

        // the label never receives a gradient
        let label = manager.unit(&chain.label).ok_or("missing unit")?;
        assert!(label.base().backward_inputs.is_empty());
        assert!(!label.is_backward_ready(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_inputs_not_ready() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let a = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "a");
        let b = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "b");
        let dense = manager.next_id(UnitBaseType::Hidden, "Dense", "dense");
        manager.append_unit(UnitMetaData::new(a.clone(), 1).with_output([2]))?;
        manager.append_unit(UnitMetaData::new(b.clone(), 1).with_output([3]))?;
        manager.append_unit(
            UnitMetaData::new(dense.clone(), 1)
                .with_input("a", &a, [2])
                .with_input("b", &b, [3])
                .with_output([2])
                .with_variable("weight.a", [2, 2], Fill(1.0))
                .with_variable("weight.b", [3, 2], Fill(1.0))
                .with_variable("bias", [2], Zeros),
        )?;
        manager.attach_loader(&a, BatchLoader::repeat([1.0, 2.0]))?;
        manager.attach_loader(&b, BatchLoader::repeat([3.0, 4.0, 5.0]))?;
        manager.compile("sgd", &[0.1])?;

        let unit = manager.unit(&dense).ok_or("missing unit")?;
        assert!(!unit.is_forward_ready(1));

        assert_eq!(manager.async_forward(1).await?, 2);
        let unit = manager.unit(&dense).ok_or("missing unit")?;
        assert!(unit.is_forward_ready(1));

        // roll back the copy of `b` only
        let unit = manager.unit_mut(&dense).ok_or("missing unit")?;
        let inputs = &mut unit.base_mut().forward_inputs;
        inputs.get_mut(&b).ok_or("missing input")?.reset_state();
        assert_eq!(inputs.get(&a).map(|x| x.state()), Some(1));
        assert!(!unit.is_forward_ready(1));
        Ok(())
    }

    #[test]
    fn test_duplicate_unit() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let x = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "x");
        let y = manager.next_id(UnitBaseType::Hidden, "ReLU", "y");
        manager.append_unit(UnitMetaData::new(x.clone(), 1).with_output([2]))?;

        let meta = UnitMetaData::new(y.clone(), 1)
            .with_input("input", &x, [2])
            .with_output([2]);
        manager.append_unit(meta.clone())?;
        let err = manager.append_unit(meta).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        assert_eq!(manager.order(), &[x.clone(), y.clone()]);
        let consumers = manager.metadata(&x).map(|meta| meta.output_ids().to_vec());
        assert_eq!(consumers, Some(vec![y]));
        Ok(())
    }

    #[test]
    fn test_append_checks_producers() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let x = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "x");
        let y = manager.next_id(UnitBaseType::Hidden, "Dense", "y");

        // `x` is not registered yet
        let meta = UnitMetaData::new(y.clone(), 1)
            .with_input("a", &x, [2])
            .with_output([2]);
        let err = manager.append_unit(meta).unwrap_err();
        assert!(matches!(err, crate::Error::MissingUnit(ref id) if id == &x));

        manager.append_unit(UnitMetaData::new(x.clone(), 1).with_output([2]))?;
        let meta = UnitMetaData::new(y.clone(), 1)
            .with_input("a", &x, [2])
            .with_input("b", &x, [2])
            .with_output([2]);
        let err = manager.append_unit(meta).unwrap_err();
        assert!(matches!(err, crate::Error::DuplicateProducer { .. }));
        assert!(manager.metadata(&y).is_none());
        assert!(manager.metadata(&x).is_some_and(|meta| meta.output_ids().is_empty()));
        Ok(())
    }

    #[test]
    fn test_reset_is_idempotent() -> Result<(), Box<dyn Error>> {
        let (mut manager, chain) = relu_chain()?;

        manager.forward()?;
        let first = output(&manager, &chain.loss)?;
        let hidden = output(&manager, &chain.dense)?;

        manager.reset_state();
        assert_eq!(manager.forward_passes(), 0);
        assert!(manager.units().all(|unit| unit.base().forward_state() == 0));

        manager.forward()?;
        assert_eq!(output(&manager, &chain.loss)?, first);
        assert_eq!(output(&manager, &chain.dense)?, hidden);
        assert_eq!(manager.forward_passes(), 1);
        Ok(())
    }

    #[test]
    fn test_sweeps_bounded_by_depth() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let x = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "x");
        manager.append_unit(UnitMetaData::new(x.clone(), 1).with_output([2]))?;
        manager.attach_loader(&x, BatchLoader::repeat([0.5, -0.5]))?;

        // x → (Dense → Sigmoid) × 3
        let mut last = x;
        for index in 0..3 {
            let dense = manager.next_id(UnitBaseType::Hidden, "Dense", format!("dense.{index}"));
            let sigmoid = manager.next_id(UnitBaseType::Hidden, "Sigmoid", "sigmoid");
            manager.append_unit(
                UnitMetaData::new(dense.clone(), 1)
                    .with_input("x", &last, [2])
                    .with_output([2])
                    .with_variable("weight.x", [2, 2], Xavier { seed: Some(index) })
                    .with_variable("bias", [2], Zeros),
            )?;
            manager.append_unit(
                UnitMetaData::new(sigmoid.clone(), 1)
                    .with_input("input", &dense, [2])
                    .with_output([2]),
            )?;
            last = sigmoid;
        }
        manager.compile("sgd", &[0.1])?;

        assert_eq!(manager.forward()?, 6);
        assert_eq!(manager.forward()?, 6);
        assert_eq!(manager.forward_passes(), 2);

        // no loss: nothing to differentiate
        assert_eq!(manager.backward()?, 0);
        assert_eq!(manager.backward_passes(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_matches_sync() -> Result<(), Box<dyn Error>> {
        let input = vec![0.5, -1.0, 2.0, 0.25, 1.0, 1.0, -1.0, 0.0];
        let label = vec![0.1, 0.5, 0.9, 0.3, 0.3, 0.3];

        let mut sync = UnitManager::new();
        let ids = chain(&mut sync, "Sigmoid", 2, input.clone(), label.clone())?;
        sync.compile("sgd", &[0.5])?;

        let mut parallel = UnitManager::new();
        chain(&mut parallel, "Sigmoid", 2, input, label)?;
        parallel.compile("sgd", &[0.5])?;

        sync.forward()?;
        // sources, dense, sigmoid, loss
        for cycle in 1..=4 {
            assert!(parallel.async_forward(cycle).await? > 0);
        }
        assert_eq!(parallel.forward_passes(), 1);
        assert_eq!(parallel.async_forward(1).await?, 0);
        assert_eq!(sync.loss(&ids.loss)?, parallel.loss(&ids.loss)?);
        parallel.verify_edges()?;

        sync.backward()?;
        // loss, sigmoid, dense
        for cycle in 1..=3 {
            assert!(parallel.async_backward(cycle).await? > 0);
        }
        assert_eq!(parallel.backward_passes(), 1);

        let weights = |manager: &UnitManager| -> Result<Vec<Vec<f32>>, Box<dyn Error>> {
            let unit = manager.unit(&ids.dense).ok_or("missing unit")?;
            let trainables = unit.trainables();
            Ok(trainables.iter().map(|(_, t)| t.data().to_vec()).collect())
        };
        assert_eq!(weights(&sync)?, weights(&parallel)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_wave_advances_one_level() -> Result<(), Box<dyn Error>> {
        let (mut manager, chain) = relu_chain()?;

        // a single wave only runs the sources
        assert_eq!(manager.async_forward(1).await?, 2);
        assert_eq!(manager.forward_passes(), 0);
        let dense = manager.unit(&chain.dense).ok_or("missing unit")?;
        assert_eq!(dense.base().forward_state(), 0);
        assert!(dense.is_forward_ready(1));
        manager.verify_edges()?;
        Ok(())
    }

    #[test]
    fn test_training_reduces_loss() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let chain = chain(
            &mut manager,
            "Sigmoid",
            1,
            vec![1.0, 1.0, 1.0, 1.0],
            vec![0.2, 0.5, 0.8],
        )?;
        manager.compile("sgd", &[0.5])?;

        manager.forward()?;
        let initial = manager.loss(&chain.loss)?;
        for _ in 0..200 {
            manager.backward()?;
            manager.forward()?;
        }
        let trained = manager.loss(&chain.loss)?;
        assert!(trained < initial * 0.5, "{trained} >= {initial} / 2");
        Ok(())
    }

    #[test]
    fn test_change_batch_size() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let chain = chain(
            &mut manager,
            "ReLU",
            1,
            vec![1.0, 2.0, 3.0, 4.0],
            vec![0.0, 0.0, 0.0],
        )?;
        let c = manager.next_id(UnitBaseType::Constant, "Constant", "c");
        manager.append_unit(
            UnitMetaData::new(c.clone(), 1)
                .with_output([2])
                .with_variable(VALUE, [2], Fill(0.5)),
        )?;
        manager.compile("momentum", &[0.1, 0.9])?;
        manager.forward()?;

        manager.change_batch_size(3);
        assert_eq!(manager.forward_passes(), 0);
        assert_eq!(manager.metadata(&chain.x).map(|meta| meta.batch()), Some(3));
        assert_eq!(output(&manager, &c)?, vec![0.5; 6]);

        manager.forward()?;
        assert_eq!(output(&manager, &chain.x)?.len(), 12);
        assert_eq!(output(&manager, &chain.loss)?.len(), 3);
        assert_eq!(output(&manager, &c)?, vec![0.5; 6]);
        manager.backward()?;
        Ok(())
    }

    #[test]
    fn test_precondition_errors() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let chain = chain(
            &mut manager,
            "ReLU",
            1,
            vec![0.0; 4],
            vec![0.0; 3],
        )?;
        let err = manager.forward().unwrap_err();
        assert!(matches!(err, crate::Error::NotCompiled));

        manager.compile("sgd", &[0.1])?;
        let err = manager.backward().unwrap_err();
        assert!(matches!(err, crate::Error::BackwardBeforeForward { .. }));
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let err = manager.compile("sgd", &[0.1]).unwrap_err();
        assert!(matches!(err, crate::Error::AlreadyCompiled));

        let z = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "z");
        let err = manager.append_unit(UnitMetaData::new(z, 1)).unwrap_err();
        assert!(matches!(err, crate::Error::AlreadyCompiled));

        manager.forward()?;
        let err = manager.loss(&chain.dense).unwrap_err();
        assert!(matches!(err, crate::Error::NotLoss(_)));
        Ok(())
    }

    #[test]
    fn test_compile_errors() -> Result<(), Box<dyn Error>> {
        fn compile(f: impl FnOnce(UnitMetaData) -> UnitMetaData) -> crate::Error {
            let mut manager = UnitManager::new();
            let x = manager.next_id(UnitBaseType::Constant, "Constant", "x");
            let meta = UnitMetaData::new(x, 1)
                .with_output([2])
                .with_variable(VALUE, [2], Zeros);
            match manager.append_unit(f(meta)) {
                Ok(()) => match manager.compile("sgd", &[0.1]) {
                    Ok(()) => panic!("compile succeeded"),
                    Err(err) => err,
                },
                Err(err) => err,
            }
        }

        let err = compile(|meta| meta.with_device(Device::Cuda(0)));
        assert!(matches!(err, crate::Error::UnsupportedDevice { .. }));
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let err = compile(|meta| meta.with_data_type(DataType::F16));
        assert!(matches!(err, crate::Error::UnsupportedType { .. }));

        let err = compile(|meta| UnitMetaData::new(meta.id().clone(), 1).with_output([2]));
        assert!(matches!(err, crate::Error::MissingVariable { .. }));

        let mut manager = UnitManager::new();
        let x = manager.next_id(UnitBaseType::Hidden, "Convolution", "x");
        manager.append_unit(UnitMetaData::new(x, 1).with_output([2]))?;
        let err = manager.compile("sgd", &[0.1]).unwrap_err();
        assert!(matches!(err, crate::Error::UnsupportedUnit(_)));

        let err = manager.compile("adagrad", &[0.1]).unwrap_err();
        assert!(matches!(err, crate::Error::UnsupportedOptimizer(_)));
        Ok(())
    }

    #[test]
    fn test_loader_errors() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let x = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "x");
        manager.append_unit(UnitMetaData::new(x.clone(), 2).with_output([2]))?;

        let err = manager.compile("sgd", &[0.1]).unwrap_err();
        assert!(matches!(err, crate::Error::MissingLoader(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!manager.is_compiled());

        // one sample per batch instead of two
        manager.attach_loader(&x, BatchLoader::repeat([1.0, 2.0]))?;
        manager.compile("sgd", &[0.1])?;
        let err = manager.forward().unwrap_err();
        assert!(matches!(err, crate::Error::Loader { expected: 4, got: 2, .. }));
        Ok(())
    }

    #[test]
    fn test_batch_mismatch() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let x = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "x");
        let y = manager.next_id(UnitBaseType::Hidden, "ReLU", "y");
        manager.append_unit(UnitMetaData::new(x.clone(), 2).with_output([2]))?;
        manager.append_unit(
            UnitMetaData::new(y, 4)
                .with_input("input", &x, [2])
                .with_output([2]),
        )?;
        manager.attach_loader(&x, BatchLoader::repeat([0.0; 4]))?;
        let err = manager.compile("sgd", &[0.1]).unwrap_err();
        assert!(matches!(err, crate::Error::BatchMismatch { expected: 4, got: 2, .. }));
        Ok(())
    }

    /// Yields a bad batch for its first `failures` calls, then `data` on every call.
    #[derive(Debug)]
    struct Flaky {
        failures: usize,
        panics: bool,
        data: Vec<f32>,
    }

    impl Loader for Flaky {
        fn next(&mut self) -> Vec<f32> {
            if self.failures > 0 {
                self.failures -= 1;
                if self.panics {
                    panic!("loader failed");
                }
                return vec![0.0];
            }
            self.data.clone()
        }
    }

    /// Fetchers `a[2]` (through `loader`) and `b[3]` feeding one dense unit.
    fn fan_in(loader: Flaky) -> Result<(UnitManager, UnitId, UnitId, UnitId), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let a = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "a");
        let b = manager.next_id(UnitBaseType::Fetcher, "Fetcher", "b");
        let dense = manager.next_id(UnitBaseType::Hidden, "Dense", "dense");
        manager.append_unit(UnitMetaData::new(a.clone(), 1).with_output([2]))?;
        manager.append_unit(UnitMetaData::new(b.clone(), 1).with_output([3]))?;
        manager.append_unit(
            UnitMetaData::new(dense.clone(), 1)
                .with_input("a", &a, [2])
                .with_input("b", &b, [3])
                .with_output([2])
                .with_variable("weight.a", [2, 2], Fill(1.0))
                .with_variable("weight.b", [3, 2], Fill(1.0))
                .with_variable("bias", [2], Zeros),
        )?;
        manager.attach_loader(&a, loader)?;
        manager.attach_loader(&b, BatchLoader::repeat([3.0, 4.0, 5.0]))?;
        manager.compile("sgd", &[0.1])?;
        Ok((manager, a, b, dense))
    }

    #[tokio::test]
    async fn test_async_panic_keeps_unit() -> Result<(), Box<dyn Error>> {
        let (mut manager, a, _, dense) = fan_in(Flaky {
            failures: 1,
            panics: true,
            data: vec![1.0, 2.0],
        })?;

        let err = manager.async_forward(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert!(matches!(err, crate::Error::TaskPanicked { ref unit, .. } if unit == &a));
        assert_eq!(manager.units().count(), 3);
        assert!(manager.unit(&a).is_some());

        // the fetcher retries and the pass completes
        assert_eq!(manager.async_forward(1).await?, 1);
        assert_eq!(manager.async_forward(1).await?, 1);
        assert_eq!(manager.forward_passes(), 1);
        assert_eq!(output(&manager, &dense)?, vec![15.0, 15.0]);

        manager.forward()?;
        assert_eq!(manager.forward_passes(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_failure_propagates_finished_units() -> Result<(), Box<dyn Error>> {
        let (mut manager, a, b, dense) = fan_in(Flaky {
            failures: 1,
            panics: false,
            data: vec![1.0, 2.0],
        })?;

        let err = manager.async_forward(1).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Loader { ref unit, expected: 2, got: 1 } if unit == &a
        ));

        // `b` finished in the failed wave and already reached the dense unit
        let unit = manager.unit(&dense).ok_or("missing unit")?;
        assert_eq!(unit.base().forward_inputs.get(&b).map(|x| x.state()), Some(1));
        assert_eq!(unit.base().forward_inputs.get(&a).map(|x| x.state()), Some(0));

        assert_eq!(manager.async_forward(1).await?, 1);
        let unit = manager.unit(&dense).ok_or("missing unit")?;
        assert!(unit.is_forward_ready(1));
        assert_eq!(manager.async_forward(1).await?, 1);
        assert_eq!(manager.forward_passes(), 1);
        manager.verify_edges()?;
        Ok(())
    }

    #[test]
    fn test_backward_averages_fan_out() -> Result<(), Box<dyn Error>> {
        let mut manager = UnitManager::new();
        let x = manager.next_id(UnitBaseType::Constant, "Constant", "x");
        let zeros = manager.next_id(UnitBaseType::Constant, "Constant", "zeros");
        let target = manager.next_id(UnitBaseType::Constant, "Constant", "target");
        let dense = manager.next_id(UnitBaseType::Hidden, "Dense", "dense");
        let first = manager.next_id(UnitBaseType::Loss, "MSE", "first");
        let second = manager.next_id(UnitBaseType::Loss, "MSE", "second");
        let constant = |id: &UnitId, value: Vec<f32>| {
            UnitMetaData::new(id.clone(), 1)
                .with_output([2])
                .with_variable(VALUE, [2], Values(value))
        };
        manager.append_unit(constant(&x, vec![1.0, 1.0]))?;
        manager.append_unit(constant(&zeros, vec![0.0, 0.0]))?;
        manager.append_unit(constant(&target, vec![2.0, 4.0]))?;
        manager.append_unit(
            UnitMetaData::new(dense.clone(), 1)
                .with_input("x", &x, [2])
                .with_output([2])
                .with_variable("weight.x", [2, 2], Fill(0.5))
                .with_variable("bias", [2], Zeros),
        )?;
        for (loss, label) in [(&first, &zeros), (&second, &target)] {
            manager.append_unit(
                UnitMetaData::new(loss.clone(), 1)
                    .with_input("prediction", &dense, [2])
                    .with_input("label", label, [2])
                    .with_output([1]),
            )?;
        }
        manager.compile("sgd", &[0.1])?;

        // y = [1, 1]
        manager.forward()?;
        assert_approx_eq!(manager.loss(&first)?, 1.0);
        assert_approx_eq!(manager.loss(&second)?, 5.0);

        // gradients [1, 1] and [-1, -3] average to g = [0, -1]
        manager.backward()?;
        let unit = manager.unit(&dense).ok_or("missing unit")?;
        assert_eq!(unit.base().backward_inputs.len(), 2);

        // dx = g·Wᵀ
        let dx = unit.base().backward_outputs[&x].data();
        assert_approx_eq!(dx[0], -0.5);
        assert_approx_eq!(dx[1], -0.5);

        // dW = xᵀ·g, db = g
        let trainables = unit.trainables();
        let expected = [0.5, 0.6, 0.5, 0.6];
        for (w, e) in trainables[0].1.data().iter().zip(expected) {
            assert_approx_eq!(w, e);
        }
        let bias = trainables[1].1.data();
        assert_approx_eq!(bias[0], 0.0);
        assert_approx_eq!(bias[1], 0.1);
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_edge_stalls() -> Result<(), Box<dyn Error>> {
        let (mut manager, chain) = relu_chain()?;
        manager.forward()?;
        manager.verify_edges()?;

        // the dense output runs two versions ahead of its consumer
        let unit = manager.unit_mut(&chain.dense).ok_or("missing unit")?;
        unit.base_mut().forward_output.commit();
        unit.base_mut().forward_output.commit();

        let err = manager.verify_edges().unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Desynchronized {
                ref producer,
                ref consumer,
                producer_state: 3,
                consumer_state: 1,
            } if producer == &chain.dense && consumer == &chain.activation
        ));

        let err = manager.forward().unwrap_err();
        assert!(matches!(err, crate::Error::Stalled { pass: 2, .. }));
        assert_eq!(manager.forward_passes(), 1);
        let activation = manager.unit(&chain.activation).ok_or("missing unit")?;
        assert_eq!(activation.base().forward_inputs[&chain.dense].state(), 1);

        // the sources already ran pass 2, so a wave finds nothing to dispatch
        let err = manager.async_forward(2).await.unwrap_err();
        assert!(matches!(err, crate::Error::Stalled { pass: 2, .. }));
        Ok(())
    }
}
