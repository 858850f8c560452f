//! Pull-based data sources feeding `Fetcher` units.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

/// Yields one batch per call. A fetcher invokes it once per forward pass and expects exactly
/// `batch × sample size` values.
pub trait Loader: Debug + Send {
    fn next(&mut self) -> Vec<f32>;

    /// Called when the owning fetcher is resized.
    fn change_batch_size(&mut self, _batch: usize) {}
}

/// A loader shared between the manager that registered it and the fetcher pulling from it.
pub type SharedLoader = Arc<Mutex<dyn Loader>>;

/// Walks an in-memory dataset batch by batch, wrapping around at the end.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    data: Vec<f32>,
    sample: usize,
    batch: usize,
    cursor: usize,
}

impl BatchLoader {
    /// `data` holds whole samples of `sample` values each.
    pub fn new(data: impl Into<Vec<f32>>, sample: usize, batch: usize) -> Self {
        let data = data.into();
        debug_assert!(sample > 0 && data.len() % sample == 0);
        Self {
            data,
            sample,
            batch,
            cursor: 0,
        }
    }

    /// A loader that yields the same batch on every call.
    pub fn repeat(batch: impl Into<Vec<f32>>) -> Self {
        let data = batch.into();
        let sample = data.len().max(1);
        Self::new(data, sample, 1)
    }

    #[inline]
    pub fn samples(&self) -> usize {
        self.data.len() / self.sample
    }

    pub fn set_batch(&mut self, batch: usize) {
        self.batch = batch;
    }
}

impl Loader for BatchLoader {
    fn next(&mut self) -> Vec<f32> {
        let samples = self.samples();
        if samples == 0 {
            return vec![];
        }
        let mut output = Vec::with_capacity(self.batch * self.sample);
        for _ in 0..self.batch {
            let start = self.cursor * self.sample;
            output.extend_from_slice(&self.data[start..start + self.sample]);
            self.cursor = (self.cursor + 1) % samples;
        }
        output
    }

    fn change_batch_size(&mut self, batch: usize) {
        self.set_batch(batch);
    }
}
