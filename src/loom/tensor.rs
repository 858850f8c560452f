use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::Display;
use thiserror::Error;

use super::shape::Shape;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor size error: expected {expected} values, got {got}")]
    Size { expected: usize, got: usize },
    #[error("tensor shape error: shape {0} mismatches {1}")]
    Shape(Shape, Shape),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId;

/// Version counter of a tensor.
///
/// The counter is bumped with release ordering only after a write into the buffer completes,
/// and read with acquire ordering, so whoever observes a bump also observes the data.
#[derive(Debug, Default)]
pub struct State(AtomicU64);

impl State {
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Release) + 1
    }

    #[inline]
    fn reset(&self) {
        self.0.store(0, Ordering::Release)
    }
}

/// Relation between the states of the two ends of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EdgeSync {
    /// Both ends carry the same version.
    Synchronized,
    /// The producer is exactly one version ahead: the edge is due for copy.
    Due,
    /// The producer is more than one version ahead, or behind. Never happens at rest.
    #[display("broken ({_0} → {_1})")]
    Broken(u64, u64),
}

impl EdgeSync {
    #[inline]
    pub fn of(producer: &Tensor, consumer: &Tensor) -> Self {
        let (p, c) = (producer.state(), consumer.state());
        match p {
            p if p == c => Self::Synchronized,
            p if p == c + 1 => Self::Due,
            p => Self::Broken(p, c),
        }
    }
}

/// A dense `f32` buffer of `batch × shape` values carrying a version [`State`].
#[derive(Debug)]
pub struct Tensor {
    id: uid::Id<TensorId>,
    shape: Shape,
    batch: usize,
    data: Vec<f32>,
    state: State,
}

impl Tensor {
    /// Create a tensor of zeros at state 0.
    #[inline]
    pub fn zeros(shape: impl Into<Shape>, batch: usize) -> Self {
        let shape = shape.into();
        let data = vec![0.0; batch * shape.size()];
        Self {
            id: uid::Id::new(),
            shape,
            batch,
            data,
            state: State::default(),
        }
    }

    /// Create a tensor from existing contents at state 0.
    pub fn from_data(
        shape: impl Into<Shape>,
        batch: usize,
        data: impl Into<Vec<f32>>,
    ) -> Result<Self, TensorError> {
        let shape = shape.into();
        let data = data.into();
        let expected = batch * shape.size();
        if data.len() != expected {
            let got = data.len();
            return Err(TensorError::Size { expected, got });
        }
        Ok(Self {
            id: uid::Id::new(),
            shape,
            batch,
            data,
            state: State::default(),
        })
    }

    #[inline]
    pub fn id(&self) -> uid::Id<TensorId> {
        self.id
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Number of values held, `batch × shape.size()`.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn state(&self) -> u64 {
        self.state.get()
    }

    /// Overwrite the whole buffer, then bump the state.
    pub fn write(&mut self, data: &[f32]) -> Result<u64, TensorError> {
        if data.len() != self.data.len() {
            let expected = self.data.len();
            let got = data.len();
            return Err(TensorError::Size { expected, got });
        }
        self.data.copy_from_slice(data);
        Ok(self.state.bump())
    }

    /// Let `f` fill the buffer in place, then bump the state.
    pub fn write_with<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut [f32]) -> R,
    {
        let output = f(&mut self.data);
        self.state.bump();
        output
    }

    /// Bump the state without touching the data, republishing the current contents.
    #[inline]
    pub fn commit(&mut self) -> u64 {
        self.state.bump()
    }

    /// Copy the contents of `source` and bump the state. This is the consumer side of an edge.
    pub fn copy_from(&mut self, source: &Tensor) -> Result<u64, TensorError> {
        if source.shape != self.shape {
            return Err(TensorError::Shape(source.shape.clone(), self.shape.clone()));
        }
        self.write(&source.data)
    }

    /// Rewind the version counter to the baseline.
    #[inline]
    pub fn reset_state(&mut self) {
        self.state.reset()
    }

    /// Reallocate a zeroed buffer for a new batch size. The state is left untouched.
    pub fn resize(&mut self, batch: usize) {
        self.batch = batch;
        self.data = vec![0.0; batch * self.shape.size()];
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{EdgeSync, Tensor, TensorError};

    #[test]
    fn test_write_bumps_state() -> Result<(), Box<dyn Error>> {
        let mut tensor = Tensor::zeros([3], 2);
        assert_eq!(tensor.len(), 6);
        assert_eq!(tensor.state(), 0);

        let state = tensor.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        assert_eq!(state, 1);
        assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        tensor.write_with(|data| data.iter_mut().for_each(|x| *x *= 2.0));
        assert_eq!(tensor.state(), 2);
        assert_eq!(tensor.data()[5], 12.0);

        tensor.commit();
        assert_eq!(tensor.state(), 3);

        tensor.reset_state();
        assert_eq!(tensor.state(), 0);
        assert_eq!(tensor.data()[0], 2.0);
        Ok(())
    }

    #[test]
    fn test_partial_write_rejected() {
        let mut tensor = Tensor::zeros([4], 1);
        let err = tensor.write(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, TensorError::Size { expected: 4, got: 2 }));
        assert_eq!(tensor.state(), 0);
    }

    #[test]
    fn test_edge_sync() -> Result<(), Box<dyn Error>> {
        let mut producer = Tensor::zeros([2], 1);
        let mut consumer = Tensor::zeros([2], 1);
        assert_eq!(EdgeSync::of(&producer, &consumer), EdgeSync::Synchronized);

        producer.write(&[0.5, -0.5])?;
        assert_eq!(EdgeSync::of(&producer, &consumer), EdgeSync::Due);

        consumer.copy_from(&producer)?;
        assert_eq!(EdgeSync::of(&producer, &consumer), EdgeSync::Synchronized);
        assert_eq!(consumer.data(), producer.data());

        producer.commit();
        producer.commit();
        assert_eq!(EdgeSync::of(&producer, &consumer), EdgeSync::Broken(3, 1));
        Ok(())
    }

    #[test]
    fn test_copy_shape_mismatch() {
        let producer = Tensor::zeros([2, 2], 1);
        let mut consumer = Tensor::zeros([4], 1);
        assert!(matches!(
            consumer.copy_from(&producer),
            Err(TensorError::Shape(..))
        ));
    }

    #[test]
    fn test_resize() {
        let mut tensor = Tensor::zeros([3], 1);
        tensor.commit();
        tensor.resize(4);
        assert_eq!(tensor.batch(), 4);
        assert_eq!(tensor.len(), 12);
        assert_eq!(tensor.state(), 1);
        assert!(tensor.data().iter().all(|&x| x == 0.0));
    }
}
