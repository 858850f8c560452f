use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;

/// Per-sample dimensions of a tensor. The batch dimension is never part of a shape.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl Shape {
    /// Number of elements of one sample.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Returns `true` if some dimension is zero, so that a sample holds no values.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.0.contains(&0)
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Number of rows and columns when the shape is viewed as a matrix, folding every leading
    /// dimension into the rows.
    #[inline]
    pub fn rows_cols(&self) -> (usize, usize) {
        match self.0.split_last() {
            Some((&cols, rows)) => (rows.iter().product(), cols),
            None => (1, 1),
        }
    }
}

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::Shape;

    #[test]
    fn test_shape_size() {
        let shape = Shape::from([2, 3, 4]);
        assert_eq!(shape.size(), 24);
        assert_eq!(shape.dim(), 3);
        assert_eq!(shape.rows_cols(), (6, 4));
        assert_eq!(shape.to_string(), "[2, 3, 4]");

        let scalar = Shape::default();
        assert_eq!(scalar.size(), 1);
        assert_eq!(scalar.rows_cols(), (1, 1));
        assert!(!scalar.is_degenerate());
        assert!(Shape::from([3, 0]).is_degenerate());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_shape_serde() -> Result<(), Box<dyn std::error::Error>> {
        let shape = Shape::from([4, 3]);
        let json = serde_json::to_string(&shape)?;
        assert_eq!(json, "[4,3]");
        let back: Shape = serde_json::from_str(&json)?;
        assert_eq!(back, shape);
        Ok(())
    }
}
