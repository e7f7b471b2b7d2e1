//! Lightweight wrapper for tensor shapes and stride bookkeeping.

use serde::{Deserialize, Serialize};

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions. A scalar is
    /// represented as the empty dimension list.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Replaces the dimension list in place.
    pub fn set_dims(&mut self, dims: Vec<usize>) {
        self.dims = dims;
    }

    /// Computes the row-major stride table (in elements) for this shape.
    pub fn default_strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        let shape = Shape::new(vec![1, 3, 2, 2]);
        assert_eq!(shape.default_strides(), vec![12, 4, 2, 1]);
        assert_eq!(shape.num_elements(), 12);
    }

    #[test]
    fn scalar_shape_has_one_element() {
        let shape = Shape::new(Vec::new());
        assert_eq!(shape.rank(), 0);
        assert_eq!(shape.num_elements(), 1);
        assert!(shape.default_strides().is_empty());
    }
}
