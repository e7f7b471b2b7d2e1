//! Immutable tensor value snapshots shared between the graph cache and
//! backends.

use std::mem::size_of;
use std::sync::Arc;

use super::{DType, Shape};
use crate::backend::{EngineError, EngineResult};

/// Dense, immutable tensor payload. Cloning shares the byte buffer, which
/// lets memoized graph results move between nodes and sessions without
/// copying.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    dtype: DType,
    shape: Shape,
    bytes: Arc<[u8]>,
}

impl TensorData {
    /// Wraps raw bytes, validating the length against shape and dtype.
    pub fn new(dtype: DType, shape: Shape, bytes: Arc<[u8]>) -> EngineResult<Self> {
        let expected = shape.num_elements() * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(EngineError::InvalidArgument(format!(
                "payload length {} does not match shape {:?} ({} bytes expected)",
                bytes.len(),
                shape.dims(),
                expected
            )));
        }
        Ok(TensorData {
            dtype,
            shape,
            bytes,
        })
    }

    /// Constructs an `F32` value from raw scalars.
    pub fn from_f32(shape: Shape, data: Vec<f32>) -> EngineResult<Self> {
        if data.len() != shape.num_elements() {
            return Err(EngineError::InvalidArgument(format!(
                "value length {} does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        Ok(TensorData {
            dtype: DType::F32,
            shape,
            bytes: Arc::from(vec_into_bytes(data).into_boxed_slice()),
        })
    }

    /// Constructs an `I32` value from raw scalars.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> EngineResult<Self> {
        if data.len() != shape.num_elements() {
            return Err(EngineError::InvalidArgument(format!(
                "value length {} does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        Ok(TensorData {
            dtype: DType::I32,
            shape,
            bytes: Arc::from(vec_into_bytes(data).into_boxed_slice()),
        })
    }

    /// Returns a zero-filled value of the requested shape and dtype.
    pub fn zeros(dtype: DType, shape: Shape) -> Self {
        let len = shape.num_elements() * dtype.size_in_bytes();
        TensorData {
            dtype,
            shape,
            bytes: Arc::from(vec![0u8; len].into_boxed_slice()),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shares the underlying byte buffer.
    pub fn bytes_arc(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Borrows the payload as `f32` scalars.
    pub fn as_f32(&self) -> EngineResult<&[f32]> {
        if self.dtype != DType::F32 {
            return Err(EngineError::Unsupported(format!(
                "expected f32 payload, found {:?}",
                self.dtype
            )));
        }
        Ok(bytes_as_slice::<f32>(&self.bytes))
    }

    /// Borrows the payload as `i32` scalars.
    pub fn as_i32(&self) -> EngineResult<&[i32]> {
        if self.dtype != DType::I32 {
            return Err(EngineError::Unsupported(format!(
                "expected i32 payload, found {:?}",
                self.dtype
            )));
        }
        Ok(bytes_as_slice::<i32>(&self.bytes))
    }

    /// Returns a value with the same payload but a different shape of equal
    /// element count.
    pub fn with_shape(&self, shape: Shape) -> EngineResult<Self> {
        if shape.num_elements() != self.shape.num_elements() {
            return Err(EngineError::ShapeMismatch(format!(
                "cannot view {:?} as {:?}",
                self.shape.dims(),
                shape.dims()
            )));
        }
        Ok(TensorData {
            dtype: self.dtype,
            shape,
            bytes: Arc::clone(&self.bytes),
        })
    }
}

/// Converts an owned vector into a raw byte buffer without copying.
pub(crate) fn vec_into_bytes<T>(data: Vec<T>) -> Vec<u8> {
    let mut data = std::mem::ManuallyDrop::new(data);
    let ptr = data.as_mut_ptr() as *mut u8;
    let len = data.len() * size_of::<T>();
    let cap = data.capacity() * size_of::<T>();
    unsafe { Vec::from_raw_parts(ptr, len, cap) }
}

/// Views a byte slice as a typed slice, asserting that the layout matches.
pub(crate) fn bytes_as_slice<T>(bytes: &[u8]) -> &[T] {
    assert_eq!(
        bytes.len() % size_of::<T>(),
        0,
        "byte length {} is not a multiple of element size {}",
        bytes.len(),
        size_of::<T>()
    );
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, bytes.len() / size_of::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_payload() {
        let err = TensorData::from_f32(Shape::new(vec![2, 2]), vec![1.0, 2.0]);
        assert!(err.is_err());
    }

    #[test]
    fn shares_bytes_on_clone() {
        let value = TensorData::from_f32(Shape::new(vec![2]), vec![1.0, 2.0]).unwrap();
        let copy = value.clone();
        assert!(Arc::ptr_eq(&value.bytes, &copy.bytes));
        assert_eq!(copy.as_f32().unwrap(), &[1.0, 2.0]);
    }
}
