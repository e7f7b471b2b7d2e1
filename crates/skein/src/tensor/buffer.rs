//! Host/device tensor buffers with an explicit map-state machine.
//!
//! A `RawTensor` owns either host memory (directly mappable) or a simulated
//! device allocation (reachable only through `copy_from_host` /
//! `copy_to_host`). Map and unmap must pair exactly; the state machine
//! rejects double-map and unmap-while-unmapped instead of silently
//! tolerating them.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::{DType, Shape, TensorData};
use crate::backend::{EngineError, EngineResult};

static DEVICE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Current mapping state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    MappedRead,
    MappedWrite,
}

/// Requested access mode for `map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

enum Storage {
    Host(Vec<u8>),
    /// Simulated device allocation: an opaque id plus backing bytes that are
    /// deliberately unreachable through `map`.
    Device { id: u64, bytes: Vec<u8> },
}

/// N-dimensional buffer with shape, dtype, stride, and residency metadata.
pub struct RawTensor {
    shape: Shape,
    dtype: DType,
    strides: SmallVec<[usize; 4]>,
    storage: Storage,
    map_state: MapState,
}

impl RawTensor {
    /// Allocates a zero-initialized host tensor.
    pub fn alloc_host(shape: Shape, dtype: DType) -> Self {
        let len = shape.num_elements() * dtype.size_in_bytes();
        let strides = SmallVec::from_vec(shape.default_strides());
        RawTensor {
            shape,
            dtype,
            strides,
            storage: Storage::Host(vec![0u8; len]),
            map_state: MapState::Unmapped,
        }
    }

    /// Allocates a zero-initialized device tensor.
    pub fn alloc_device(shape: Shape, dtype: DType) -> Self {
        let len = shape.num_elements() * dtype.size_in_bytes();
        let strides = SmallVec::from_vec(shape.default_strides());
        RawTensor {
            shape,
            dtype,
            strides,
            storage: Storage::Device {
                id: DEVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                bytes: vec![0u8; len],
            },
            map_state: MapState::Unmapped,
        }
    }

    /// Creates a host tensor by copying the caller-supplied bytes.
    pub fn from_host_data(shape: Shape, dtype: DType, data: &[u8]) -> EngineResult<Self> {
        let expected = shape.num_elements() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(EngineError::InvalidArgument(format!(
                "data length {} does not match shape {:?} ({} bytes expected)",
                data.len(),
                shape.dims(),
                expected
            )));
        }
        let strides = SmallVec::from_vec(shape.default_strides());
        Ok(RawTensor {
            shape,
            dtype,
            strides,
            storage: Storage::Host(data.to_vec()),
            map_state: MapState::Unmapped,
        })
    }

    /// Creates a host tensor around an immutable value snapshot.
    pub fn from_data(value: &TensorData) -> Self {
        let strides = SmallVec::from_vec(value.shape().default_strides());
        RawTensor {
            shape: value.shape().clone(),
            dtype: value.dtype(),
            strides,
            storage: Storage::Host(value.bytes().to_vec()),
            map_state: MapState::Unmapped,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn element_count(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }

    /// Returns true when the buffer lives in host memory.
    pub fn is_host(&self) -> bool {
        matches!(self.storage, Storage::Host(_))
    }

    /// Returns the opaque device allocation id, or 0 for host tensors.
    pub fn device_id(&self) -> u64 {
        match &self.storage {
            Storage::Host(_) => 0,
            Storage::Device { id, .. } => *id,
        }
    }

    pub fn map_state(&self) -> MapState {
        self.map_state
    }

    /// Stride of one axis, in elements.
    pub fn stride(&self, axis: usize) -> EngineResult<usize> {
        self.strides
            .get(axis)
            .copied()
            .ok_or_else(|| EngineError::InvalidArgument(format!("stride axis {axis} out of range")))
    }

    /// Overrides one stride entry. The buffer itself stays dense; the table
    /// is metadata consumed by callers that interpret the memory.
    pub fn set_stride(&mut self, axis: usize, stride: usize) -> EngineResult<()> {
        match self.strides.get_mut(axis) {
            Some(slot) => {
                *slot = stride;
                Ok(())
            }
            None => Err(EngineError::InvalidArgument(format!(
                "stride axis {axis} out of range"
            ))),
        }
    }

    /// Extent of one axis.
    pub fn length(&self, axis: usize) -> EngineResult<usize> {
        self.shape
            .dims()
            .get(axis)
            .copied()
            .ok_or_else(|| EngineError::InvalidArgument(format!("axis {axis} out of range")))
    }

    /// Batch extent for rank-4 tensors.
    pub fn batch(&self) -> usize {
        self.shape.dims().first().copied().unwrap_or(1)
    }

    /// Channel extent for rank-4 tensors.
    pub fn channel(&self) -> usize {
        self.shape.dims().get(1).copied().unwrap_or(1)
    }

    /// Height extent for rank-4 tensors.
    pub fn height(&self) -> usize {
        self.shape.dims().get(2).copied().unwrap_or(1)
    }

    /// Width extent for rank-4 tensors.
    pub fn width(&self) -> usize {
        self.shape.dims().get(3).copied().unwrap_or(1)
    }

    /// Replaces the dimension list, reallocating storage and recomputing the
    /// stride table. The buffer must be unmapped.
    pub fn resize_dims(&mut self, dims: Vec<usize>) -> EngineResult<()> {
        if self.map_state != MapState::Unmapped {
            return Err(EngineError::MapState("cannot resize a mapped tensor"));
        }
        self.shape.set_dims(dims);
        self.strides = SmallVec::from_vec(self.shape.default_strides());
        let len = self.byte_len();
        match &mut self.storage {
            Storage::Host(bytes) => bytes.resize(len, 0),
            Storage::Device { bytes, .. } => bytes.resize(len, 0),
        }
        Ok(())
    }

    /// Maps the buffer for the requested access. Mapping while already
    /// mapped is a usage error; device tensors cannot be mapped at all and
    /// must go through the copy entry points.
    pub fn map(&mut self, mode: MapMode) -> EngineResult<*mut u8> {
        if self.map_state != MapState::Unmapped {
            return Err(EngineError::MapState("tensor is already mapped"));
        }
        match &mut self.storage {
            Storage::Host(bytes) => {
                self.map_state = match mode {
                    MapMode::Read => MapState::MappedRead,
                    MapMode::Write => MapState::MappedWrite,
                };
                Ok(bytes.as_mut_ptr())
            }
            Storage::Device { .. } => Err(EngineError::Unsupported(
                "device tensors are not host-mappable; use copy_to_host".into(),
            )),
        }
    }

    /// Ends the current mapping. Unmapping while unmapped is a usage error.
    pub fn unmap(&mut self) -> EngineResult<()> {
        if self.map_state == MapState::Unmapped {
            log::warn!("unmap called on an unmapped tensor");
            return Err(EngineError::MapState("tensor is not mapped"));
        }
        self.map_state = MapState::Unmapped;
        Ok(())
    }

    /// Maps for reading with a guard that unmaps on every exit path.
    pub fn mapped_read(&mut self) -> EngineResult<MapGuard<'_>> {
        self.map(MapMode::Read)?;
        Ok(MapGuard { tensor: self })
    }

    /// Maps for writing with a guard that unmaps on every exit path.
    pub fn mapped_write(&mut self) -> EngineResult<MapGuard<'_>> {
        self.map(MapMode::Write)?;
        Ok(MapGuard { tensor: self })
    }

    /// Read access to host bytes without going through the map state
    /// machine. Internal sessions use this; the boundary always maps.
    pub(crate) fn host_bytes(&self) -> EngineResult<&[u8]> {
        match &self.storage {
            Storage::Host(bytes) => Ok(bytes),
            Storage::Device { .. } => Err(EngineError::Unsupported(
                "tensor does not live in host memory".into(),
            )),
        }
    }

    pub(crate) fn host_bytes_mut(&mut self) -> EngineResult<&mut [u8]> {
        match &mut self.storage {
            Storage::Host(bytes) => Ok(bytes),
            Storage::Device { .. } => Err(EngineError::Unsupported(
                "tensor does not live in host memory".into(),
            )),
        }
    }

    /// Copies a host tensor's contents into this tensor (host or device).
    pub fn copy_from_host(&mut self, host: &RawTensor) -> EngineResult<()> {
        let src = host.host_bytes()?;
        if src.len() != self.byte_len() {
            return Err(EngineError::ShapeMismatch(format!(
                "copy size mismatch: source {} bytes, destination {} bytes",
                src.len(),
                self.byte_len()
            )));
        }
        match &mut self.storage {
            Storage::Host(bytes) => bytes.copy_from_slice(src),
            Storage::Device { bytes, .. } => bytes.copy_from_slice(src),
        }
        Ok(())
    }

    /// Copies this tensor's contents (host or device) into a host tensor.
    pub fn copy_to_host(&self, host: &mut RawTensor) -> EngineResult<()> {
        let len = self.byte_len();
        let src: &[u8] = match &self.storage {
            Storage::Host(bytes) => bytes,
            Storage::Device { bytes, .. } => bytes,
        };
        let dst = host.host_bytes_mut()?;
        if dst.len() != len {
            return Err(EngineError::ShapeMismatch(format!(
                "copy size mismatch: source {} bytes, destination {} bytes",
                len,
                dst.len()
            )));
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Clones the tensor. A deep clone duplicates storage; a shallow clone
    /// of a device tensor shares the device allocation id (the bytes are
    /// still copied here because the simulated device has no aliasing).
    pub fn clone_tensor(&self, deep: bool) -> RawTensor {
        let storage = match &self.storage {
            Storage::Host(bytes) => Storage::Host(bytes.clone()),
            Storage::Device { id, bytes } => Storage::Device {
                id: if deep {
                    DEVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
                } else {
                    *id
                },
                bytes: bytes.clone(),
            },
        };
        RawTensor {
            shape: self.shape.clone(),
            dtype: self.dtype,
            strides: self.strides.clone(),
            storage,
            map_state: MapState::Unmapped,
        }
    }

    /// Snapshots the current contents as an immutable value.
    pub fn to_data(&self) -> TensorData {
        let bytes: &[u8] = match &self.storage {
            Storage::Host(bytes) => bytes,
            Storage::Device { bytes, .. } => bytes,
        };
        TensorData::new(
            self.dtype,
            self.shape.clone(),
            std::sync::Arc::from(bytes.to_vec().into_boxed_slice()),
        )
        .expect("tensor storage length always matches its shape")
    }

    /// Overwrites the contents from an immutable value of matching size.
    pub fn write_data(&mut self, value: &TensorData) -> EngineResult<()> {
        if value.byte_len() != self.byte_len() {
            return Err(EngineError::ShapeMismatch(format!(
                "value is {} bytes but tensor holds {}",
                value.byte_len(),
                self.byte_len()
            )));
        }
        match &mut self.storage {
            Storage::Host(bytes) => bytes.copy_from_slice(value.bytes()),
            Storage::Device { bytes, .. } => bytes.copy_from_slice(value.bytes()),
        }
        Ok(())
    }
}

/// Scoped mapping that guarantees `unmap` on every exit path.
pub struct MapGuard<'a> {
    tensor: &'a mut RawTensor,
}

impl MapGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        match &self.tensor.storage {
            Storage::Host(bytes) => bytes,
            Storage::Device { .. } => unreachable!("device tensors cannot be mapped"),
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.tensor.storage {
            Storage::Host(bytes) => bytes,
            Storage::Device { .. } => unreachable!("device tensors cannot be mapped"),
        }
    }
}

impl Drop for MapGuard<'_> {
    fn drop(&mut self) {
        self.tensor.map_state = MapState::Unmapped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_unmap_must_pair() {
        let mut t = RawTensor::alloc_host(Shape::new(vec![2, 2]), DType::F32);
        assert!(t.map(MapMode::Read).is_ok());
        assert!(matches!(
            t.map(MapMode::Write),
            Err(EngineError::MapState(_))
        ));
        assert!(t.unmap().is_ok());
        assert!(matches!(t.unmap(), Err(EngineError::MapState(_))));
    }

    #[test]
    fn device_tensors_refuse_map() {
        let mut t = RawTensor::alloc_device(Shape::new(vec![4]), DType::F32);
        assert!(matches!(
            t.map(MapMode::Read),
            Err(EngineError::Unsupported(_))
        ));
        assert_ne!(t.device_id(), 0);
    }

    #[test]
    fn guard_unmaps_on_drop() {
        let mut t = RawTensor::alloc_host(Shape::new(vec![4]), DType::F32);
        {
            let mut guard = t.mapped_write().unwrap();
            guard.bytes_mut()[0] = 7;
        }
        assert_eq!(t.map_state(), MapState::Unmapped);
        assert_eq!(t.host_bytes().unwrap()[0], 7);
    }

    #[test]
    fn device_round_trip_through_copies() {
        let host = RawTensor::from_host_data(
            Shape::new(vec![2]),
            DType::F32,
            &1.0f32.to_le_bytes().iter().chain(2.0f32.to_le_bytes().iter()).copied().collect::<Vec<_>>(),
        )
        .unwrap();
        let mut device = RawTensor::alloc_device(Shape::new(vec![2]), DType::F32);
        device.copy_from_host(&host).unwrap();
        let mut back = RawTensor::alloc_host(Shape::new(vec![2]), DType::F32);
        device.copy_to_host(&mut back).unwrap();
        assert_eq!(back.host_bytes().unwrap(), host.host_bytes().unwrap());
    }

    #[test]
    fn resize_recomputes_strides() {
        let mut t = RawTensor::alloc_host(Shape::new(vec![1, 3]), DType::F32);
        t.resize_dims(vec![4, 3]).unwrap();
        assert_eq!(t.byte_len(), 48);
        assert_eq!(t.stride(0).unwrap(), 3);
    }
}
