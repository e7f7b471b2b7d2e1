//! Tensor buffer entry points.
//!
//! Tensors returned by `skein_tensor_create_*` are owned handles with a
//! paired `skein_tensor_destroy`. Tensors obtained from a session are
//! **borrowed** (owned by the session) and must never be destroyed.

use std::os::raw::c_void;

use skein::tensor::{DType, MapMode, RawTensor, Shape};

use crate::error::SkeinCode;
use crate::handle::{box_handle, destroy_handle, guard, guard_ptr};

/// Map-access mode tags.
pub const SKEIN_MAP_WRITE: i32 = 0;
pub const SKEIN_MAP_READ: i32 = 1;

/// Boundary wrapper over a raw tensor. `repr(transparent)` so borrowed
/// session tensors can be handed out without re-boxing.
#[repr(transparent)]
pub struct SkeinTensor {
    pub(crate) inner: RawTensor,
}

fn dims_from_c(dims: *const i32, ndim: usize) -> Result<Vec<usize>, SkeinCode> {
    if dims.is_null() && ndim > 0 {
        return Err(SkeinCode::InvalidPtr);
    }
    let slice = if ndim == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(dims, ndim) }
    };
    slice
        .iter()
        .map(|d| usize::try_from(*d).map_err(|_| SkeinCode::InvalidArg))
        .collect()
}

/// Allocates a zero-initialized host tensor. Returns null on failure.
///
/// # Safety
/// `dims` must point to `ndim` readable elements.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_create_host(
    dims: *const i32,
    ndim: usize,
    dtype: u32,
) -> *mut SkeinTensor {
    guard_ptr(|| {
        let dims = dims_from_c(dims, ndim).ok()?;
        let dtype = DType::from_tag(dtype)?;
        Some(box_handle(SkeinTensor {
            inner: RawTensor::alloc_host(Shape::new(dims), dtype),
        }))
    })
}

/// Allocates a zero-initialized device tensor. Device tensors are not
/// host-mappable; move data with the copy entry points.
///
/// # Safety
/// `dims` must point to `ndim` readable elements.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_create_device(
    dims: *const i32,
    ndim: usize,
    dtype: u32,
) -> *mut SkeinTensor {
    guard_ptr(|| {
        let dims = dims_from_c(dims, ndim).ok()?;
        let dtype = DType::from_tag(dtype)?;
        Some(box_handle(SkeinTensor {
            inner: RawTensor::alloc_device(Shape::new(dims), dtype),
        }))
    })
}

/// Creates a host tensor by copying caller memory.
///
/// # Safety
/// `dims` must point to `ndim` elements; `data` must point to enough
/// readable bytes for the implied shape and dtype.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_create_with_data(
    dims: *const i32,
    ndim: usize,
    dtype: u32,
    data: *const c_void,
) -> *mut SkeinTensor {
    guard_ptr(|| {
        let dims = dims_from_c(dims, ndim).ok()?;
        let dtype = DType::from_tag(dtype)?;
        if data.is_null() {
            return None;
        }
        let shape = Shape::new(dims);
        let len = shape.num_elements() * dtype.size_in_bytes();
        let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, len) };
        let tensor = RawTensor::from_host_data(shape, dtype, bytes).ok()?;
        Some(box_handle(SkeinTensor { inner: tensor }))
    })
}

/// Destroys an **owned** tensor handle. Never call on borrowed session
/// tensors. Null is a no-op.
///
/// # Safety
/// `self_` must be null or an owned live handle, destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_destroy(self_: *mut SkeinTensor) {
    unsafe { destroy_handle(self_) };
}

/// Clones a tensor; `deep` duplicates device allocations too.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_clone(self_: *const SkeinTensor, deep: bool) -> *mut SkeinTensor {
    guard_ptr(|| {
        let tensor = unsafe { self_.as_ref() }?;
        Some(box_handle(SkeinTensor {
            inner: tensor.inner.clone_tensor(deep),
        }))
    })
}

/// Copies data from a host tensor into this (host or device) tensor.
///
/// # Safety
/// Both handles must be live and not used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_copy_from_host(
    self_: *mut SkeinTensor,
    host: *const SkeinTensor,
) -> SkeinCode {
    guard(|| {
        let (Some(tensor), Some(host)) = (unsafe { self_.as_mut() }, unsafe { host.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        SkeinCode::from_result(tensor.inner.copy_from_host(&host.inner))
    })
}

/// Copies this (host or device) tensor's data into a host tensor.
///
/// # Safety
/// Both handles must be live and not used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_copy_to_host(
    self_: *const SkeinTensor,
    host: *mut SkeinTensor,
) -> SkeinCode {
    guard(|| {
        let (Some(tensor), Some(host)) = (unsafe { self_.as_ref() }, unsafe { host.as_mut() })
        else {
            return SkeinCode::InvalidPtr;
        };
        SkeinCode::from_result(tensor.inner.copy_to_host(&mut host.inner))
    })
}

/// Rank of the tensor; -1 for null.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_dimensions(self_: *const SkeinTensor) -> i32 {
    unsafe { self_.as_ref() }
        .map(|t| t.inner.rank() as i32)
        .unwrap_or(-1)
}

/// Writes up to `capacity` dimension extents into `out`.
///
/// # Safety
/// `self_` must be live; `out` must point to `capacity` writable elements.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_shape(
    self_: *const SkeinTensor,
    out: *mut i32,
    capacity: usize,
) -> SkeinCode {
    guard(|| {
        let Some(tensor) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        if out.is_null() {
            return SkeinCode::InvalidPtr;
        }
        let dims = tensor.inner.shape().dims();
        if capacity < dims.len() {
            return SkeinCode::InvalidArg;
        }
        let out = unsafe { std::slice::from_raw_parts_mut(out, dims.len()) };
        for (slot, dim) in out.iter_mut().zip(dims) {
            *slot = *dim as i32;
        }
        SkeinCode::Ok
    })
}

/// Total element count; 0 for null.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_element_count(self_: *const SkeinTensor) -> usize {
    unsafe { self_.as_ref() }
        .map(|t| t.inner.element_count())
        .unwrap_or(0)
}

/// Total byte length; 0 for null.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_byte_size(self_: *const SkeinTensor) -> usize {
    unsafe { self_.as_ref() }
        .map(|t| t.inner.byte_len())
        .unwrap_or(0)
}

/// Extent of one axis; -1 when out of range or null.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_length(self_: *const SkeinTensor, axis: i32) -> i32 {
    let Some(tensor) = (unsafe { self_.as_ref() }) else {
        return -1;
    };
    if axis < 0 {
        return -1;
    }
    tensor
        .inner
        .length(axis as usize)
        .map(|v| v as i32)
        .unwrap_or(-1)
}

/// Stride of one axis in elements; -1 when out of range or null.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_stride(self_: *const SkeinTensor, axis: i32) -> i32 {
    let Some(tensor) = (unsafe { self_.as_ref() }) else {
        return -1;
    };
    if axis < 0 {
        return -1;
    }
    tensor
        .inner
        .stride(axis as usize)
        .map(|v| v as i32)
        .unwrap_or(-1)
}

/// Overrides the stride metadata of one axis.
///
/// # Safety
/// `self_` must be null or a live handle, not used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_set_stride(
    self_: *mut SkeinTensor,
    axis: i32,
    stride: i32,
) -> SkeinCode {
    guard(|| {
        let Some(tensor) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        if axis < 0 || stride < 0 {
            return SkeinCode::InvalidArg;
        }
        SkeinCode::from_result(tensor.inner.set_stride(axis as usize, stride as usize))
    })
}

/// Batch extent (rank-4 convention).
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_batch(self_: *const SkeinTensor) -> i32 {
    unsafe { self_.as_ref() }.map(|t| t.inner.batch() as i32).unwrap_or(-1)
}

/// Channel extent (rank-4 convention).
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_channel(self_: *const SkeinTensor) -> i32 {
    unsafe { self_.as_ref() }.map(|t| t.inner.channel() as i32).unwrap_or(-1)
}

/// Height extent (rank-4 convention).
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_height(self_: *const SkeinTensor) -> i32 {
    unsafe { self_.as_ref() }.map(|t| t.inner.height() as i32).unwrap_or(-1)
}

/// Width extent (rank-4 convention).
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_width(self_: *const SkeinTensor) -> i32 {
    unsafe { self_.as_ref() }.map(|t| t.inner.width() as i32).unwrap_or(-1)
}

/// Element dtype tag; `u32::MAX` for null.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_dtype(self_: *const SkeinTensor) -> u32 {
    unsafe { self_.as_ref() }
        .map(|t| t.inner.dtype().tag())
        .unwrap_or(u32::MAX)
}

/// Opaque device allocation id; 0 for host tensors.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_device_id(self_: *const SkeinTensor) -> u64 {
    unsafe { self_.as_ref() }.map(|t| t.inner.device_id()).unwrap_or(0)
}

/// True when the tensor lives in host memory.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_is_host(self_: *const SkeinTensor) -> bool {
    unsafe { self_.as_ref() }.map(|t| t.inner.is_host()).unwrap_or(false)
}

/// Maps the tensor for host access, writing the pointer into `out`. The
/// mapping must be ended with `skein_tensor_unmap`; mapping while already
/// mapped is a usage error.
///
/// # Safety
/// `self_` must be live and not used concurrently; `out` must be
/// writable.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_map(
    self_: *mut SkeinTensor,
    mode: i32,
    out: *mut *mut c_void,
) -> SkeinCode {
    guard(|| {
        let Some(tensor) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        if out.is_null() {
            return SkeinCode::InvalidPtr;
        }
        let mode = match mode {
            SKEIN_MAP_WRITE => MapMode::Write,
            SKEIN_MAP_READ => MapMode::Read,
            _ => return SkeinCode::InvalidArg,
        };
        match tensor.inner.map(mode) {
            Ok(ptr) => {
                unsafe { *out = ptr as *mut c_void };
                SkeinCode::Ok
            }
            Err(err) => SkeinCode::from(&err),
        }
    })
}

/// Ends the current mapping; unmapping while unmapped is a usage error.
///
/// # Safety
/// `self_` must be live and not used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_unmap(self_: *mut SkeinTensor) -> SkeinCode {
    guard(|| {
        let Some(tensor) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        SkeinCode::from_result(tensor.inner.unmap())
    })
}

/// Replaces the dimension list, reallocating storage. The tensor must be
/// unmapped.
///
/// # Safety
/// `self_` must be live; `dims` must point to `ndim` elements.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_resize(
    self_: *mut SkeinTensor,
    dims: *const i32,
    ndim: usize,
) -> SkeinCode {
    guard(|| {
        let Some(tensor) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        let dims = match dims_from_c(dims, ndim) {
            Ok(dims) => dims,
            Err(code) => return code,
        };
        SkeinCode::from_result(tensor.inner.resize_dims(dims))
    })
}
