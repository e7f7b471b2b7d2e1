//! The dynamic-array bridge: owned-snapshot containers for every
//! list-shaped argument and return crossing the boundary.
//!
//! Construction copies (or, for `adopt`, takes over) a contiguous run of
//! elements; mutation never affects a previously cloned or copied
//! instance. One macro stamps the scalar families.

use crate::error::SkeinCode;
use crate::expr::SkeinVariable;
use crate::handle::{box_handle, destroy_handle, guard, guard_ptr};

macro_rules! vec_bridge {
    (
        $container:ident, $elem:ty, $default:expr,
        $new:ident, $new_fill:ident, $from_data:ident, $free:ident,
        $length:ident, $get:ident, $set:ident, $push:ident, $extend:ident,
        $reserve:ident, $resize:ident, $clear:ident, $clone_fn:ident,
        $data:ident
    ) => {
        /// Owned contiguous element snapshot crossing the boundary.
        pub struct $container {
            pub(crate) inner: Vec<$elem>,
        }

        /// Creates a zero-initialized array of `length` elements.
        #[no_mangle]
        pub extern "C" fn $new(length: usize) -> *mut $container {
            guard_ptr(|| {
                Some(box_handle($container {
                    inner: vec![$default; length],
                }))
            })
        }

        /// Creates an array of `length` copies of `value`.
        #[no_mangle]
        pub extern "C" fn $new_fill(length: usize, value: $elem) -> *mut $container {
            guard_ptr(|| {
                Some(box_handle($container {
                    inner: vec![value; length],
                }))
            })
        }

        /// Creates an array by copying `length` elements from `data`. The
        /// caller keeps ownership of `data`.
        ///
        /// # Safety
        /// `data` must point to at least `length` readable elements.
        #[no_mangle]
        pub unsafe extern "C" fn $from_data(data: *const $elem, length: usize) -> *mut $container {
            guard_ptr(|| {
                if data.is_null() && length > 0 {
                    return None;
                }
                let inner = if length == 0 {
                    Vec::new()
                } else {
                    unsafe { std::slice::from_raw_parts(data, length) }.to_vec()
                };
                Some(box_handle($container { inner }))
            })
        }

        /// Destroys the array. Null is a no-op.
        ///
        /// # Safety
        /// `self_` must be null or a live handle, destroyed at most once.
        #[no_mangle]
        pub unsafe extern "C" fn $free(self_: *mut $container) {
            unsafe { destroy_handle(self_) };
        }

        /// Number of elements, 0 for null.
        ///
        /// # Safety
        /// `self_` must be null or a live handle.
        #[no_mangle]
        pub unsafe extern "C" fn $length(self_: *const $container) -> usize {
            unsafe { self_.as_ref() }.map(|v| v.inner.len()).unwrap_or(0)
        }

        /// Reads one element into `out`.
        ///
        /// # Safety
        /// `self_` must be null or a live handle; `out` must be writable.
        #[no_mangle]
        pub unsafe extern "C" fn $get(
            self_: *const $container,
            index: usize,
            out: *mut $elem,
        ) -> SkeinCode {
            guard(|| {
                let Some(vec) = (unsafe { self_.as_ref() }) else {
                    return SkeinCode::InvalidPtr;
                };
                if out.is_null() {
                    return SkeinCode::InvalidPtr;
                }
                match vec.inner.get(index) {
                    Some(value) => {
                        unsafe { *out = *value };
                        SkeinCode::Ok
                    }
                    None => SkeinCode::InvalidArg,
                }
            })
        }

        /// Overwrites one element.
        ///
        /// # Safety
        /// `self_` must be null or a live handle, not used concurrently.
        #[no_mangle]
        pub unsafe extern "C" fn $set(
            self_: *mut $container,
            index: usize,
            value: $elem,
        ) -> SkeinCode {
            guard(|| {
                let Some(vec) = (unsafe { self_.as_mut() }) else {
                    return SkeinCode::InvalidPtr;
                };
                match vec.inner.get_mut(index) {
                    Some(slot) => {
                        *slot = value;
                        SkeinCode::Ok
                    }
                    None => SkeinCode::InvalidArg,
                }
            })
        }

        /// Appends one element.
        ///
        /// # Safety
        /// `self_` must be null or a live handle, not used concurrently.
        #[no_mangle]
        pub unsafe extern "C" fn $push(self_: *mut $container, value: $elem) -> SkeinCode {
            guard(|| {
                let Some(vec) = (unsafe { self_.as_mut() }) else {
                    return SkeinCode::InvalidPtr;
                };
                vec.inner.push(value);
                SkeinCode::Ok
            })
        }

        /// Appends every element of `other`; `other` is unchanged.
        ///
        /// # Safety
        /// Both handles must be null or live; they may alias.
        #[no_mangle]
        pub unsafe extern "C" fn $extend(
            self_: *mut $container,
            other: *const $container,
        ) -> SkeinCode {
            guard(|| {
                if self_.is_null() || other.is_null() {
                    return SkeinCode::InvalidPtr;
                }
                // Self-extend duplicates the contents.
                let extra = unsafe { &*other }.inner.clone();
                unsafe { &mut *self_ }.inner.extend(extra);
                SkeinCode::Ok
            })
        }

        /// Reserves capacity for at least `additional` more elements.
        ///
        /// # Safety
        /// `self_` must be null or a live handle, not used concurrently.
        #[no_mangle]
        pub unsafe extern "C" fn $reserve(self_: *mut $container, additional: usize) -> SkeinCode {
            guard(|| {
                let Some(vec) = (unsafe { self_.as_mut() }) else {
                    return SkeinCode::InvalidPtr;
                };
                vec.inner.reserve(additional);
                SkeinCode::Ok
            })
        }

        /// Resizes to `new_len` elements, zero-filling growth.
        ///
        /// # Safety
        /// `self_` must be null or a live handle, not used concurrently.
        #[no_mangle]
        pub unsafe extern "C" fn $resize(self_: *mut $container, new_len: usize) -> SkeinCode {
            guard(|| {
                let Some(vec) = (unsafe { self_.as_mut() }) else {
                    return SkeinCode::InvalidPtr;
                };
                vec.inner.resize(new_len, $default);
                SkeinCode::Ok
            })
        }

        /// Removes every element.
        ///
        /// # Safety
        /// `self_` must be null or a live handle, not used concurrently.
        #[no_mangle]
        pub unsafe extern "C" fn $clear(self_: *mut $container) -> SkeinCode {
            guard(|| {
                let Some(vec) = (unsafe { self_.as_mut() }) else {
                    return SkeinCode::InvalidPtr;
                };
                vec.inner.clear();
                SkeinCode::Ok
            })
        }

        /// Deep, independently owned copy.
        ///
        /// # Safety
        /// `self_` must be null or a live handle.
        #[no_mangle]
        pub unsafe extern "C" fn $clone_fn(self_: *const $container) -> *mut $container {
            guard_ptr(|| {
                let vec = unsafe { self_.as_ref() }?;
                Some(box_handle($container {
                    inner: vec.inner.clone(),
                }))
            })
        }

        /// Borrowed pointer to the contiguous storage (valid until the
        /// next mutation or destroy; never destroyed independently).
        ///
        /// # Safety
        /// `self_` must be null or a live handle.
        #[no_mangle]
        pub unsafe extern "C" fn $data(self_: *mut $container) -> *mut $elem {
            match unsafe { self_.as_mut() } {
                Some(vec) => vec.inner.as_mut_ptr(),
                None => std::ptr::null_mut(),
            }
        }
    };
}

vec_bridge!(
    SkeinVecU8, u8, 0u8,
    skein_vecu8_new, skein_vecu8_new_fill, skein_vecu8_from_data, skein_vecu8_free,
    skein_vecu8_length, skein_vecu8_get, skein_vecu8_set, skein_vecu8_push,
    skein_vecu8_extend, skein_vecu8_reserve, skein_vecu8_resize, skein_vecu8_clear,
    skein_vecu8_clone, skein_vecu8_data
);

vec_bridge!(
    SkeinVecI32, i32, 0i32,
    skein_veci32_new, skein_veci32_new_fill, skein_veci32_from_data, skein_veci32_free,
    skein_veci32_length, skein_veci32_get, skein_veci32_set, skein_veci32_push,
    skein_veci32_extend, skein_veci32_reserve, skein_veci32_resize, skein_veci32_clear,
    skein_veci32_clone, skein_veci32_data
);

vec_bridge!(
    SkeinVecF32, f32, 0.0f32,
    skein_vecf32_new, skein_vecf32_new_fill, skein_vecf32_from_data, skein_vecf32_free,
    skein_vecf32_length, skein_vecf32_get, skein_vecf32_set, skein_vecf32_push,
    skein_vecf32_extend, skein_vecf32_reserve, skein_vecf32_resize, skein_vecf32_clear,
    skein_vecf32_clone, skein_vecf32_data
);

/// Takes ownership of a byte buffer previously returned by this library as
/// a (pointer, length) pair — the explicitly named ownership-transfer
/// constructor; no copy happens. The pair must not be freed afterwards.
///
/// # Safety
/// `(data, length)` must be exactly a pair returned by this library (e.g.
/// `skein_var_save_bytes`) that has not been freed or adopted yet.
#[no_mangle]
pub unsafe extern "C" fn skein_vecu8_adopt(data: *mut u8, length: usize) -> *mut SkeinVecU8 {
    guard_ptr(|| {
        if data.is_null() {
            return None;
        }
        let boxed = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(data, length)) };
        Some(box_handle(SkeinVecU8 {
            inner: boxed.into_vec(),
        }))
    })
}

// ----------------------------------------------------------------------
// Variable arrays

/// Owned array of variable handles.
pub struct SkeinVecVar {
    pub(crate) inner: Vec<skein::Variable>,
}

impl SkeinVecVar {
    pub(crate) fn from_vars(vars: Vec<skein::Variable>) -> SkeinVecVar {
        SkeinVecVar { inner: vars }
    }
}

/// Creates an empty variable array.
#[no_mangle]
pub extern "C" fn skein_vecvar_new() -> *mut SkeinVecVar {
    guard_ptr(|| Some(box_handle(SkeinVecVar { inner: Vec::new() })))
}

/// Destroys the array and releases every held variable reference. Null is
/// a no-op.
///
/// # Safety
/// `self_` must be null or a live handle, destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_vecvar_free(self_: *mut SkeinVecVar) {
    unsafe { destroy_handle(self_) };
}

/// Number of elements, 0 for null.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_vecvar_length(self_: *const SkeinVecVar) -> usize {
    unsafe { self_.as_ref() }.map(|v| v.inner.len()).unwrap_or(0)
}

/// Returns an **owned** clone of the variable at `index` (destroy it with
/// `skein_var_free`), or null when out of range.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_vecvar_get(
    self_: *const SkeinVecVar,
    index: usize,
) -> *mut SkeinVariable {
    guard_ptr(|| {
        let vec = unsafe { self_.as_ref() }?;
        let var = vec.inner.get(index)?;
        Some(box_handle(SkeinVariable::new(var.clone())))
    })
}

/// Overwrites the element at `index` with a clone of `value`.
///
/// # Safety
/// Both handles must be live; `self_` must not be used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_vecvar_set(
    self_: *mut SkeinVecVar,
    index: usize,
    value: *const SkeinVariable,
) -> SkeinCode {
    guard(|| {
        let (Some(vec), Some(value)) = (unsafe { self_.as_mut() }, unsafe { value.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        match vec.inner.get_mut(index) {
            Some(slot) => {
                *slot = value.var().clone();
                SkeinCode::Ok
            }
            None => SkeinCode::InvalidArg,
        }
    })
}

/// Appends a clone of `value`.
///
/// # Safety
/// Both handles must be live; `self_` must not be used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_vecvar_push(
    self_: *mut SkeinVecVar,
    value: *const SkeinVariable,
) -> SkeinCode {
    guard(|| {
        let (Some(vec), Some(value)) = (unsafe { self_.as_mut() }, unsafe { value.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        vec.inner.push(value.var().clone());
        SkeinCode::Ok
    })
}

/// Deep copy: the new array holds its own references to the same
/// underlying variables.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_vecvar_clone(self_: *const SkeinVecVar) -> *mut SkeinVecVar {
    guard_ptr(|| {
        let vec = unsafe { self_.as_ref() }?;
        Some(box_handle(SkeinVecVar {
            inner: vec.inner.clone(),
        }))
    })
}
