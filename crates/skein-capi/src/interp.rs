//! Interpreter/session entry points.
//!
//! `skein_interpreter_get_session_input`/`_output` return **borrowed**
//! tensor handles owned by the session: never pass them to
//! `skein_tensor_destroy`, and do not use them after the session is
//! released.

use std::os::raw::{c_char, c_void};
use std::sync::{Arc, Mutex};

use skein::{Interpreter, Session};

use crate::error::SkeinCode;
use crate::executor::{schedule_from_c, SkeinScheduleConfig};
use crate::handle::{
    box_handle, destroy_handle, export_string_array, fire_callback, guard, guard_ptr,
    SkeinCallback,
};
use crate::tensor::SkeinTensor;

/// Boundary wrapper over an interpreter.
pub struct SkeinInterpreter {
    inner: Interpreter,
}

/// Boundary wrapper over a compiled session. Owned by its interpreter;
/// release through `skein_interpreter_release_session`.
pub struct SkeinSession {
    inner: Arc<Mutex<Session>>,
}

/// Deserializes a model from bytes; the callback fires exactly once after
/// the work completes, success or failure.
///
/// # Safety
/// `data` must point to `length` readable bytes; `callback`/`user` follow
/// the callback contract.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_create_from_buffer(
    data: *const u8,
    length: usize,
    callback: SkeinCallback,
    user: *mut c_void,
) -> *mut SkeinInterpreter {
    guard_ptr(|| {
        let result = (|| {
            if data.is_null() {
                return None;
            }
            let bytes = unsafe { std::slice::from_raw_parts(data, length) };
            let interpreter = Interpreter::from_buffer(bytes).ok()?;
            Some(box_handle(SkeinInterpreter { inner: interpreter }))
        })();
        fire_callback(callback, user);
        result
    })
}

/// Deserializes a model from a file.
///
/// # Safety
/// `path` must be a readable C string; `callback`/`user` follow the
/// callback contract.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_create_from_file(
    path: *const c_char,
    callback: SkeinCallback,
    user: *mut c_void,
) -> *mut SkeinInterpreter {
    guard_ptr(|| {
        let result = (|| {
            if path.is_null() {
                return None;
            }
            let path = unsafe { std::ffi::CStr::from_ptr(path) }.to_str().ok()?;
            let interpreter = Interpreter::from_file(path).ok()?;
            Some(box_handle(SkeinInterpreter { inner: interpreter }))
        })();
        fire_callback(callback, user);
        result
    })
}

/// Destroys an interpreter. Every session must have been released first;
/// a violation is logged and the sessions are abandoned. Null is a no-op.
///
/// # Safety
/// `self_` must be null or a live handle, destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_destroy(self_: *mut SkeinInterpreter) {
    if let Some(interpreter) = unsafe { self_.as_ref() } {
        let live = interpreter.inner.session_count();
        if live > 0 {
            log::warn!("interpreter destroyed with {live} unreleased sessions");
        }
    }
    unsafe { destroy_handle(self_) };
}

/// Drops the retained model graph; compiled sessions stay runnable.
///
/// # Safety
/// `self_` must be live and not used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_release_model(self_: *mut SkeinInterpreter) -> SkeinCode {
    guard(|| {
        let Some(interpreter) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        interpreter.inner.release_model();
        SkeinCode::Ok
    })
}

/// Compiles the model against a schedule configuration. Returns null when
/// the backend is unavailable or compilation fails (the sentinel the
/// lifecycle documents).
///
/// # Safety
/// `self_` must be live and not used concurrently; `config` must be null
/// or readable; `callback`/`user` follow the callback contract.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_create_session(
    self_: *mut SkeinInterpreter,
    config: *const SkeinScheduleConfig,
    callback: SkeinCallback,
    user: *mut c_void,
) -> *mut SkeinSession {
    guard_ptr(|| {
        let result = (|| {
            let interpreter = unsafe { self_.as_mut() }?;
            let schedule = schedule_from_c(config).ok()?;
            let session = interpreter.inner.create_session(&schedule)?;
            Some(box_handle(SkeinSession { inner: session }))
        })();
        fire_callback(callback, user);
        result
    })
}

/// Releases a session: removes it from the interpreter and destroys the
/// handle. Borrowed tensors obtained from it become invalid.
///
/// # Safety
/// Both handles must be live; `session` is consumed on success and must
/// not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_release_session(
    self_: *mut SkeinInterpreter,
    session: *mut SkeinSession,
    callback: SkeinCallback,
    user: *mut c_void,
) -> SkeinCode {
    guard(|| {
        let code = (|| {
            let (Some(interpreter), Some(session_ref)) =
                (unsafe { self_.as_mut() }, unsafe { session.as_ref() })
            else {
                return SkeinCode::InvalidPtr;
            };
            let result = interpreter.inner.release_session(&session_ref.inner);
            if result.is_ok() {
                unsafe { destroy_handle(session) };
            }
            SkeinCode::from_result(result)
        })();
        fire_callback(callback, user);
        code
    })
}

/// Re-infers every shape from the current input tensor dimensions. Must
/// be called whenever an input tensor's shape changed.
///
/// # Safety
/// Both handles must be live; `callback`/`user` follow the callback
/// contract.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_resize_session(
    self_: *const SkeinInterpreter,
    session: *const SkeinSession,
    callback: SkeinCallback,
    user: *mut c_void,
) -> SkeinCode {
    guard(|| {
        let code = (|| {
            let (Some(interpreter), Some(session)) =
                (unsafe { self_.as_ref() }, unsafe { session.as_ref() })
            else {
                return SkeinCode::InvalidPtr;
            };
            SkeinCode::from_result(interpreter.inner.resize_session(&session.inner))
        })();
        fire_callback(callback, user);
        code
    })
}

/// Runs the session to completion: one blocking call executing every op
/// in the compiled order, leaving output tensors populated.
///
/// # Safety
/// Both handles must be live; the session must not be used concurrently;
/// `callback`/`user` follow the callback contract.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_run_session(
    self_: *const SkeinInterpreter,
    session: *const SkeinSession,
    callback: SkeinCallback,
    user: *mut c_void,
) -> SkeinCode {
    guard(|| {
        let code = (|| {
            let (Some(interpreter), Some(session)) =
                (unsafe { self_.as_ref() }, unsafe { session.as_ref() })
            else {
                return SkeinCode::InvalidPtr;
            };
            SkeinCode::from_result(interpreter.inner.run_session(&session.inner))
        })();
        fire_callback(callback, user);
        code
    })
}

fn borrowed_tensor(tensor: Option<&mut skein::RawTensor>) -> *mut SkeinTensor {
    match tensor {
        // SkeinTensor is repr(transparent) over RawTensor, so a borrowed
        // pointer into the session is a valid tensor handle.
        Some(tensor) => tensor as *mut skein::RawTensor as *mut SkeinTensor,
        None => std::ptr::null_mut(),
    }
}

/// **Borrowed** handle to a named session input tensor (null name selects
/// the first). Owned by the session: never destroy it, never use it after
/// the session is released.
///
/// # Safety
/// Both handles must be live; `name` must be null or a readable C string.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_get_session_input(
    self_: *const SkeinInterpreter,
    session: *const SkeinSession,
    name: *const c_char,
) -> *mut SkeinTensor {
    guard_ptr(|| {
        let _ = unsafe { self_.as_ref() }?;
        let session = unsafe { session.as_ref() }?;
        let name = if name.is_null() {
            None
        } else {
            Some(unsafe { std::ffi::CStr::from_ptr(name) }.to_str().ok()?)
        };
        let mut guard = session.inner.lock().expect("session poisoned");
        let ptr = borrowed_tensor(guard.input(name));
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    })
}

/// **Borrowed** handle to a named session output tensor (null name
/// selects the first). Owned by the session.
///
/// # Safety
/// Both handles must be live; `name` must be null or a readable C string.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_get_session_output(
    self_: *const SkeinInterpreter,
    session: *const SkeinSession,
    name: *const c_char,
) -> *mut SkeinTensor {
    guard_ptr(|| {
        let _ = unsafe { self_.as_ref() }?;
        let session = unsafe { session.as_ref() }?;
        let name = if name.is_null() {
            None
        } else {
            Some(unsafe { std::ffi::CStr::from_ptr(name) }.to_str().ok()?)
        };
        let mut guard = session.inner.lock().expect("session poisoned");
        let ptr = borrowed_tensor(guard.output(name));
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    })
}

fn session_tensor_table(
    session: &SkeinSession,
    outputs: bool,
    out_tensors: *mut *mut *mut SkeinTensor,
    out_names: *mut *mut *mut c_char,
    out_count: *mut usize,
) -> SkeinCode {
    if out_tensors.is_null() || out_names.is_null() || out_count.is_null() {
        return SkeinCode::InvalidPtr;
    }
    let mut guard = session.inner.lock().expect("session poisoned");
    let entries = if outputs { guard.outputs() } else { guard.inputs() };
    let names: Vec<String> = entries.iter().map(|(name, _)| name.to_string()).collect();
    let tensors: Vec<*mut SkeinTensor> = entries
        .into_iter()
        .map(|(_, tensor)| tensor as *mut skein::RawTensor as *mut SkeinTensor)
        .collect();
    let count = tensors.len();
    let tensor_array = Box::into_raw(tensors.into_boxed_slice()) as *mut *mut SkeinTensor;
    let (name_array, _) = export_string_array(&names);
    unsafe {
        *out_tensors = tensor_array;
        *out_names = name_array;
        *out_count = count;
    }
    SkeinCode::Ok
}

/// Lists every session input as parallel arrays of **borrowed** tensor
/// handles and caller-owned names. Free the arrays with
/// `skein_tensor_array_free` / `skein_string_array_free`; never destroy
/// the tensors.
///
/// # Safety
/// Both handles must be live; the out parameters must be writable.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_get_session_input_all(
    self_: *const SkeinInterpreter,
    session: *const SkeinSession,
    out_tensors: *mut *mut *mut SkeinTensor,
    out_names: *mut *mut *mut c_char,
    out_count: *mut usize,
) -> SkeinCode {
    guard(|| {
        let (Some(_), Some(session)) = (unsafe { self_.as_ref() }, unsafe { session.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        session_tensor_table(session, false, out_tensors, out_names, out_count)
    })
}

/// Lists every session output; see `skein_interpreter_get_session_input_all`.
///
/// # Safety
/// Both handles must be live; the out parameters must be writable.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_get_session_output_all(
    self_: *const SkeinInterpreter,
    session: *const SkeinSession,
    out_tensors: *mut *mut *mut SkeinTensor,
    out_names: *mut *mut *mut c_char,
    out_count: *mut usize,
) -> SkeinCode {
    guard(|| {
        let (Some(_), Some(session)) = (unsafe { self_.as_ref() }, unsafe { session.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        session_tensor_table(session, true, out_tensors, out_names, out_count)
    })
}

/// Frees a tensor-pointer array returned by the `_all` accessors. The
/// tensors themselves are borrowed and untouched.
///
/// # Safety
/// `(ptr, count)` must be an array returned by this library, freed at
/// most once.
#[no_mangle]
pub unsafe extern "C" fn skein_tensor_array_free(ptr: *mut *mut SkeinTensor, count: usize) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, count)) });
}

/// Resizes a session tensor in place (the tensor must belong to this
/// session). Call `skein_interpreter_resize_session` before the next run.
///
/// # Safety
/// All handles must be live; `dims` must point to `ndim` elements.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_resize_tensor(
    self_: *const SkeinInterpreter,
    tensor: *mut SkeinTensor,
    dims: *const i32,
    ndim: usize,
) -> SkeinCode {
    guard(|| {
        let (Some(_), Some(tensor)) = (unsafe { self_.as_ref() }, unsafe { tensor.as_mut() })
        else {
            return SkeinCode::InvalidPtr;
        };
        if dims.is_null() && ndim > 0 {
            return SkeinCode::InvalidPtr;
        }
        let slice = if ndim == 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(dims, ndim) }
        };
        let dims: Result<Vec<usize>, _> = slice.iter().map(|d| usize::try_from(*d)).collect();
        let Ok(dims) = dims else {
            return SkeinCode::InvalidArg;
        };
        SkeinCode::from_result(tensor.inner.resize_dims(dims))
    })
}

/// Number of unreleased sessions owned by the interpreter.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_interpreter_session_count(self_: *const SkeinInterpreter) -> usize {
    unsafe { self_.as_ref() }
        .map(|i| i.inner.session_count())
        .unwrap_or(0)
}
