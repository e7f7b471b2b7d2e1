//! The handle-boxing convention and boundary guards.
//!
//! Every object crossing the boundary is one level of owned `Box`
//! indirection: `create` returns `Box::into_raw`, the paired `destroy`
//! reclaims exactly that box. Destroy on null is a no-op. Double-destroy
//! is a caller bug: debug builds keep a ledger of live handle addresses
//! and defuse (and log) the second destroy instead of corrupting the
//! allocator; release builds do not pay for the ledger.
//!
//! Every entry point body runs under `catch_unwind`, so no panic ever
//! crosses the boundary frame.

use std::os::raw::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::SkeinCode;

/// Optional completion callback: when non-null, invoked exactly once after
/// the call's blocking work finishes, success or failure.
pub type SkeinCallback = Option<unsafe extern "C" fn(user: *mut c_void)>;

pub(crate) fn fire_callback(callback: SkeinCallback, user: *mut c_void) {
    if let Some(callback) = callback {
        unsafe { callback(user) };
    }
}

#[cfg(debug_assertions)]
mod ledger {
    use once_cell::sync::Lazy;
    use std::collections::HashSet;
    use std::sync::Mutex;

    static LIVE: Lazy<Mutex<HashSet<usize>>> = Lazy::new(|| Mutex::new(HashSet::new()));

    pub(crate) fn register(addr: usize) {
        LIVE.lock().expect("handle ledger poisoned").insert(addr);
    }

    /// Returns false when the address is not a live handle (double destroy
    /// or a pointer this library never produced).
    pub(crate) fn release(addr: usize) -> bool {
        LIVE.lock().expect("handle ledger poisoned").remove(&addr)
    }
}

/// Boxes a value into an owned handle.
pub(crate) fn box_handle<T>(value: T) -> *mut T {
    let ptr = Box::into_raw(Box::new(value));
    #[cfg(debug_assertions)]
    ledger::register(ptr as usize);
    ptr
}

/// Destroys a handle produced by [`box_handle`]. Null is a no-op; in debug
/// builds a double destroy is flagged and skipped.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by [`box_handle`]
/// that has not been destroyed yet.
pub(crate) unsafe fn destroy_handle<T>(ptr: *mut T) {
    if ptr.is_null() {
        return;
    }
    #[cfg(debug_assertions)]
    if !ledger::release(ptr as usize) {
        log::warn!("double destroy of handle {:p} ignored", ptr);
        return;
    }
    drop(unsafe { Box::from_raw(ptr) });
}

/// Runs an entry-point body, converting panics into `Unknown`.
pub(crate) fn guard<F>(f: F) -> SkeinCode
where
    F: FnOnce() -> SkeinCode,
{
    crate::ensure_runtime();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => code,
        Err(_) => {
            log::error!("panic contained at boundary");
            SkeinCode::Unknown
        }
    }
}

/// Runs an entry-point body returning a handle; panics and `None` become
/// null.
pub(crate) fn guard_ptr<T, F>(f: F) -> *mut T
where
    F: FnOnce() -> Option<*mut T>,
{
    crate::ensure_runtime();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Some(ptr)) => ptr,
        Ok(None) => std::ptr::null_mut(),
        Err(_) => {
            log::error!("panic contained at boundary");
            std::ptr::null_mut()
        }
    }
}

/// Borrows a handle, failing with `InvalidPtr` on null.
///
/// # Safety
/// `ptr` must be null or a live handle of the right type.
pub(crate) unsafe fn deref<'a, T>(ptr: *const T) -> Result<&'a T, SkeinCode> {
    unsafe { ptr.as_ref() }.ok_or(SkeinCode::InvalidPtr)
}

/// Mutably borrows a handle, failing with `InvalidPtr` on null.
///
/// # Safety
/// `ptr` must be null or a live handle of the right type, not aliased for
/// the duration of the call.
pub(crate) unsafe fn deref_mut<'a, T>(ptr: *mut T) -> Result<&'a mut T, SkeinCode> {
    unsafe { ptr.as_mut() }.ok_or(SkeinCode::InvalidPtr)
}

/// Duplicates a string onto the heap as a NUL-terminated C string the
/// caller frees with `skein_string_free`.
pub(crate) fn dup_cstring(value: &str) -> *mut c_char {
    let sanitized: Vec<u8> = value.bytes().filter(|b| *b != 0).collect();
    match std::ffi::CString::new(sanitized) {
        Ok(cstring) => cstring.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Frees a string returned by this library. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a string returned by this library that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn skein_string_free(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { std::ffi::CString::from_raw(ptr) });
}

/// Hands a byte vector to the caller as an owned (pointer, length) pair,
/// freed with `skein_buffer_free`.
pub(crate) fn export_buffer(bytes: Vec<u8>) -> (*mut u8, usize) {
    let boxed = bytes.into_boxed_slice();
    let len = boxed.len();
    (Box::into_raw(boxed) as *mut u8, len)
}

/// Frees a buffer returned as a (pointer, length) pair. Null is a no-op.
///
/// # Safety
/// `(ptr, len)` must be a pair returned by this library, freed at most
/// once.
#[no_mangle]
pub unsafe extern "C" fn skein_buffer_free(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
}

/// Frees an array of strings previously returned by this library (both the
/// strings and the array itself).
///
/// # Safety
/// `(ptr, count)` must be an array returned by this library, freed at most
/// once; every element must still be live.
#[no_mangle]
pub unsafe extern "C" fn skein_string_array_free(ptr: *mut *mut c_char, count: usize) {
    if ptr.is_null() {
        return;
    }
    let strings = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, count)) };
    for string in strings.iter() {
        unsafe { skein_string_free(*string) };
    }
}

/// Exports a vector of C strings as a caller-owned array.
pub(crate) fn export_string_array(values: &[String]) -> (*mut *mut c_char, usize) {
    let array: Vec<*mut c_char> = values.iter().map(|s| dup_cstring(s)).collect();
    let boxed = array.into_boxed_slice();
    let count = boxed.len();
    (Box::into_raw(boxed) as *mut *mut c_char, count)
}
