//! Executor and scope entry points.
//!
//! Scope handles must be destroyed on the thread that created them, in
//! reverse order of creation (LIFO). The guard restores the previous
//! current executor even when the host unwinds its own stack abnormally
//! and destroys scopes late, but out-of-order destruction is a caller bug
//! and is logged.

use std::sync::Arc;

use skein::backend::{BackendConfig, BackendKind, MemoryMode, Precision, ScheduleConfig};
use skein::{exec, Executor};

use crate::error::SkeinCode;
use crate::handle::{box_handle, destroy_handle, guard, guard_ptr};

/// Backend tuning block crossing the boundary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SkeinBackendConfig {
    /// 0 normal, 1 high, 2 low.
    pub precision: i32,
    /// 0 normal, 1 high, 2 low.
    pub memory: i32,
}

/// Schedule configuration crossing the boundary: backend kind, thread
/// count (or backend-specific mode), fallback kind, optional tuning
/// block.
#[repr(C)]
pub struct SkeinScheduleConfig {
    pub kind: i32,
    pub threads: i32,
    pub backup: i32,
    pub backend_config: *const SkeinBackendConfig,
}

pub(crate) fn schedule_from_c(config: *const SkeinScheduleConfig) -> Result<ScheduleConfig, SkeinCode> {
    let Some(config) = (unsafe { config.as_ref() }) else {
        return Ok(ScheduleConfig::default());
    };
    let kind = BackendKind::from_tag(config.kind).ok_or(SkeinCode::InvalidArg)?;
    let backup = BackendKind::from_tag(config.backup).ok_or(SkeinCode::InvalidArg)?;
    let backend_config = unsafe { config.backend_config.as_ref() }
        .map(|c| {
            Ok::<_, SkeinCode>(BackendConfig {
                precision: precision_from_tag(c.precision)?,
                memory: memory_from_tag(c.memory)?,
            })
        })
        .transpose()?;
    Ok(ScheduleConfig {
        kind,
        threads: config.threads,
        backup,
        config: backend_config,
    })
}

fn precision_from_tag(tag: i32) -> Result<Precision, SkeinCode> {
    match tag {
        0 => Ok(Precision::Normal),
        1 => Ok(Precision::High),
        2 => Ok(Precision::Low),
        _ => Err(SkeinCode::InvalidArg),
    }
}

fn memory_from_tag(tag: i32) -> Result<MemoryMode, SkeinCode> {
    match tag {
        0 => Ok(MemoryMode::Normal),
        1 => Ok(MemoryMode::High),
        2 => Ok(MemoryMode::Low),
        _ => Err(SkeinCode::InvalidArg),
    }
}

/// Boundary wrapper over a shared executor reference.
pub struct SkeinExecutor {
    pub(crate) inner: Arc<Executor>,
}

/// Active scope activation; destroying it restores the previous current
/// executor.
pub struct SkeinExecutorScope {
    _guard: exec::ExecutorScope,
    executor: Arc<Executor>,
}

/// Creates an executor with the given schedule (null for defaults).
///
/// # Safety
/// `config` must be null or point to a readable config.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_create(
    config: *const SkeinScheduleConfig,
) -> *mut SkeinExecutor {
    guard_ptr(|| {
        let schedule = schedule_from_c(config).ok()?;
        Some(box_handle(SkeinExecutor {
            inner: Executor::new(schedule),
        }))
    })
}

/// Returns a new reference to the process-wide default executor.
#[no_mangle]
pub extern "C" fn skein_executor_global() -> *mut SkeinExecutor {
    guard_ptr(|| {
        Some(box_handle(SkeinExecutor {
            inner: Executor::global(),
        }))
    })
}

/// Returns a new reference to the thread's current executor.
#[no_mangle]
pub extern "C" fn skein_executor_current() -> *mut SkeinExecutor {
    guard_ptr(|| {
        Some(box_handle(SkeinExecutor {
            inner: Executor::current(),
        }))
    })
}

/// Destroys an executor reference. The executor itself lives as long as
/// any reference (scopes included). Null is a no-op.
///
/// # Safety
/// `self_` must be null or a live handle, destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_destroy(self_: *mut SkeinExecutor) {
    unsafe { destroy_handle(self_) };
}

/// Reads the lazy-evaluation flag.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_get_lazy_eval(self_: *const SkeinExecutor) -> bool {
    unsafe { self_.as_ref() }
        .map(|e| e.inner.lazy_eval())
        .unwrap_or(false)
}

/// Switches the executor between lazy and eager construction.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_set_lazy_eval(
    self_: *const SkeinExecutor,
    lazy: bool,
) -> SkeinCode {
    guard(|| {
        let Some(executor) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        executor.inner.set_lazy_eval(lazy);
        SkeinCode::Ok
    })
}

/// Replaces the executor's default schedule.
///
/// # Safety
/// `self_` must be live; `config` must be null or readable.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_set_schedule(
    self_: *const SkeinExecutor,
    config: *const SkeinScheduleConfig,
) -> SkeinCode {
    guard(|| {
        let Some(executor) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        match schedule_from_c(config) {
            Ok(schedule) => {
                executor.inner.set_schedule(schedule);
                SkeinCode::Ok
            }
            Err(code) => code,
        }
    })
}

/// Discards cached intermediate buffers not reachable from any live
/// variable. Safe at any time.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_gc(self_: *const SkeinExecutor) -> SkeinCode {
    guard(|| {
        let Some(executor) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        executor.inner.gc();
        SkeinCode::Ok
    })
}

/// Pushes the executor as the thread's current one. Destroy the returned
/// scope (on the same thread, LIFO) to restore the previous executor.
///
/// # Safety
/// `executor` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_scope_enter(
    executor: *const SkeinExecutor,
) -> *mut SkeinExecutorScope {
    guard_ptr(|| {
        let executor = unsafe { executor.as_ref() }?;
        let inner = Arc::clone(&executor.inner);
        let guard = exec::enter(Arc::clone(&inner));
        Some(box_handle(SkeinExecutorScope {
            _guard: guard,
            executor: inner,
        }))
    })
}

/// Ends a scope, restoring the previous current executor. Must be called
/// on the creating thread, in reverse order of entry. Null is a no-op.
///
/// # Safety
/// `self_` must be null or a live handle created on this thread,
/// destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_executor_scope_exit(self_: *mut SkeinExecutorScope) {
    if self_.is_null() {
        return;
    }
    let top = Executor::current();
    if !Arc::ptr_eq(&top, unsafe { &(*self_).executor }) {
        log::warn!("executor scopes exited out of LIFO order");
    }
    unsafe { destroy_handle(self_) };
}
