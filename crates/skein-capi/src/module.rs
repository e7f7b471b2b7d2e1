//! Module entry points.

use std::os::raw::{c_char, c_void};

use skein::module::{Module, ModuleConfig};
use skein::tensor::TensorData;
use skein::EngineResult;

use crate::array::SkeinVecVar;
use crate::error::SkeinCode;
use crate::executor::{schedule_from_c, SkeinScheduleConfig};
use crate::expr::SkeinVariable;
use crate::handle::{
    box_handle, destroy_handle, dup_cstring, export_string_array, fire_callback, guard, guard_ptr,
    SkeinCallback,
};

/// Module load-time configuration crossing the boundary.
#[repr(C)]
pub struct SkeinModuleConfig {
    pub dynamic: bool,
    pub shape_mutable: bool,
    pub rearrange: bool,
    pub backend: *const SkeinScheduleConfig,
}

/// Boundary wrapper over a module.
pub struct SkeinModule {
    inner: Module,
}

fn config_from_c(config: *const SkeinModuleConfig) -> Result<ModuleConfig, SkeinCode> {
    let Some(config) = (unsafe { config.as_ref() }) else {
        return Ok(ModuleConfig::default());
    };
    let backend = if config.backend.is_null() {
        None
    } else {
        Some(schedule_from_c(config.backend)?)
    };
    Ok(ModuleConfig {
        dynamic: config.dynamic,
        shape_mutable: config.shape_mutable,
        rearrange: config.rearrange,
        backend,
    })
}

fn names_from_c(names: *const *const c_char, count: usize) -> Result<Vec<String>, SkeinCode> {
    if names.is_null() && count > 0 {
        return Err(SkeinCode::InvalidPtr);
    }
    let slice = if count == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(names, count) }
    };
    slice
        .iter()
        .map(|ptr| {
            if ptr.is_null() {
                return Err(SkeinCode::InvalidPtr);
            }
            unsafe { std::ffi::CStr::from_ptr(*ptr) }
                .to_str()
                .map(|s| s.to_string())
                .map_err(|_| SkeinCode::InvalidArg)
        })
        .collect()
}

/// Loads a module from serialized graph bytes restricted to the declared
/// input/output names. Returns null on failure.
///
/// # Safety
/// `data` must point to `length` readable bytes; the name arrays must
/// hold `input_count`/`output_count` readable C strings; `config` must be
/// null or readable.
#[no_mangle]
pub unsafe extern "C" fn skein_module_load_from_buffer(
    data: *const u8,
    length: usize,
    inputs: *const *const c_char,
    input_count: usize,
    outputs: *const *const c_char,
    output_count: usize,
    config: *const SkeinModuleConfig,
) -> *mut SkeinModule {
    guard_ptr(|| {
        if data.is_null() {
            return None;
        }
        let bytes = unsafe { std::slice::from_raw_parts(data, length) };
        let inputs = names_from_c(inputs, input_count).ok()?;
        let outputs = names_from_c(outputs, output_count).ok()?;
        let config = config_from_c(config).ok()?;
        let module = Module::load(bytes, &inputs, &outputs, config).ok()?;
        Some(box_handle(SkeinModule { inner: module }))
    })
}

/// Loads a module from a serialized graph file.
///
/// # Safety
/// As for `skein_module_load_from_buffer`; `path` must be a readable C
/// string.
#[no_mangle]
pub unsafe extern "C" fn skein_module_load_from_file(
    path: *const c_char,
    inputs: *const *const c_char,
    input_count: usize,
    outputs: *const *const c_char,
    output_count: usize,
    config: *const SkeinModuleConfig,
) -> *mut SkeinModule {
    guard_ptr(|| {
        if path.is_null() {
            return None;
        }
        let path = unsafe { std::ffi::CStr::from_ptr(path) }.to_str().ok()?;
        let inputs = names_from_c(inputs, input_count).ok()?;
        let outputs = names_from_c(outputs, output_count).ok()?;
        let config = config_from_c(config).ok()?;
        let module = Module::load_file(path, &inputs, &outputs, config).ok()?;
        Some(box_handle(SkeinModule { inner: module }))
    })
}

/// Builds a module from live variables, cutting the graph at `inputs`.
///
/// # Safety
/// Both arrays must be live handles.
#[no_mangle]
pub unsafe extern "C" fn skein_module_extract(
    inputs: *const SkeinVecVar,
    outputs: *const SkeinVecVar,
    for_train: bool,
) -> *mut SkeinModule {
    guard_ptr(|| {
        let inputs = unsafe { inputs.as_ref() }?;
        let outputs = unsafe { outputs.as_ref() }?;
        let module = Module::extract(&inputs.inner, &outputs.inner, for_train).ok()?;
        Some(box_handle(SkeinModule { inner: module }))
    })
}

/// Duplicates the module; with `share_params` the parameter storage is
/// aliased, so writes through one clone are visible through the other.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_module_clone(
    self_: *const SkeinModule,
    share_params: bool,
) -> *mut SkeinModule {
    guard_ptr(|| {
        let module = unsafe { self_.as_ref() }?;
        let clone = module.inner.clone_module(share_params).ok()?;
        Some(box_handle(SkeinModule { inner: clone }))
    })
}

/// Destroys a module handle. Null is a no-op.
///
/// # Safety
/// `self_` must be null or a live handle, destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_module_destroy(self_: *mut SkeinModule) {
    unsafe { destroy_handle(self_) };
}

/// Runs the module over one input, writing an owned output variable into
/// `out`. Input-count mismatches are invalid arguments, never crashes.
///
/// # Safety
/// `self_`/`input` must be live; `out` must be writable;
/// `callback`/`user` follow the callback contract.
#[no_mangle]
pub unsafe extern "C" fn skein_module_forward(
    self_: *const SkeinModule,
    input: *const SkeinVariable,
    out: *mut *mut SkeinVariable,
    callback: SkeinCallback,
    user: *mut c_void,
) -> SkeinCode {
    guard(|| {
        let result = (|| -> Result<EngineResult<()>, SkeinCode> {
            let (Some(module), Some(input)) =
                (unsafe { self_.as_ref() }, unsafe { input.as_ref() })
            else {
                return Err(SkeinCode::InvalidPtr);
            };
            if out.is_null() {
                return Err(SkeinCode::InvalidPtr);
            }
            Ok(match module.inner.forward(input.var()) {
                Ok(output) => {
                    unsafe { *out = box_handle(SkeinVariable::new(output)) };
                    Ok(())
                }
                Err(err) => Err(err),
            })
        })();
        fire_callback(callback, user);
        match result {
            Ok(engine_result) => SkeinCode::from_result(engine_result),
            Err(code) => code,
        }
    })
}

/// Runs the module over a list of inputs, writing an owned variable array
/// into `out`.
///
/// # Safety
/// `self_`/`inputs` must be live; `out` must be writable;
/// `callback`/`user` follow the callback contract.
#[no_mangle]
pub unsafe extern "C" fn skein_module_on_forward(
    self_: *const SkeinModule,
    inputs: *const SkeinVecVar,
    out: *mut *mut SkeinVecVar,
    callback: SkeinCallback,
    user: *mut c_void,
) -> SkeinCode {
    guard(|| {
        let result = (|| -> Result<EngineResult<()>, SkeinCode> {
            let (Some(module), Some(inputs)) =
                (unsafe { self_.as_ref() }, unsafe { inputs.as_ref() })
            else {
                return Err(SkeinCode::InvalidPtr);
            };
            if out.is_null() {
                return Err(SkeinCode::InvalidPtr);
            }
            Ok(match module.inner.on_forward(&inputs.inner) {
                Ok(outputs) => {
                    unsafe { *out = box_handle(SkeinVecVar::from_vars(outputs)) };
                    Ok(())
                }
                Err(err) => Err(err),
            })
        })();
        fire_callback(callback, user);
        match result {
            Ok(engine_result) => SkeinCode::from_result(engine_result),
            Err(code) => code,
        }
    })
}

/// Owned array of the module's parameter variables (shared storage).
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_module_parameters(self_: *const SkeinModule) -> *mut SkeinVecVar {
    guard_ptr(|| {
        let module = unsafe { self_.as_ref() }?;
        Some(box_handle(SkeinVecVar::from_vars(module.inner.parameters())))
    })
}

/// Registers an extra parameter, returning its index (-1 on failure).
///
/// # Safety
/// Both handles must be live; `self_` must not be used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_module_add_parameter(
    self_: *mut SkeinModule,
    parameter: *const SkeinVariable,
) -> i32 {
    crate::ensure_runtime();
    let (Some(module), Some(parameter)) =
        (unsafe { self_.as_mut() }, unsafe { parameter.as_ref() })
    else {
        return -1;
    };
    module.inner.add_parameter(parameter.var()) as i32
}

/// Swaps the parameter handle at `index`.
///
/// # Safety
/// Both handles must be live; `self_` must not be used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_module_set_parameter(
    self_: *mut SkeinModule,
    parameter: *const SkeinVariable,
    index: i32,
) -> SkeinCode {
    guard(|| {
        let (Some(module), Some(parameter)) =
            (unsafe { self_.as_mut() }, unsafe { parameter.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        let Ok(index) = usize::try_from(index) else {
            return SkeinCode::InvalidArg;
        };
        SkeinCode::from_result(module.inner.set_parameter(parameter.var(), index))
    })
}

/// Bulk-loads parameter values from variables (each is forced and
/// snapshotted). Count mismatches leave the module untouched.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn skein_module_load_parameters(
    self_: *const SkeinModule,
    parameters: *const SkeinVecVar,
) -> SkeinCode {
    guard(|| {
        let (Some(module), Some(parameters)) =
            (unsafe { self_.as_ref() }, unsafe { parameters.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        let values: Result<Vec<TensorData>, _> =
            parameters.inner.iter().map(|var| var.read()).collect();
        match values {
            Ok(values) => SkeinCode::from_result(module.inner.load_parameters(&values)),
            Err(err) => SkeinCode::from(&err),
        }
    })
}

/// Module name as an owned string, or null when unnamed.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_module_get_name(self_: *const SkeinModule) -> *mut c_char {
    guard_ptr(|| {
        let module = unsafe { self_.as_ref() }?;
        Some(dup_cstring(module.inner.name()?))
    })
}

/// Sets the module name.
///
/// # Safety
/// `self_` must be live and not used concurrently; `name` must be a
/// readable C string.
#[no_mangle]
pub unsafe extern "C" fn skein_module_set_name(
    self_: *mut SkeinModule,
    name: *const c_char,
) -> SkeinCode {
    guard(|| {
        let Some(module) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        if name.is_null() {
            return SkeinCode::InvalidPtr;
        }
        let Ok(name) = unsafe { std::ffi::CStr::from_ptr(name) }.to_str() else {
            return SkeinCode::InvalidArg;
        };
        module.inner.set_name(name);
        SkeinCode::Ok
    })
}

/// Reads the training flag.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_module_get_is_training(self_: *const SkeinModule) -> bool {
    unsafe { self_.as_ref() }
        .map(|m| m.inner.is_training())
        .unwrap_or(false)
}

/// Sets the training flag.
///
/// # Safety
/// `self_` must be live and not used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_module_set_is_training(
    self_: *mut SkeinModule,
    training: bool,
) -> SkeinCode {
    guard(|| {
        let Some(module) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        module.inner.set_is_training(training);
        SkeinCode::Ok
    })
}

/// Drops memoized intermediate values so later forwards recompute from
/// current parameter contents.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_module_clear_cache(self_: *const SkeinModule) -> SkeinCode {
    guard(|| {
        let Some(module) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        module.inner.clear_cache();
        SkeinCode::Ok
    })
}

/// Declared input names as a caller-owned string array (free with
/// `skein_string_array_free`).
///
/// # Safety
/// `self_` must be live; `out_names`/`out_count` must be writable.
#[no_mangle]
pub unsafe extern "C" fn skein_module_input_names(
    self_: *const SkeinModule,
    out_names: *mut *mut *mut c_char,
    out_count: *mut usize,
) -> SkeinCode {
    guard(|| {
        let Some(module) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        if out_names.is_null() || out_count.is_null() {
            return SkeinCode::InvalidPtr;
        }
        let info = module.inner.info();
        let (names, count) = export_string_array(&info.input_names);
        unsafe {
            *out_names = names;
            *out_count = count;
        }
        SkeinCode::Ok
    })
}

/// Declared output names as a caller-owned string array (free with
/// `skein_string_array_free`).
///
/// # Safety
/// `self_` must be live; `out_names`/`out_count` must be writable.
#[no_mangle]
pub unsafe extern "C" fn skein_module_output_names(
    self_: *const SkeinModule,
    out_names: *mut *mut *mut c_char,
    out_count: *mut usize,
) -> SkeinCode {
    guard(|| {
        let Some(module) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        if out_names.is_null() || out_count.is_null() {
            return SkeinCode::InvalidPtr;
        }
        let info = module.inner.info();
        let (names, count) = export_string_array(&info.output_names);
        unsafe {
            *out_names = names;
            *out_count = count;
        }
        SkeinCode::Ok
    })
}
