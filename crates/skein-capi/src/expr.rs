//! Variable/Expression graph entry points.
//!
//! Variable handles returned here are owned (destroy with
//! `skein_var_free`); each is an independent reference to the shared
//! underlying value, so destroying one never invalidates another.

use std::os::raw::{c_char, c_void};

use skein::graph::{self, BinaryOp, OpKind, ReduceOp, UnaryOp};
use skein::ops;
use skein::tensor::{DType, Shape, TensorData};
use skein::{EngineError, Executor, Expression, Variable};

use crate::array::{SkeinVecI32, SkeinVecU8, SkeinVecVar};
use crate::error::SkeinCode;
use crate::handle::{
    box_handle, destroy_handle, dup_cstring, export_buffer, fire_callback, guard, guard_ptr,
    SkeinCallback,
};
use crate::tensor::SkeinTensor;

/// Boundary wrapper over a variable handle plus its active read mapping.
/// The pin keeps the mapped buffer alive until `skein_var_unmap`.
pub struct SkeinVariable {
    var: Variable,
    read_pin: Option<TensorData>,
}

impl SkeinVariable {
    pub(crate) fn new(var: Variable) -> SkeinVariable {
        SkeinVariable {
            var,
            read_pin: None,
        }
    }

    pub(crate) fn var(&self) -> &Variable {
        &self.var
    }
}

/// Boundary wrapper over an expression handle.
pub struct SkeinExpr {
    expr: Expression,
}

/// Variable metadata returned by `skein_var_get_info`; free with
/// `skein_var_info_free`.
#[repr(C)]
pub struct SkeinVarInfo {
    pub order: i32,
    pub dim: *mut i32,
    pub ndim: usize,
    pub dtype: u32,
    pub size: usize,
}

fn c_str<'a>(ptr: *const c_char) -> Result<&'a str, SkeinCode> {
    if ptr.is_null() {
        return Err(SkeinCode::InvalidPtr);
    }
    unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| SkeinCode::InvalidArg)
}

fn dims_from_vec(dims: &SkeinVecI32) -> Result<Vec<usize>, EngineError> {
    dims.inner
        .iter()
        .map(|d| {
            usize::try_from(*d)
                .map_err(|_| EngineError::InvalidArgument(format!("negative dimension {d}")))
        })
        .collect()
}

// ----------------------------------------------------------------------
// Construction

/// Creates a constant variable from a tensor snapshot (the tensor is
/// copied and stays caller-owned).
///
/// # Safety
/// `tensor` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_create_constant(
    tensor: *const SkeinTensor,
) -> *mut SkeinVariable {
    guard_ptr(|| {
        let tensor = unsafe { tensor.as_ref() }?;
        let var = Variable::constant(tensor.inner.to_data());
        Some(box_handle(SkeinVariable::new(var)))
    })
}

/// Creates a host-writable input placeholder. `dims` may be null to defer
/// the shape declaration to a later `skein_var_resize`.
///
/// # Safety
/// `dims` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_create_input(
    dims: *const SkeinVecI32,
    dtype: u32,
) -> *mut SkeinVariable {
    guard_ptr(|| {
        let dtype = DType::from_tag(dtype)?;
        let shape = match unsafe { dims.as_ref() } {
            Some(dims) => Some(Shape::new(dims_from_vec(dims).ok()?)),
            None => None,
        };
        Some(box_handle(SkeinVariable::new(Variable::input(dtype, shape))))
    })
}

/// Creates a scalar f32 constant.
#[no_mangle]
pub extern "C" fn skein_var_create_scalar(value: f32) -> *mut SkeinVariable {
    guard_ptr(|| Some(box_handle(SkeinVariable::new(Variable::scalar(value)))))
}

/// Clones the handle: a new independent reference to the same value.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_clone(self_: *const SkeinVariable) -> *mut SkeinVariable {
    guard_ptr(|| {
        let var = unsafe { self_.as_ref() }?;
        Some(box_handle(SkeinVariable::new(var.var.clone())))
    })
}

/// Destroys a variable handle. Null is a no-op; other handles to the same
/// value stay valid.
///
/// # Safety
/// `self_` must be null or a live handle, destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_var_free(self_: *mut SkeinVariable) {
    unsafe { destroy_handle(self_) };
}

/// Creates a variable denoting one output of an expression.
///
/// # Safety
/// `expr` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_create_from_expr(
    expr: *const SkeinExpr,
    output: i32,
) -> *mut SkeinVariable {
    guard_ptr(|| {
        let expr = unsafe { expr.as_ref() }?;
        let output = usize::try_from(output).ok()?;
        let var = Variable::from_expr(&expr.expr, output).ok()?;
        Some(box_handle(SkeinVariable::new(var)))
    })
}

// ----------------------------------------------------------------------
// Arithmetic constructors (each a mechanical forward)

macro_rules! binary_entry {
    ($name:ident, $op:expr) => {
        /// Builds the elementwise operation over two variables; null on
        /// failure.
        ///
        /// # Safety
        /// Both operands must be live handles.
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            lhs: *const SkeinVariable,
            rhs: *const SkeinVariable,
        ) -> *mut SkeinVariable {
            guard_ptr(|| {
                let (lhs, rhs) = (unsafe { lhs.as_ref() }?, unsafe { rhs.as_ref() }?);
                let out = ops::apply($op, &[lhs.var.clone(), rhs.var.clone()]).ok()?;
                Some(box_handle(SkeinVariable::new(out)))
            })
        }
    };
}

macro_rules! unary_entry {
    ($name:ident, $op:expr) => {
        /// Builds the elementwise operation over one variable; null on
        /// failure.
        ///
        /// # Safety
        /// `input` must be a live handle.
        #[no_mangle]
        pub unsafe extern "C" fn $name(input: *const SkeinVariable) -> *mut SkeinVariable {
            guard_ptr(|| {
                let input = unsafe { input.as_ref() }?;
                let out = ops::apply($op, &[input.var.clone()]).ok()?;
                Some(box_handle(SkeinVariable::new(out)))
            })
        }
    };
}

binary_entry!(skein_var_add, OpKind::Binary(BinaryOp::Add));
binary_entry!(skein_var_sub, OpKind::Binary(BinaryOp::Sub));
binary_entry!(skein_var_mul, OpKind::Binary(BinaryOp::Mul));
binary_entry!(skein_var_div, OpKind::Binary(BinaryOp::Div));
binary_entry!(skein_var_maximum, OpKind::Binary(BinaryOp::Maximum));
binary_entry!(skein_var_minimum, OpKind::Binary(BinaryOp::Minimum));
binary_entry!(
    skein_var_matmul,
    OpKind::MatMul {
        transpose_a: false,
        transpose_b: false,
    }
);

unary_entry!(skein_var_neg, OpKind::Unary(UnaryOp::Neg));
unary_entry!(skein_var_abs, OpKind::Unary(UnaryOp::Abs));
unary_entry!(skein_var_sqrt, OpKind::Unary(UnaryOp::Sqrt));
unary_entry!(skein_var_exp, OpKind::Unary(UnaryOp::Exp));
unary_entry!(skein_var_log, OpKind::Unary(UnaryOp::Log));
unary_entry!(skein_var_tanh, OpKind::Unary(UnaryOp::Tanh));
unary_entry!(skein_var_sigmoid, OpKind::Unary(UnaryOp::Sigmoid));
unary_entry!(skein_var_relu, OpKind::Unary(UnaryOp::Relu));
unary_entry!(skein_var_square, OpKind::Unary(UnaryOp::Square));

fn reduce_entry(
    op: ReduceOp,
    input: *const SkeinVariable,
    axes: *const SkeinVecI32,
    keep_dims: bool,
) -> Option<*mut SkeinVariable> {
    let input = unsafe { input.as_ref() }?;
    let axes = match unsafe { axes.as_ref() } {
        Some(axes) => axes
            .inner
            .iter()
            .map(|a| usize::try_from(*a).ok())
            .collect::<Option<Vec<_>>>()?,
        None => Vec::new(),
    };
    let out = ops::apply(
        OpKind::Reduce {
            op,
            axes,
            keep_dims,
        },
        &[input.var.clone()],
    )
    .ok()?;
    Some(box_handle(SkeinVariable::new(out)))
}

/// Sum over the given axes (all axes when `axes` is null or empty).
///
/// # Safety
/// `input` must be live; `axes` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn skein_var_reduce_sum(
    input: *const SkeinVariable,
    axes: *const SkeinVecI32,
    keep_dims: bool,
) -> *mut SkeinVariable {
    guard_ptr(|| reduce_entry(ReduceOp::Sum, input, axes, keep_dims))
}

/// Mean over the given axes (all axes when `axes` is null or empty).
///
/// # Safety
/// `input` must be live; `axes` must be null or live.
#[no_mangle]
pub unsafe extern "C" fn skein_var_reduce_mean(
    input: *const SkeinVariable,
    axes: *const SkeinVecI32,
    keep_dims: bool,
) -> *mut SkeinVariable {
    guard_ptr(|| reduce_entry(ReduceOp::Mean, input, axes, keep_dims))
}

// ----------------------------------------------------------------------
// Metadata and data access

/// Sets the variable's name.
///
/// # Safety
/// `self_` must be live; `name` must be a readable C string.
#[no_mangle]
pub unsafe extern "C" fn skein_var_set_name(
    self_: *mut SkeinVariable,
    name: *const c_char,
) -> SkeinCode {
    guard(|| {
        let Some(var) = (unsafe { self_.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        let name = match c_str(name) {
            Ok(name) => name,
            Err(code) => return code,
        };
        SkeinCode::from_result(var.var.set_name(name))
    })
}

/// Returns the variable's name as an owned string (free with
/// `skein_string_free`), or null when unnamed.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_get_name(self_: *const SkeinVariable) -> *mut c_char {
    guard_ptr(|| {
        let var = unsafe { self_.as_ref() }?;
        let name = var.var.name()?;
        Some(dup_cstring(&name))
    })
}

/// Fetches shape/dtype metadata as an owned struct (free with
/// `skein_var_info_free`). Returns null when the info is not determinable
/// yet.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_get_info(self_: *const SkeinVariable) -> *mut SkeinVarInfo {
    guard_ptr(|| {
        let var = unsafe { self_.as_ref() }?;
        let info = var.var.info().ok()?;
        let dims: Vec<i32> = info.shape.dims().iter().map(|d| *d as i32).collect();
        let boxed = dims.into_boxed_slice();
        let ndim = boxed.len();
        let dim = Box::into_raw(boxed) as *mut i32;
        Some(box_handle(SkeinVarInfo {
            order: info.order.tag(),
            dim,
            ndim,
            dtype: info.dtype.tag(),
            size: info.size(),
        }))
    })
}

/// Frees a `SkeinVarInfo` and its dimension array. Null is a no-op.
///
/// # Safety
/// `info` must be null or a live handle, freed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_var_info_free(info: *mut SkeinVarInfo) {
    if info.is_null() {
        return;
    }
    let dim = unsafe { &*info }.dim;
    let ndim = unsafe { &*info }.ndim;
    if !dim.is_null() {
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(dim, ndim)) });
    }
    unsafe { destroy_handle(info) };
}

/// Forces evaluation and maps the computed value for reading. The pointer
/// stays valid until `skein_var_unmap` or the handle's destruction and
/// must not be written through.
///
/// # Safety
/// `self_` must be live and not used concurrently; `out` must be
/// writable.
#[no_mangle]
pub unsafe extern "C" fn skein_var_read_map(
    self_: *mut SkeinVariable,
    out: *mut *const c_void,
) -> SkeinCode {
    guard(|| {
        let Some(var) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        if out.is_null() {
            return SkeinCode::InvalidPtr;
        }
        if var.read_pin.is_some() {
            return SkeinCode::MapState;
        }
        match var.var.read() {
            Ok(value) => {
                unsafe { *out = value.bytes().as_ptr() as *const c_void };
                var.read_pin = Some(value);
                SkeinCode::Ok
            }
            Err(err) => SkeinCode::from(&err),
        }
    })
}

/// Maps the variable's host payload for writing (inputs and constants
/// only). Downstream cached results are invalidated.
///
/// # Safety
/// `self_` must be live and not used concurrently; `out` must be
/// writable.
#[no_mangle]
pub unsafe extern "C" fn skein_var_write_map(
    self_: *mut SkeinVariable,
    out: *mut *mut c_void,
) -> SkeinCode {
    guard(|| {
        let Some(var) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        if out.is_null() {
            return SkeinCode::InvalidPtr;
        }
        match var.var.write_map() {
            Ok((ptr, _len)) => {
                unsafe { *out = ptr as *mut c_void };
                SkeinCode::Ok
            }
            Err(err) => SkeinCode::from(&err),
        }
    })
}

/// Ends the active read or write mapping; unmapping while unmapped is a
/// usage error.
///
/// # Safety
/// `self_` must be live and not used concurrently.
#[no_mangle]
pub unsafe extern "C" fn skein_var_unmap(self_: *mut SkeinVariable) -> SkeinCode {
    guard(|| {
        let Some(var) = (unsafe { self_.as_mut() }) else {
            return SkeinCode::InvalidPtr;
        };
        if var.read_pin.take().is_some() {
            return SkeinCode::Ok;
        }
        SkeinCode::from_result(var.var.unmap())
    })
}

/// Mutates the declared shape and invalidates downstream caches.
///
/// # Safety
/// `self_` must be live; `dims` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_resize(
    self_: *mut SkeinVariable,
    dims: *const SkeinVecI32,
) -> SkeinCode {
    guard(|| {
        let (Some(var), Some(dims)) = (unsafe { self_.as_ref() }, unsafe { dims.as_ref() })
        else {
            return SkeinCode::InvalidPtr;
        };
        let dims = match dims_from_vec(dims) {
            Ok(dims) => dims,
            Err(err) => return SkeinCode::from(&err),
        };
        SkeinCode::from_result(var.var.resize(dims))
    })
}

/// Rewires every handle that denoted `dst` to observe `src`'s value.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn skein_var_replace(
    dst: *const SkeinVariable,
    src: *const SkeinVariable,
) -> SkeinCode {
    guard(|| {
        let (Some(dst), Some(src)) = (unsafe { dst.as_ref() }, unsafe { src.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        SkeinCode::from_result(Variable::replace(&dst.var, &src.var))
    })
}

/// Number of live consumer edges.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_link_number(self_: *const SkeinVariable) -> usize {
    unsafe { self_.as_ref() }
        .map(|v| v.var.link_number())
        .unwrap_or(0)
}

/// Owned handle to the `index`-th consuming expression, or null when out
/// of range. Destroy with `skein_expr_free`.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_consumer_at(
    self_: *const SkeinVariable,
    index: usize,
) -> *mut SkeinExpr {
    guard_ptr(|| {
        let var = unsafe { self_.as_ref() }?;
        let mut consumers = var.var.consumers();
        if index >= consumers.len() {
            return None;
        }
        Some(box_handle(SkeinExpr {
            expr: consumers.swap_remove(index),
        }))
    })
}

/// Returns the producing expression (owned, destroy with
/// `skein_expr_free`) and the output index.
///
/// # Safety
/// `self_` must be live; `out_index` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn skein_var_get_expr(
    self_: *const SkeinVariable,
    out_index: *mut i32,
) -> *mut SkeinExpr {
    guard_ptr(|| {
        let var = unsafe { self_.as_ref() }?;
        let (expr, index) = var.var.expr().ok()?;
        if !out_index.is_null() {
            unsafe { *out_index = index as i32 };
        }
        Some(box_handle(SkeinExpr { expr }))
    })
}

// ----------------------------------------------------------------------
// Expression accessors

/// Destroys an expression handle. Null is a no-op.
///
/// # Safety
/// `self_` must be null or a live handle, destroyed at most once.
#[no_mangle]
pub unsafe extern "C" fn skein_expr_free(self_: *mut SkeinExpr) {
    unsafe { destroy_handle(self_) };
}

/// Owned array of the expression's input variables.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_expr_inputs(self_: *const SkeinExpr) -> *mut SkeinVecVar {
    guard_ptr(|| {
        let expr = unsafe { self_.as_ref() }?;
        let inputs = expr.expr.inputs().ok()?;
        Some(box_handle(SkeinVecVar::from_vars(inputs)))
    })
}

/// Declared output count; -1 on a stale handle.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_expr_output_size(self_: *const SkeinExpr) -> i32 {
    unsafe { self_.as_ref() }
        .and_then(|e| e.expr.output_size().ok())
        .map(|n| n as i32)
        .unwrap_or(-1)
}

/// Expression name as an owned string, or null when unnamed.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_expr_get_name(self_: *const SkeinExpr) -> *mut c_char {
    guard_ptr(|| {
        let expr = unsafe { self_.as_ref() }?;
        Some(dup_cstring(&expr.expr.name()?))
    })
}

/// Per-output name as an owned string, or null when unnamed.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_expr_output_name(
    self_: *const SkeinExpr,
    index: i32,
) -> *mut c_char {
    guard_ptr(|| {
        let expr = unsafe { self_.as_ref() }?;
        let index = usize::try_from(index).ok()?;
        let name = expr.expr.output_name(index).ok().flatten()?;
        Some(dup_cstring(&name))
    })
}

/// Attempts to infer metadata for every output.
///
/// # Safety
/// `self_` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_expr_require_info(self_: *const SkeinExpr) -> bool {
    unsafe { self_.as_ref() }
        .map(|e| e.expr.require_info())
        .unwrap_or(false)
}

// ----------------------------------------------------------------------
// Forcing and serialization

/// Forces evaluation of a set of variables through the current executor.
/// The callback, when non-null, fires exactly once after the blocking
/// work, success or failure.
///
/// # Safety
/// `vars` must be a live handle; `callback`/`user` follow the callback
/// contract.
#[no_mangle]
pub unsafe extern "C" fn skein_var_compute(
    vars: *const SkeinVecVar,
    callback: SkeinCallback,
    user: *mut c_void,
) -> SkeinCode {
    guard(|| {
        let Some(vars) = (unsafe { vars.as_ref() }) else {
            fire_callback(callback, user);
            return SkeinCode::InvalidPtr;
        };
        let result = Executor::current().compute(&vars.inner);
        fire_callback(callback, user);
        SkeinCode::from_result(result)
    })
}

/// Ensures shapes/backend resources exist for a set of variables without
/// materializing values.
///
/// # Safety
/// `vars` must be a live handle; `callback`/`user` follow the callback
/// contract.
#[no_mangle]
pub unsafe extern "C" fn skein_var_prepare_compute(
    vars: *const SkeinVecVar,
    callback: SkeinCallback,
    user: *mut c_void,
) -> SkeinCode {
    guard(|| {
        let Some(vars) = (unsafe { vars.as_ref() }) else {
            fire_callback(callback, user);
            return SkeinCode::InvalidPtr;
        };
        let result = Executor::current().prepare_compute(&vars.inner);
        fire_callback(callback, user);
        SkeinCode::from_result(result)
    })
}

/// Serializes the variables (and their transitive subgraph) to a file.
///
/// # Safety
/// `vars` must be live; `path` must be a readable C string.
#[no_mangle]
pub unsafe extern "C" fn skein_var_save(
    vars: *const SkeinVecVar,
    path: *const c_char,
) -> SkeinCode {
    guard(|| {
        let Some(vars) = (unsafe { vars.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        let path = match c_str(path) {
            Ok(path) => path,
            Err(code) => return code,
        };
        SkeinCode::from_result(graph::save_file(&vars.inner, path))
    })
}

/// Serializes the variables to an owned byte buffer; free it with
/// `skein_buffer_free` or hand it to `skein_vecu8_adopt`.
///
/// # Safety
/// `vars` must be live; `out_ptr`/`out_len` must be writable.
#[no_mangle]
pub unsafe extern "C" fn skein_var_save_bytes(
    vars: *const SkeinVecVar,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> SkeinCode {
    guard(|| {
        let Some(vars) = (unsafe { vars.as_ref() }) else {
            return SkeinCode::InvalidPtr;
        };
        if out_ptr.is_null() || out_len.is_null() {
            return SkeinCode::InvalidPtr;
        }
        match graph::save(&vars.inner) {
            Ok(bytes) => {
                let (ptr, len) = export_buffer(bytes);
                unsafe {
                    *out_ptr = ptr;
                    *out_len = len;
                }
                SkeinCode::Ok
            }
            Err(err) => SkeinCode::from(&err),
        }
    })
}

/// Loads a serialized graph from a file, returning its named outputs.
///
/// # Safety
/// `path` must be a readable C string.
#[no_mangle]
pub unsafe extern "C" fn skein_var_load(path: *const c_char) -> *mut SkeinVecVar {
    guard_ptr(|| {
        let path = c_str(path).ok()?;
        let vars = graph::load_file(path).ok()?;
        Some(box_handle(SkeinVecVar::from_vars(vars)))
    })
}

/// Loads a serialized graph from bytes, returning its named outputs.
///
/// # Safety
/// `data` must point to `length` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn skein_var_load_buffer(
    data: *const u8,
    length: usize,
) -> *mut SkeinVecVar {
    guard_ptr(|| {
        if data.is_null() {
            return None;
        }
        let bytes = unsafe { std::slice::from_raw_parts(data, length) };
        let vars = graph::load(bytes).ok()?;
        Some(box_handle(SkeinVecVar::from_vars(vars)))
    })
}

/// Loads a serialized graph from an adopted/copied byte array handle.
///
/// # Safety
/// `data` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn skein_var_load_vec(data: *const SkeinVecU8) -> *mut SkeinVecVar {
    guard_ptr(|| {
        let data = unsafe { data.as_ref() }?;
        let vars = graph::load(&data.inner).ok()?;
        Some(box_handle(SkeinVecVar::from_vars(vars)))
    })
}
