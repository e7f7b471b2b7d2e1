//! Boundary contract tests: handle pairing, array independence, map
//! discipline, scope LIFO, callbacks, and the session lifecycle, all
//! through the extern surface.

use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use skein_capi::*;

unsafe extern "C" fn count_callback(user: *mut c_void) {
    let counter = unsafe { &*(user as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::SeqCst);
}

fn cstr(s: &str) -> std::ffi::CString {
    std::ffi::CString::new(s).unwrap()
}

#[test]
fn destroy_null_is_a_no_op() {
    unsafe {
        skein_tensor_destroy(std::ptr::null_mut());
        skein_var_free(std::ptr::null_mut());
        skein_vecu8_free(std::ptr::null_mut());
        skein_executor_destroy(std::ptr::null_mut());
        skein_module_destroy(std::ptr::null_mut());
        skein_interpreter_destroy(std::ptr::null_mut());
        skein_string_free(std::ptr::null_mut());
        skein_buffer_free(std::ptr::null_mut(), 0);
    }
}

#[test]
fn double_destroy_is_flagged_not_fatal() {
    // Debug builds keep a handle ledger: the second destroy is detected
    // and skipped instead of corrupting the allocator. (Release builds
    // drop the ledger, so the caller contract is only checked here.)
    let vec = skein_veci32_new(4);
    assert!(!vec.is_null());
    unsafe {
        skein_veci32_free(vec);
        #[cfg(debug_assertions)]
        skein_veci32_free(vec);
    }
}

#[test]
fn array_bridge_snapshots_are_independent() {
    let data = [1i32, 2, 3];
    let original = unsafe { skein_veci32_from_data(data.as_ptr(), data.len()) };
    let copy = unsafe { skein_veci32_clone(original) };

    unsafe {
        assert_eq!(skein_veci32_set(original, 0, 99), SkeinCode::Ok);
        let mut value = 0i32;
        assert_eq!(skein_veci32_get(copy, 0, &mut value), SkeinCode::Ok);
        assert_eq!(value, 1, "mutating one instance must not affect a clone");

        assert_eq!(skein_veci32_push(original, 4), SkeinCode::Ok);
        assert_eq!(skein_veci32_length(original), 4);
        assert_eq!(skein_veci32_length(copy), 3);

        assert_eq!(skein_veci32_extend(original, copy), SkeinCode::Ok);
        assert_eq!(skein_veci32_length(original), 7);

        // Out-of-range access is an error code, not a crash.
        assert_eq!(skein_veci32_get(copy, 10, &mut value), SkeinCode::InvalidArg);
        assert_eq!(skein_veci32_set(copy, 10, 0), SkeinCode::InvalidArg);

        assert_eq!(skein_veci32_resize(copy, 5), SkeinCode::Ok);
        assert_eq!(skein_veci32_length(copy), 5);
        assert_eq!(skein_veci32_clear(copy), SkeinCode::Ok);
        assert_eq!(skein_veci32_length(copy), 0);

        skein_veci32_free(original);
        skein_veci32_free(copy);
    }
}

#[test]
fn tensor_map_discipline_over_the_boundary() {
    let dims = [2i32, 3];
    let tensor = unsafe { skein_tensor_create_host(dims.as_ptr(), 2, 0) };
    assert!(!tensor.is_null());

    unsafe {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        assert_eq!(skein_tensor_map(tensor, SKEIN_MAP_WRITE, &mut ptr), SkeinCode::Ok);
        assert!(!ptr.is_null());
        // Double map is a usage error.
        let mut second: *mut c_void = std::ptr::null_mut();
        assert_eq!(
            skein_tensor_map(tensor, SKEIN_MAP_READ, &mut second),
            SkeinCode::MapState
        );
        assert_eq!(skein_tensor_unmap(tensor), SkeinCode::Ok);
        assert_eq!(skein_tensor_unmap(tensor), SkeinCode::MapState);

        assert_eq!(skein_tensor_dimensions(tensor), 2);
        assert_eq!(skein_tensor_element_count(tensor), 6);
        assert_eq!(skein_tensor_stride(tensor, 0), 3);

        skein_tensor_destroy(tensor);
    }
}

#[test]
fn device_tensors_require_copies() {
    let dims = [4i32];
    unsafe {
        let device = skein_tensor_create_device(dims.as_ptr(), 1, 0);
        let host = skein_tensor_create_host(dims.as_ptr(), 1, 0);
        assert!(!skein_tensor_is_host(device));
        assert_ne!(skein_tensor_device_id(device), 0);

        let mut ptr: *mut c_void = std::ptr::null_mut();
        assert_eq!(
            skein_tensor_map(device, SKEIN_MAP_READ, &mut ptr),
            SkeinCode::Unsupported
        );

        let mut host_ptr: *mut c_void = std::ptr::null_mut();
        assert_eq!(skein_tensor_map(host, SKEIN_MAP_WRITE, &mut host_ptr), SkeinCode::Ok);
        let values = std::slice::from_raw_parts_mut(host_ptr as *mut f32, 4);
        values.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(skein_tensor_unmap(host), SkeinCode::Ok);

        assert_eq!(skein_tensor_copy_from_host(device, host), SkeinCode::Ok);
        let round = skein_tensor_create_host(dims.as_ptr(), 1, 0);
        assert_eq!(skein_tensor_copy_to_host(device, round), SkeinCode::Ok);

        let mut round_ptr: *mut c_void = std::ptr::null_mut();
        assert_eq!(skein_tensor_map(round, SKEIN_MAP_READ, &mut round_ptr), SkeinCode::Ok);
        let round_values = std::slice::from_raw_parts(round_ptr as *const f32, 4);
        assert_eq!(round_values, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(skein_tensor_unmap(round), SkeinCode::Ok);

        skein_tensor_destroy(device);
        skein_tensor_destroy(host);
        skein_tensor_destroy(round);
    }
}

#[test]
fn variable_arithmetic_and_read_map() {
    // Scenario: [1,3,2,2] pattern plus constant one, read back.
    let dims = [1i32, 3, 2, 2];
    let pattern: Vec<f32> = (0..12).map(|i| i as f32 * 2.0).collect();
    unsafe {
        let tensor = skein_tensor_create_with_data(
            dims.as_ptr(),
            4,
            0,
            pattern.as_ptr() as *const c_void,
        );
        let wrapped = skein_var_create_constant(tensor);
        skein_tensor_destroy(tensor);

        let one = skein_var_create_scalar(1.0);
        let sum = skein_var_add(wrapped, one);
        assert!(!sum.is_null());

        let mut ptr: *const c_void = std::ptr::null();
        assert_eq!(skein_var_read_map(sum, &mut ptr), SkeinCode::Ok);
        let values = std::slice::from_raw_parts(ptr as *const f32, 12);
        for (value, original) in values.iter().zip(&pattern) {
            assert_eq!(*value, original + 1.0);
        }
        // Mapping twice without unmap is a usage error.
        let mut again: *const c_void = std::ptr::null();
        assert_eq!(skein_var_read_map(sum, &mut again), SkeinCode::MapState);
        assert_eq!(skein_var_unmap(sum), SkeinCode::Ok);
        assert_eq!(skein_var_unmap(sum), SkeinCode::MapState);

        // Info reflects the shape.
        let info = skein_var_get_info(sum);
        assert!(!info.is_null());
        assert_eq!((*info).ndim, 4);
        let info_dims = std::slice::from_raw_parts((*info).dim, 4);
        assert_eq!(info_dims, &[1, 3, 2, 2]);
        skein_var_info_free(info);

        skein_var_free(one);
        skein_var_free(wrapped);
        skein_var_free(sum);
    }
}

#[test]
fn replace_through_the_boundary() {
    unsafe {
        let a = skein_var_create_scalar(2.0);
        let b = skein_var_create_scalar(5.0);
        let held = skein_var_clone(a);

        assert_eq!(skein_var_replace(a, b), SkeinCode::Ok);

        let mut ptr: *const c_void = std::ptr::null();
        assert_eq!(skein_var_read_map(held, &mut ptr), SkeinCode::Ok);
        assert_eq!(*(ptr as *const f32), 5.0);
        assert_eq!(skein_var_unmap(held), SkeinCode::Ok);

        skein_var_free(a);
        skein_var_free(b);
        skein_var_free(held);
    }
}

#[test]
fn expression_accessors() {
    unsafe {
        let a = skein_var_create_scalar(1.0);
        let b = skein_var_create_scalar(2.0);
        let sum = skein_var_add(a, b);

        let mut index = -1i32;
        let expr = skein_var_get_expr(sum, &mut index);
        assert!(!expr.is_null());
        assert_eq!(index, 0);
        assert_eq!(skein_expr_output_size(expr), 1);

        let inputs = skein_expr_inputs(expr);
        assert_eq!(skein_vecvar_length(inputs), 2);
        let first = skein_vecvar_get(inputs, 0);
        assert!(!first.is_null());

        assert_eq!(skein_var_link_number(a), 1);
        let consumer = skein_var_consumer_at(a, 0);
        assert!(!consumer.is_null());
        skein_expr_free(consumer);

        skein_var_free(first);
        skein_vecvar_free(inputs);
        skein_expr_free(expr);
        skein_var_free(sum);
        skein_var_free(b);
        skein_var_free(a);
    }
}

#[test]
fn executor_scope_nesting() {
    unsafe {
        let outer = skein_executor_create(std::ptr::null());
        let inner = skein_executor_create(std::ptr::null());
        assert_eq!(skein_executor_set_lazy_eval(outer, true), SkeinCode::Ok);
        assert_eq!(skein_executor_set_lazy_eval(inner, false), SkeinCode::Ok);

        let scope_outer = skein_executor_scope_enter(outer);
        {
            let current = skein_executor_current();
            assert!(skein_executor_get_lazy_eval(current));
            skein_executor_destroy(current);
        }
        let scope_inner = skein_executor_scope_enter(inner);
        {
            let current = skein_executor_current();
            assert!(!skein_executor_get_lazy_eval(current));
            skein_executor_destroy(current);
        }
        skein_executor_scope_exit(scope_inner);
        {
            let current = skein_executor_current();
            assert!(skein_executor_get_lazy_eval(current));
            skein_executor_destroy(current);
        }
        skein_executor_scope_exit(scope_outer);

        skein_executor_destroy(outer);
        skein_executor_destroy(inner);
        assert_eq!(skein_executor_gc(skein_executor_global()), SkeinCode::Ok);
    }
}

#[test]
fn callback_fires_exactly_once_on_success_and_failure() {
    let counter = AtomicUsize::new(0);
    let user = &counter as *const AtomicUsize as *mut c_void;
    unsafe {
        let vars = skein_vecvar_new();
        assert_eq!(
            skein_var_compute(vars, Some(count_callback), user),
            SkeinCode::Ok
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Failure path: null array still fires the callback once.
        assert_eq!(
            skein_var_compute(std::ptr::null(), Some(count_callback), user),
            SkeinCode::InvalidPtr
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        skein_vecvar_free(vars);
    }
}

fn build_model_bytes() -> Vec<u8> {
    use skein::graph;
    use skein::ops;
    use skein::tensor::{DType, Shape, TensorData};
    use skein::Variable;

    let x = Variable::input(DType::F32, Some(Shape::new(vec![1, 3])));
    x.set_name("x").unwrap();
    let w = Variable::constant(
        TensorData::from_f32(Shape::new(vec![3, 2]), vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap(),
    );
    let y = ops::matmul(&x, &w).unwrap();
    y.set_name("y").unwrap();
    graph::save(std::slice::from_ref(&y)).unwrap()
}

#[test]
fn session_lifecycle_with_resize() {
    let bytes = build_model_bytes();
    let counter = AtomicUsize::new(0);
    let user = &counter as *const AtomicUsize as *mut c_void;
    unsafe {
        let interpreter = skein_interpreter_create_from_buffer(
            bytes.as_ptr(),
            bytes.len(),
            Some(count_callback),
            user,
        );
        assert!(!interpreter.is_null());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let config = SkeinScheduleConfig {
            kind: 0,
            threads: 2,
            backup: 0,
            backend_config: std::ptr::null(),
        };
        let session = skein_interpreter_create_session(interpreter, &config, None, std::ptr::null_mut());
        assert!(!session.is_null());
        assert_eq!(skein_interpreter_session_count(interpreter), 1);

        let name_x = cstr("x");
        let input = skein_interpreter_get_session_input(interpreter, session, name_x.as_ptr());
        assert!(!input.is_null());

        // Resize the leading dimension 1 -> 4 and re-plan.
        let new_dims = [4i32, 3];
        assert_eq!(
            skein_interpreter_resize_tensor(interpreter, input, new_dims.as_ptr(), 2),
            SkeinCode::Ok
        );
        assert_eq!(
            skein_interpreter_resize_session(interpreter, session, None, std::ptr::null_mut()),
            SkeinCode::Ok
        );

        let mut ptr: *mut c_void = std::ptr::null_mut();
        assert_eq!(skein_tensor_map(input, SKEIN_MAP_WRITE, &mut ptr), SkeinCode::Ok);
        let values = std::slice::from_raw_parts_mut(ptr as *mut f32, 12);
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = i as f32;
        }
        assert_eq!(skein_tensor_unmap(input), SkeinCode::Ok);

        assert_eq!(
            skein_interpreter_run_session(interpreter, session, Some(count_callback), user),
            SkeinCode::Ok
        );
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let output = skein_interpreter_get_session_output(interpreter, session, std::ptr::null());
        assert!(!output.is_null());
        // Output leading dimension follows the resized input.
        assert_eq!(skein_tensor_length(output, 0), 4);
        assert_eq!(skein_tensor_length(output, 1), 2);

        let mut names: *mut *mut c_char = std::ptr::null_mut();
        let mut tensors: *mut *mut SkeinTensor = std::ptr::null_mut();
        let mut count = 0usize;
        assert_eq!(
            skein_interpreter_get_session_output_all(
                interpreter,
                session,
                &mut tensors,
                &mut names,
                &mut count
            ),
            SkeinCode::Ok
        );
        assert_eq!(count, 1);
        skein_tensor_array_free(tensors, count);
        skein_string_array_free(names, count);

        assert_eq!(
            skein_interpreter_release_session(interpreter, session, None, std::ptr::null_mut()),
            SkeinCode::Ok
        );
        assert_eq!(skein_interpreter_session_count(interpreter), 0);
        skein_interpreter_destroy(interpreter);
    }
}

#[test]
fn save_bytes_adopt_round_trip() {
    unsafe {
        let value = skein_var_create_scalar(3.5);
        let name = cstr("probe");
        assert_eq!(skein_var_set_name(value, name.as_ptr()), SkeinCode::Ok);

        let vars = skein_vecvar_new();
        assert_eq!(skein_vecvar_push(vars, value), SkeinCode::Ok);

        let mut ptr: *mut u8 = std::ptr::null_mut();
        let mut len = 0usize;
        assert_eq!(skein_var_save_bytes(vars, &mut ptr, &mut len), SkeinCode::Ok);
        assert!(len > 0);

        // Ownership transfer: the buffer moves into the array, no copy,
        // and must not be freed separately afterwards.
        let adopted = skein_vecu8_adopt(ptr, len);
        assert_eq!(skein_vecu8_length(adopted), len);

        let loaded = skein_var_load_vec(adopted);
        assert!(!loaded.is_null());
        assert_eq!(skein_vecvar_length(loaded), 1);
        let reloaded = skein_vecvar_get(loaded, 0);
        let reloaded_name = skein_var_get_name(reloaded);
        assert!(!reloaded_name.is_null());
        assert_eq!(
            std::ffi::CStr::from_ptr(reloaded_name).to_str().unwrap(),
            "probe"
        );
        skein_string_free(reloaded_name);

        let mut out: *const c_void = std::ptr::null();
        assert_eq!(skein_var_read_map(reloaded, &mut out), SkeinCode::Ok);
        assert_eq!(*(out as *const f32), 3.5);
        assert_eq!(skein_var_unmap(reloaded), SkeinCode::Ok);

        skein_var_free(reloaded);
        skein_vecvar_free(loaded);
        skein_vecu8_free(adopted);
        skein_vecvar_free(vars);
        skein_var_free(value);
    }
}

#[test]
fn module_forward_through_the_boundary() {
    unsafe {
        // y = x * w extracted as a module with shared parameter storage.
        let dims = [2i32];
        let x_dims = skein_veci32_from_data(dims.as_ptr(), 1);
        let x = skein_var_create_input(x_dims, 0);
        skein_veci32_free(x_dims);
        let name_x = cstr("x");
        assert_eq!(skein_var_set_name(x, name_x.as_ptr()), SkeinCode::Ok);

        let w_values = [3.0f32, 4.0];
        let w_tensor = skein_tensor_create_with_data(
            dims.as_ptr(),
            1,
            0,
            w_values.as_ptr() as *const c_void,
        );
        let w = skein_var_create_constant(w_tensor);
        skein_tensor_destroy(w_tensor);

        let y = skein_var_mul(x, w);
        let name_y = cstr("y");
        assert_eq!(skein_var_set_name(y, name_y.as_ptr()), SkeinCode::Ok);

        let inputs = skein_vecvar_new();
        assert_eq!(skein_vecvar_push(inputs, x), SkeinCode::Ok);
        let outputs = skein_vecvar_new();
        assert_eq!(skein_vecvar_push(outputs, y), SkeinCode::Ok);

        let module = skein_module_extract(inputs, outputs, true);
        assert!(!module.is_null());
        let clone = skein_module_clone(module, true);
        assert!(!clone.is_null());

        // Mutate the parameter through the original's handle.
        let params = skein_module_parameters(module);
        assert_eq!(skein_vecvar_length(params), 1);
        let param = skein_vecvar_get(params, 0);
        let mut ptr: *mut c_void = std::ptr::null_mut();
        assert_eq!(skein_var_write_map(param, &mut ptr), SkeinCode::Ok);
        std::slice::from_raw_parts_mut(ptr as *mut f32, 2).copy_from_slice(&[10.0, 20.0]);
        assert_eq!(skein_var_unmap(param), SkeinCode::Ok);

        // Forward through the shared clone reflects the mutation.
        let arg_values = [1.0f32, 2.0];
        let arg_tensor = skein_tensor_create_with_data(
            dims.as_ptr(),
            1,
            0,
            arg_values.as_ptr() as *const c_void,
        );
        let arg = skein_var_create_constant(arg_tensor);
        skein_tensor_destroy(arg_tensor);

        let mut out: *mut SkeinVariable = std::ptr::null_mut();
        assert_eq!(
            skein_module_forward(clone, arg, &mut out, None, std::ptr::null_mut()),
            SkeinCode::Ok
        );
        let mut result: *const c_void = std::ptr::null();
        assert_eq!(skein_var_read_map(out, &mut result), SkeinCode::Ok);
        assert_eq!(
            std::slice::from_raw_parts(result as *const f32, 2),
            &[10.0, 40.0]
        );
        assert_eq!(skein_var_unmap(out), SkeinCode::Ok);

        // Input-count mismatch is an error code, not a crash.
        let empty = skein_vecvar_new();
        let mut multi: *mut SkeinVecVar = std::ptr::null_mut();
        assert_eq!(
            skein_module_on_forward(module, empty, &mut multi, None, std::ptr::null_mut()),
            SkeinCode::InvalidArg
        );

        let mut names: *mut *mut c_char = std::ptr::null_mut();
        let mut count = 0usize;
        assert_eq!(
            skein_module_input_names(module, &mut names, &mut count),
            SkeinCode::Ok
        );
        assert_eq!(count, 1);
        skein_string_array_free(names, count);

        skein_vecvar_free(empty);
        skein_var_free(out);
        skein_var_free(arg);
        skein_var_free(param);
        skein_vecvar_free(params);
        skein_module_destroy(clone);
        skein_module_destroy(module);
        skein_vecvar_free(outputs);
        skein_vecvar_free(inputs);
        skein_var_free(y);
        skein_var_free(w);
        skein_var_free(x);
    }
}
