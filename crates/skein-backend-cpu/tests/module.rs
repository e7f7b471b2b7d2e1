//! Module lifecycle: extraction, loading by name, forwarding, and clones
//! with shared or copied parameter storage.

use skein::graph::{self, Variable};
use skein::module::{Module, ModuleConfig};
use skein::ops;
use skein::tensor::{DType, Shape, TensorData};
use skein::EngineError;

fn setup() {
    skein_backend_cpu::register();
}

fn values(dims: Vec<usize>, data: Vec<f32>) -> TensorData {
    TensorData::from_f32(Shape::new(dims), data).unwrap()
}

/// y = x * w, with w as trainable parameter storage.
fn scaling_module() -> Module {
    let x = Variable::input(DType::F32, Some(Shape::new(vec![2])));
    x.set_name("x").unwrap();
    let w = Variable::constant(values(vec![2], vec![3.0, 3.0]));
    w.set_name("w").unwrap();
    let y = ops::mul(&x, &w).unwrap();
    y.set_name("y").unwrap();
    Module::extract(&[x], &[y], true).unwrap()
}

#[test]
fn forward_splices_the_subgraph() {
    setup();

    let module = scaling_module();
    let input = Variable::constant(values(vec![2], vec![1.0, 2.0]));
    let output = module.forward(&input).unwrap();
    assert_eq!(output.read().unwrap().as_f32().unwrap(), &[3.0, 6.0]);

    // Forwarding twice builds independent splices.
    let other = Variable::constant(values(vec![2], vec![10.0, 20.0]));
    let second = module.forward(&other).unwrap();
    assert_eq!(second.read().unwrap().as_f32().unwrap(), &[30.0, 60.0]);
}

#[test]
fn input_count_mismatch_is_invalid_argument() {
    setup();

    let module = scaling_module();
    let a = Variable::constant(values(vec![2], vec![1.0, 1.0]));
    let b = Variable::constant(values(vec![2], vec![2.0, 2.0]));
    let result = module.on_forward(&[a, b]);
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[test]
fn shared_clone_sees_parameter_mutation() {
    setup();

    let original = scaling_module();
    let shared = original.clone_module(true).unwrap();

    // Mutate the parameter through the original's handle.
    let params = original.parameters();
    assert_eq!(params.len(), 1);
    params[0].write(&values(vec![2], vec![5.0, 7.0])).unwrap();

    // Forwarding through the shared clone reflects the mutation.
    let input = Variable::constant(values(vec![2], vec![1.0, 1.0]));
    let output = shared.forward(&input).unwrap();
    assert_eq!(output.read().unwrap().as_f32().unwrap(), &[5.0, 7.0]);
}

#[test]
fn deep_clone_copies_parameter_storage() {
    setup();

    let original = scaling_module();
    let detached = original.clone_module(false).unwrap();

    original.parameters()[0]
        .write(&values(vec![2], vec![100.0, 100.0]))
        .unwrap();

    let input = Variable::constant(values(vec![2], vec![1.0, 1.0]));
    let output = detached.forward(&input).unwrap();
    assert_eq!(output.read().unwrap().as_f32().unwrap(), &[3.0, 3.0]);
}

#[test]
fn load_restricted_to_declared_names() {
    setup();

    // Serialize a graph with a named input and output.
    let x = Variable::input(DType::F32, Some(Shape::new(vec![2])));
    x.set_name("x").unwrap();
    let w = Variable::constant(values(vec![2], vec![4.0, 4.0]));
    let y = ops::mul(&x, &w).unwrap();
    y.set_name("y").unwrap();
    let bytes = graph::save(std::slice::from_ref(&y)).unwrap();

    let module = Module::load(
        &bytes,
        &["x".to_string()],
        &["y".to_string()],
        ModuleConfig::default(),
    )
    .unwrap();

    let info = module.info();
    assert_eq!(info.input_names, vec!["x"]);
    assert_eq!(info.output_names, vec!["y"]);
    assert_eq!(
        info.inputs[0].as_ref().map(|i| i.shape.dims().to_vec()),
        Some(vec![2])
    );

    let input = Variable::constant(values(vec![2], vec![2.0, 3.0]));
    let output = module.forward(&input).unwrap();
    assert_eq!(output.read().unwrap().as_f32().unwrap(), &[8.0, 12.0]);

    // Unknown names are invalid arguments, not crashes.
    let missing = Module::load(
        &bytes,
        &["x".to_string()],
        &["nope".to_string()],
        ModuleConfig::default(),
    );
    assert!(matches!(missing, Err(EngineError::InvalidArgument(_))));
}

#[test]
fn load_parameters_updates_shared_storage() {
    setup();

    let module = scaling_module();
    let clone = module.clone_module(true).unwrap();
    module
        .load_parameters(&[values(vec![2], vec![9.0, 9.0])])
        .unwrap();

    let input = Variable::constant(values(vec![2], vec![1.0, 2.0]));
    let output = clone.forward(&input).unwrap();
    assert_eq!(output.read().unwrap().as_f32().unwrap(), &[9.0, 18.0]);

    // Count mismatch leaves parameters untouched.
    assert!(matches!(
        module.load_parameters(&[]),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn training_flag_round_trips() {
    setup();

    let mut module = scaling_module();
    assert!(!module.is_training());
    module.set_is_training(true);
    assert!(module.is_training());
    module.set_name("scaler");
    assert_eq!(module.name(), Some("scaler"));
}
