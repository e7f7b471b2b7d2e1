//! End-to-end engine behavior through the CPU backend: value semantics,
//! graph rewrites, serialization equivalence, and cache collection.

use anyhow::Result;
use rand::{Rng, SeedableRng};

use skein::graph::{self, Variable};
use skein::ops;
use skein::tensor::{DType, MapMode, RawTensor, Shape, TensorData};
use skein::{EngineError, Executor};

fn setup() {
    skein_backend_cpu::register();
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn host_tensor_plus_one_round_trip() -> Result<()> {
    setup();

    // Host tensor of shape [1,3,2,2] with a known pattern.
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let shape = Shape::new(vec![1, 3, 2, 2]);
    let pattern: Vec<f32> = (0..12).map(|_| rng.gen_range(-4.0..4.0)).collect();
    let mut tensor = RawTensor::from_host_data(shape.clone(), DType::F32, &f32_bytes(&pattern))?;

    // Wrap as a variable, add a constant-1 of matching shape, read back.
    let wrapped = Variable::constant(tensor.to_data());
    let ones = Variable::constant(TensorData::from_f32(shape.clone(), vec![1.0; 12])?);
    let sum = ops::add(&wrapped, &ones)?;
    let result = sum.read()?;

    for (output, input) in result.as_f32()?.iter().zip(&pattern) {
        assert_eq!(*output, input + 1.0);
    }

    // The original buffer is untouched and still mappable.
    let ptr = tensor.map(MapMode::Read)?;
    assert!(!ptr.is_null());
    tensor.unmap()?;
    Ok(())
}

#[test]
fn replace_rewires_consumers_and_values() {
    setup();

    let weight = Variable::constant(
        TensorData::from_f32(Shape::new(vec![2]), vec![10.0, 20.0]).unwrap(),
    );
    let bias = Variable::constant(TensorData::from_f32(Shape::new(vec![2]), vec![1.0, 1.0]).unwrap());
    let out = ops::add(&weight, &bias).unwrap();
    assert_eq!(out.read().unwrap().as_f32().unwrap(), &[11.0, 21.0]);

    // In-place parameter update: existing handles observe the new value.
    let updated = Variable::constant(
        TensorData::from_f32(Shape::new(vec![2]), vec![100.0, 200.0]).unwrap(),
    );
    Variable::replace(&weight, &updated).unwrap();
    assert_eq!(weight.read().unwrap().as_f32().unwrap(), &[100.0, 200.0]);
    assert_eq!(out.read().unwrap().as_f32().unwrap(), &[101.0, 201.0]);
}

#[test]
fn input_write_invalidates_downstream() {
    setup();

    let input = Variable::input(DType::F32, Some(Shape::new(vec![2])));
    let two = Variable::constant(TensorData::from_f32(Shape::new(vec![2]), vec![2.0, 2.0]).unwrap());
    let doubled = ops::mul(&input, &two).unwrap();

    input
        .write(&TensorData::from_f32(Shape::new(vec![2]), vec![3.0, 4.0]).unwrap())
        .unwrap();
    assert_eq!(doubled.read().unwrap().as_f32().unwrap(), &[6.0, 8.0]);

    input
        .write(&TensorData::from_f32(Shape::new(vec![2]), vec![5.0, 6.0]).unwrap())
        .unwrap();
    assert_eq!(doubled.read().unwrap().as_f32().unwrap(), &[10.0, 12.0]);
}

#[test]
fn write_map_pointer_feeds_the_graph() {
    setup();

    let input = Variable::input(DType::F32, Some(Shape::new(vec![4])));
    let (ptr, len) = input.write_map().unwrap();
    assert_eq!(len, 16);
    unsafe {
        let data = std::slice::from_raw_parts_mut(ptr as *mut f32, 4);
        data.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    }
    input.unmap().unwrap();

    let negated = ops::neg(&input).unwrap();
    assert_eq!(
        negated.read().unwrap().as_f32().unwrap(),
        &[-1.0, -2.0, -3.0, -4.0]
    );
}

#[test]
fn resize_invalidates_downstream_shapes() {
    setup();

    let input = Variable::input(DType::F32, Some(Shape::new(vec![1, 3])));
    let halved = ops::mul(&input, &Variable::scalar(0.5)).unwrap();
    assert_eq!(halved.info().unwrap().shape.dims(), &[1, 3]);

    input.resize(vec![4, 3]).unwrap();
    assert_eq!(halved.info().unwrap().shape.dims(), &[4, 3]);
    assert_eq!(halved.read().unwrap().shape().dims(), &[4, 3]);
}

#[test]
fn save_load_reproduces_values() {
    setup();

    let a = Variable::constant(
        TensorData::from_f32(Shape::new(vec![2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
    );
    let b = Variable::constant(
        TensorData::from_f32(Shape::new(vec![2, 2]), vec![0.5, 0.5, 0.5, 0.5]).unwrap(),
    );
    let product = ops::matmul(&a, &b).unwrap();
    let out = ops::add(&product, &Variable::scalar(1.0)).unwrap();
    out.set_name("result").unwrap();
    let expected = out.read().unwrap();

    let bytes = graph::save(std::slice::from_ref(&out)).unwrap();
    let loaded = graph::load_map(&bytes).unwrap();
    assert_eq!(loaded.len(), 1);
    let (name, reloaded) = &loaded[0];
    assert_eq!(name, "result");

    let replayed = reloaded.read().unwrap();
    assert_eq!(replayed.shape().dims(), expected.shape().dims());
    assert_eq!(replayed.as_f32().unwrap(), expected.as_f32().unwrap());
}

#[test]
fn save_load_file_round_trip() {
    setup();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.skein");

    let value = Variable::constant(
        TensorData::from_f32(Shape::new(vec![3]), vec![7.0, 8.0, 9.0]).unwrap(),
    );
    let out = ops::sqrt(&value).unwrap();
    graph::save_file(std::slice::from_ref(&out), &path).unwrap();

    let loaded = graph::load_file(&path).unwrap();
    assert_eq!(loaded.len(), 1);
    let replayed = loaded[0].read().unwrap();
    assert_eq!(replayed.as_f32().unwrap(), out.read().unwrap().as_f32().unwrap());
}

#[test]
fn gc_keeps_live_values_recomputable() {
    setup();

    let a = Variable::constant(TensorData::from_f32(Shape::new(vec![2]), vec![1.0, 2.0]).unwrap());
    let b = Variable::constant(TensorData::from_f32(Shape::new(vec![2]), vec![3.0, 4.0]).unwrap());
    let mid = ops::add(&a, &b).unwrap();
    let out = ops::mul(&mid, &Variable::scalar(2.0)).unwrap();
    drop(mid);

    assert_eq!(out.read().unwrap().as_f32().unwrap(), &[8.0, 12.0]);

    // Collect cached intermediates; the held output must stay correct.
    Executor::current().gc();
    assert_eq!(out.read().unwrap().as_f32().unwrap(), &[8.0, 12.0]);
}

#[test]
fn mismatched_shapes_are_reported() {
    setup();

    let a = Variable::constant(TensorData::from_f32(Shape::new(vec![2]), vec![1.0, 2.0]).unwrap());
    let b = Variable::constant(
        TensorData::from_f32(Shape::new(vec![3]), vec![1.0, 2.0, 3.0]).unwrap(),
    );
    let sum = ops::add(&a, &b).unwrap();
    assert!(matches!(
        sum.read(),
        Err(EngineError::ShapeMismatch(_))
    ));
}
