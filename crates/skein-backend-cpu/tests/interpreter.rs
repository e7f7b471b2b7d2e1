//! Interpreter/session lifecycle: compile, resize, run, release, and the
//! unavailable-backend sentinel.

use skein::graph::{self, Variable};
use skein::ops;
use skein::tensor::{DType, Shape, TensorData};
use skein::{BackendKind, Interpreter, ScheduleConfig};

fn setup() {
    skein_backend_cpu::register();
}

/// Serializes y = matmul(x, w) + 0.5 with x as a named [1,3] input.
fn model_bytes() -> Vec<u8> {
    let x = Variable::input(DType::F32, Some(Shape::new(vec![1, 3])));
    x.set_name("x").unwrap();
    let w = Variable::constant(
        TensorData::from_f32(
            Shape::new(vec![3, 2]),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )
        .unwrap(),
    );
    let y = ops::add(&ops::matmul(&x, &w).unwrap(), &Variable::scalar(0.5)).unwrap();
    y.set_name("y").unwrap();
    graph::save(std::slice::from_ref(&y)).unwrap()
}

fn schedule(threads: i32) -> ScheduleConfig {
    ScheduleConfig {
        kind: BackendKind::Cpu,
        threads,
        backup: BackendKind::Cpu,
        config: None,
    }
}

fn write_input(session: &std::sync::Arc<std::sync::Mutex<skein::Session>>, values: Vec<f32>) {
    let mut guard = session.lock().unwrap();
    let rows = values.len() / 3;
    let tensor = guard.input(Some("x")).unwrap();
    let data = TensorData::from_f32(Shape::new(vec![rows, 3]), values).unwrap();
    tensor.write_data(&data).unwrap();
}

fn read_output(session: &std::sync::Arc<std::sync::Mutex<skein::Session>>) -> TensorData {
    let mut guard = session.lock().unwrap();
    guard.output(Some("y")).unwrap().to_data()
}

#[test]
fn run_produces_expected_values() {
    setup();

    let mut interpreter = Interpreter::from_buffer(&model_bytes()).unwrap();
    let session = interpreter.create_session(&schedule(1)).unwrap();

    write_input(&session, vec![1.0, 0.0, 0.0]);
    interpreter.run_session(&session).unwrap();
    let out = read_output(&session);
    assert_eq!(out.shape().dims(), &[1, 2]);
    assert_eq!(out.as_f32().unwrap(), &[1.5, 2.5]);

    // Sessions are repeatable.
    write_input(&session, vec![0.0, 1.0, 0.0]);
    interpreter.run_session(&session).unwrap();
    assert_eq!(read_output(&session).as_f32().unwrap(), &[3.5, 4.5]);

    interpreter.release_session(&session).unwrap();
    assert_eq!(interpreter.session_count(), 0);
}

#[test]
fn thread_counts_do_not_change_results() {
    setup();

    let bytes = model_bytes();
    let mut interpreter = Interpreter::from_buffer(&bytes).unwrap();
    let single = interpreter.create_session(&schedule(1)).unwrap();
    let parallel = interpreter.create_session(&schedule(4)).unwrap();
    assert_eq!(interpreter.session_count(), 2);

    let input: Vec<f32> = (0..3).map(|i| (i as f32).sin()).collect();
    write_input(&single, input.clone());
    write_input(&parallel, input);
    interpreter.run_session(&single).unwrap();
    interpreter.run_session(&parallel).unwrap();

    // Same compiled schedule, different parallelism: bit-identical bytes.
    assert_eq!(read_output(&single).bytes(), read_output(&parallel).bytes());

    interpreter.release_session(&single).unwrap();
    interpreter.release_session(&parallel).unwrap();
}

#[test]
fn resize_session_follows_input_shape() {
    setup();

    let mut interpreter = Interpreter::from_buffer(&model_bytes()).unwrap();
    let session = interpreter.create_session(&schedule(2)).unwrap();

    // Grow the leading dimension from 1 to 4, then re-plan.
    {
        let mut guard = session.lock().unwrap();
        guard.resize_input(Some("x"), vec![4, 3]).unwrap();
    }
    interpreter.resize_session(&session).unwrap();

    write_input(&session, (0..12).map(|i| i as f32).collect());
    interpreter.run_session(&session).unwrap();

    let out = read_output(&session);
    assert_eq!(out.shape().dims(), &[4, 2]);

    interpreter.release_session(&session).unwrap();
}

#[test]
fn unavailable_backend_returns_none() {
    setup();

    let mut interpreter = Interpreter::from_buffer(&model_bytes()).unwrap();
    let config = ScheduleConfig {
        kind: BackendKind::Gpu,
        threads: 1,
        backup: BackendKind::Gpu,
        config: None,
    };
    assert!(interpreter.create_session(&config).is_none());

    // The backup kind is honored when the primary is missing.
    let fallback = ScheduleConfig {
        kind: BackendKind::Gpu,
        threads: 1,
        backup: BackendKind::Cpu,
        config: None,
    };
    let session = interpreter.create_session(&fallback).unwrap();
    interpreter.release_session(&session).unwrap();
}

#[test]
fn release_model_blocks_new_sessions() {
    setup();

    let mut interpreter = Interpreter::from_buffer(&model_bytes()).unwrap();
    let session = interpreter.create_session(&schedule(1)).unwrap();
    interpreter.release_model();

    // Existing sessions keep running; new ones cannot be compiled.
    write_input(&session, vec![1.0, 1.0, 1.0]);
    interpreter.run_session(&session).unwrap();
    assert!(interpreter.create_session(&schedule(1)).is_none());

    interpreter.release_session(&session).unwrap();
    // Releasing a foreign session is an error, not a crash.
    assert!(interpreter.release_session(&session).is_err());
}

#[test]
fn sessions_run_concurrently_on_caller_threads() {
    setup();

    let bytes = model_bytes();
    let mut a = Interpreter::from_buffer(&bytes).unwrap();
    let mut b = Interpreter::from_buffer(&bytes).unwrap();
    let sa = a.create_session(&schedule(1)).unwrap();
    let sb = b.create_session(&schedule(2)).unwrap();

    write_input(&sa, vec![1.0, 2.0, 3.0]);
    write_input(&sb, vec![1.0, 2.0, 3.0]);

    let ta = std::thread::spawn({
        let sa = sa.clone();
        move || sa.lock().unwrap().run()
    });
    let tb = std::thread::spawn({
        let sb = sb.clone();
        move || sb.lock().unwrap().run()
    });
    ta.join().unwrap().unwrap();
    tb.join().unwrap().unwrap();

    assert_eq!(read_output(&sa).bytes(), read_output(&sb).bytes());

    a.release_session(&sa).unwrap();
    b.release_session(&sb).unwrap();
}
