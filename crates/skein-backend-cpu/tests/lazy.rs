//! Lazy-evaluation contract: construction records, forcing computes each
//! node exactly once, eager mode computes at construction.
//!
//! Kept in its own test binary because it asserts on the process-wide
//! compute counter.

use skein::exec;
use skein::graph::{self, Variable};
use skein::ops;
use skein::tensor::{Shape, TensorData};
use skein::{Executor, ScheduleConfig};

fn constant(values: Vec<f32>) -> Variable {
    let len = values.len();
    Variable::constant(TensorData::from_f32(Shape::new(vec![len]), values).unwrap())
}

#[test]
fn lazy_chain_computes_once_per_node() {
    skein_backend_cpu::register();

    // Lazy by default: building a chain performs zero computation.
    let depth = 6;
    let before = graph::compute_count();
    let mut var = constant(vec![1.0, 2.0, 3.0, 4.0]);
    let one = constant(vec![1.0, 1.0, 1.0, 1.0]);
    for _ in 0..depth {
        var = ops::add(&var, &one).unwrap();
    }
    assert_eq!(
        graph::compute_count(),
        before,
        "lazy construction must not compute"
    );

    // Forcing the final variable computes each intermediate exactly once.
    let value = var.read().unwrap();
    assert_eq!(value.as_f32().unwrap(), &[7.0, 8.0, 9.0, 10.0]);
    assert_eq!(graph::compute_count(), before + depth as u64);

    // A second read is served from the memo cache.
    let again = var.read().unwrap();
    assert_eq!(again.as_f32().unwrap(), &[7.0, 8.0, 9.0, 10.0]);
    assert_eq!(graph::compute_count(), before + depth as u64);

    // Forcing an overlapping set recomputes nothing.
    Executor::current().compute(std::slice::from_ref(&var)).unwrap();
    assert_eq!(graph::compute_count(), before + depth as u64);

    // Eager mode computes at construction time.
    {
        let eager = Executor::new(ScheduleConfig::default());
        eager.set_lazy_eval(false);
        let _scope = exec::enter(eager);
        let before_eager = graph::compute_count();
        let sum = ops::add(&constant(vec![1.0]), &constant(vec![2.0])).unwrap();
        assert_eq!(graph::compute_count(), before_eager + 1);
        // Reading an eagerly computed value is free.
        assert_eq!(sum.read().unwrap().as_f32().unwrap(), &[3.0]);
        assert_eq!(graph::compute_count(), before_eager + 1);
    }

    // prepare_compute only ensures shapes/resources, never values.
    let a = constant(vec![1.0, 2.0]);
    let b = constant(vec![3.0, 4.0]);
    let pending = ops::add(&a, &b).unwrap();
    let before_prepare = graph::compute_count();
    Executor::current()
        .prepare_compute(std::slice::from_ref(&pending))
        .unwrap();
    assert_eq!(
        graph::compute_count(),
        before_prepare,
        "prepare must not compute"
    );
    assert_eq!(pending.info().unwrap().shape.dims(), &[2]);
}
