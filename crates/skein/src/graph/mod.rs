//! The Variable/Expression computation graph.

mod handle;
pub(crate) mod infer;
pub(crate) mod node;
pub mod serial;
pub(crate) mod store;

pub use handle::{Expression, Variable};
pub use infer::infer_op;
pub use node::{BinaryOp, LayoutOrder, OpKind, ReduceOp, UnaryOp, VarInfo};
pub use serial::{load, load_file, load_map, save, save_file, GraphProto, FORMAT_TAG};
pub use store::{compute_count, live_node_count, live_slot_count};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, Shape, TensorData};
    use std::sync::{Mutex, MutexGuard};

    /// The arena and its counters are process-global; tests that assert on
    /// them must not interleave.
    fn arena_lock() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn constant(values: Vec<f32>, dims: Vec<usize>) -> Variable {
        Variable::constant(TensorData::from_f32(Shape::new(dims), values).unwrap())
    }

    #[test]
    fn handles_refcount_the_arena() {
        let _serial = arena_lock();
        let nodes_before = live_node_count();
        let a = constant(vec![1.0, 2.0], vec![2]);
        let b = a.clone();
        assert_eq!(live_node_count(), nodes_before + 1);
        drop(a);
        assert_eq!(live_node_count(), nodes_before + 1);
        drop(b);
        assert_eq!(live_node_count(), nodes_before);
    }

    #[test]
    fn consumer_edges_keep_inputs_alive() {
        let _serial = arena_lock();
        let nodes_before = live_node_count();
        let a = constant(vec![1.0], vec![1]);
        let b = constant(vec![2.0], vec![1]);
        let expr =
            Expression::create(OpKind::Binary(BinaryOp::Add), &[a.clone(), b.clone()], 1).unwrap();
        let sum = expr.output(0).unwrap();
        drop(expr);
        drop(a);
        drop(b);
        // The sum still owns its operands through input edges.
        assert_eq!(live_node_count(), nodes_before + 3);
        drop(sum);
        assert_eq!(live_node_count(), nodes_before);
    }

    #[test]
    fn consumer_back_references_do_not_extend_lifetimes() {
        let a = constant(vec![1.0], vec![1]);
        let expr = Expression::create(OpKind::Unary(UnaryOp::Neg), &[a.clone()], 1).unwrap();
        let neg = expr.output(0).unwrap();
        assert_eq!(a.link_number(), 1);
        drop(neg);
        drop(expr);
        // The consumer died; its back-edge must be gone, not dangling.
        assert_eq!(a.link_number(), 0);
        assert!(a.consumers().is_empty());
    }

    #[test]
    fn expression_handles_keep_nodes_alive() {
        let a = constant(vec![1.0], vec![1]);
        let (expr, index) = a.expr().unwrap();
        assert_eq!(index, 0);
        let expr_clone = expr.clone();
        drop(a);
        drop(expr);
        // The remaining expression handle still owns the node.
        let revived = expr_clone.output(0).unwrap();
        assert_eq!(revived.read().unwrap().as_f32().unwrap(), &[1.0]);
        drop(revived);
        drop(expr_clone);
    }

    #[test]
    fn info_reports_not_available_for_undeclared_input() {
        let input = Variable::input(DType::F32, None);
        assert!(matches!(
            input.info(),
            Err(crate::backend::EngineError::InfoNotAvailable)
        ));
        input.resize(vec![2, 2]).unwrap();
        let info = input.info().unwrap();
        assert_eq!(info.shape.dims(), &[2, 2]);
    }

    #[test]
    fn replace_redirects_existing_handles() {
        let a = constant(vec![1.0, 1.0], vec![2]);
        let b = constant(vec![5.0, 6.0], vec![2]);
        let held = a.clone();
        Variable::replace(&a, &b).unwrap();
        let value = held.read().unwrap();
        assert_eq!(value.as_f32().unwrap(), &[5.0, 6.0]);
    }

    #[test]
    fn write_map_requires_pairing() {
        let input = Variable::input(DType::F32, Some(Shape::new(vec![2])));
        let (ptr, len) = input.write_map().unwrap();
        assert_eq!(len, 8);
        assert!(!ptr.is_null());
        assert!(input.write_map().is_err());
        input.unmap().unwrap();
        assert!(input.unmap().is_err());
    }

    #[test]
    fn save_load_round_trip_preserves_structure() {
        let a = constant(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let expr = Expression::create(OpKind::Unary(UnaryOp::Neg), &[a], 1).unwrap();
        let out = expr.output(0).unwrap();
        out.set_name("probe").unwrap();

        let bytes = save(std::slice::from_ref(&out)).unwrap();
        let loaded = load_map(&bytes).unwrap();
        assert_eq!(loaded.len(), 1);
        let (name, var) = &loaded[0];
        assert_eq!(name, "probe");
        let info = var.info().unwrap();
        assert_eq!(info.shape.dims(), &[2, 2]);
        assert_eq!(info.dtype, DType::F32);
    }

    #[test]
    fn save_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.skein");

        let value = constant(vec![4.0, 9.0], vec![2]);
        value.set_name("weights").unwrap();
        save_file(std::slice::from_ref(&value), &path).unwrap();

        let loaded = load_file(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name().as_deref(), Some("weights"));
        assert_eq!(loaded[0].read().unwrap().as_f32().unwrap(), &[4.0, 9.0]);
    }

    #[test]
    fn load_rejects_wrong_version() {
        let err = load(b"not a graph");
        assert!(err.is_err());
    }
}
