//! Memoized, topological evaluation of pending graph nodes.
//!
//! Forcing a set of targets computes every reachable pending node exactly
//! once: results are stored back on the nodes, so a later forcing of an
//! overlapping subgraph reuses them.

use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::{Backend, EngineError, EngineResult};
use crate::graph::infer;
use crate::graph::node::ExprId;
use crate::graph::store::{with_store, GraphStore};

/// Forces the given nodes (every output) to a computed value. `backend` may
/// be absent as long as nothing actually needs computing.
pub(crate) fn compute_nodes(
    backend: Option<&Arc<dyn Backend>>,
    threads: usize,
    roots: &[ExprId],
) -> EngineResult<()> {
    with_store(|store| {
        let order = pending_post_order(store, roots)?;
        for id in order {
            compute_one(store, backend, threads, id)?;
        }
        Ok(())
    })
}

/// Ensures backend resources (inferred metadata) exist for the targets
/// without computing any value.
pub(crate) fn prepare_nodes(roots: &[ExprId]) -> EngineResult<()> {
    with_store(|store| {
        for id in roots {
            let outputs = store.node(*id)?.output_count;
            for output in 0..outputs {
                infer::ensure_info(store, *id, output)?;
            }
        }
        Ok(())
    })
}

/// Post-order over nodes that still need a value, rooted at `roots`.
fn pending_post_order(store: &GraphStore, roots: &[ExprId]) -> EngineResult<Vec<ExprId>> {
    let mut order = Vec::new();
    let mut done: HashSet<u32> = HashSet::new();
    let mut on_stack: HashSet<u32> = HashSet::new();

    for root in roots {
        // (node, next child index) frames; explicit stack keeps deep
        // chains off the call stack.
        let mut frames: Vec<(ExprId, usize)> = vec![(*root, 0)];
        while let Some((id, child)) = frames.pop() {
            if done.contains(&id.index) {
                continue;
            }
            let node = store.node(id)?;
            if node.values.iter().all(|v| v.is_some()) {
                done.insert(id.index);
                continue;
            }
            if child == 0 && !on_stack.insert(id.index) {
                return Err(EngineError::Unsupported(
                    "expression graph contains a cycle".into(),
                ));
            }
            if child < node.inputs.len() {
                let slot = node.inputs[child];
                frames.push((id, child + 1));
                let target = store.target_of(slot)?;
                if !done.contains(&target.node.index) {
                    frames.push((target.node, 0));
                }
            } else {
                on_stack.remove(&id.index);
                done.insert(id.index);
                order.push(id);
            }
        }
    }
    Ok(order)
}

fn compute_one(
    store: &mut GraphStore,
    backend: Option<&Arc<dyn Backend>>,
    threads: usize,
    id: ExprId,
) -> EngineResult<()> {
    {
        let node = store.node(id)?;
        if node.values.iter().all(|v| v.is_some()) {
            return Ok(());
        }
    }

    let (kind, inputs) = {
        let node = store.node(id)?;
        (node.kind.clone(), node.inputs.clone())
    };

    if kind.is_leaf() {
        let node = store.node_mut(id)?;
        let payload = node
            .payload
            .as_ref()
            .ok_or(EngineError::InfoNotAvailable)?;
        if payload.map_state != crate::tensor::MapState::Unmapped {
            return Err(EngineError::MapState(
                "cannot read a variable while it is mapped",
            ));
        }
        node.values[0] = Some(payload.snapshot());
        return Ok(());
    }

    let mut input_values = Vec::with_capacity(inputs.len());
    for slot in &inputs {
        let target = store.target_of(*slot)?;
        let producer = store.node(target.node)?;
        let value = producer
            .values
            .get(target.output)
            .and_then(|v| v.clone())
            .ok_or_else(|| {
                EngineError::InvalidArgument("dependency value missing during evaluation".into())
            })?;
        input_values.push(value);
    }

    let backend = backend.ok_or_else(|| {
        EngineError::BackendUnavailable("no backend registered for computation".into())
    })?;
    let outputs = backend.execute(&kind, &input_values, threads)?;
    store.note_compute();

    let node = store.node_mut(id)?;
    if outputs.len() != node.output_count {
        return Err(EngineError::InvalidArgument(format!(
            "{} produced {} outputs, {} declared",
            kind.op_name(),
            outputs.len(),
            node.output_count
        )));
    }
    for (slot, value) in node.values.iter_mut().zip(outputs.into_iter()) {
        *slot = Some(value);
    }
    Ok(())
}
