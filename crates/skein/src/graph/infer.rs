//! Shape and dtype inference for graph operations.
//!
//! `infer_op` is a pure function over input metadata so the arena's lazy
//! info pass and the session compiler share one set of rules. A leaf whose
//! shape is still undeclared yields [`EngineError::InfoNotAvailable`]
//! rather than a fabricated shape.

use std::collections::HashSet;

use super::node::{ExprId, OpKind, VarInfo};
use super::store::GraphStore;
use crate::backend::{EngineError, EngineResult};
use crate::tensor::Shape;

/// Infers the per-output metadata of one operation from its input
/// metadata.
pub fn infer_op(kind: &OpKind, inputs: &[VarInfo]) -> EngineResult<Vec<VarInfo>> {
    match kind {
        OpKind::Input { dtype, shape } => {
            let shape = shape.clone().ok_or(EngineError::InfoNotAvailable)?;
            Ok(vec![VarInfo {
                shape,
                dtype: *dtype,
                order: Default::default(),
            }])
        }
        // Constant info comes from the payload; the arena fills it in
        // before calling here, so reaching this arm is a wiring bug.
        OpKind::Constant => Err(EngineError::InfoNotAvailable),
        OpKind::Unary(_) => {
            let input = expect_inputs(kind, inputs, 1)?;
            Ok(vec![input[0].clone()])
        }
        OpKind::Binary(_) => {
            let input = expect_inputs(kind, inputs, 2)?;
            let (lhs, rhs) = (&input[0], &input[1]);
            if lhs.dtype != rhs.dtype {
                return Err(EngineError::ShapeMismatch(format!(
                    "binary operands disagree on dtype: {:?} vs {:?}",
                    lhs.dtype, rhs.dtype
                )));
            }
            let shape = broadcast_binary(&lhs.shape, &rhs.shape)?;
            Ok(vec![VarInfo {
                shape,
                dtype: lhs.dtype,
                order: lhs.order,
            }])
        }
        OpKind::Reduce { axes, keep_dims, .. } => {
            let input = expect_inputs(kind, inputs, 1)?;
            let src = &input[0];
            let rank = src.shape.rank();
            let mut reduced: HashSet<usize> = HashSet::new();
            for axis in axes {
                if *axis >= rank {
                    return Err(EngineError::InvalidArgument(format!(
                        "reduce axis {axis} out of range for rank {rank}"
                    )));
                }
                reduced.insert(*axis);
            }
            let mut dims = Vec::new();
            for (axis, dim) in src.shape.dims().iter().enumerate() {
                if reduced.is_empty() || reduced.contains(&axis) {
                    if *keep_dims {
                        dims.push(1);
                    }
                } else {
                    dims.push(*dim);
                }
            }
            Ok(vec![VarInfo {
                shape: Shape::new(dims),
                dtype: src.dtype,
                order: src.order,
            }])
        }
        OpKind::MatMul {
            transpose_a,
            transpose_b,
        } => {
            let input = expect_inputs(kind, inputs, 2)?;
            let (lhs, rhs) = (&input[0], &input[1]);
            if lhs.shape.rank() != 2 || rhs.shape.rank() != 2 {
                return Err(EngineError::Unsupported(
                    "matmul expects rank-2 operands".into(),
                ));
            }
            let (m, ka) = dims2(&lhs.shape, *transpose_a);
            let (kb, n) = dims2(&rhs.shape, *transpose_b);
            if ka != kb {
                return Err(EngineError::ShapeMismatch(format!(
                    "matmul contraction mismatch: {ka} vs {kb}"
                )));
            }
            Ok(vec![VarInfo {
                shape: Shape::new(vec![m, n]),
                dtype: lhs.dtype,
                order: lhs.order,
            }])
        }
        OpKind::Reshape { dims } => {
            let input = expect_inputs(kind, inputs, 1)?;
            let src = &input[0];
            let total = src.shape.num_elements();
            let mut known = 1usize;
            let mut infer_at = None;
            for (i, dim) in dims.iter().enumerate() {
                match *dim {
                    -1 => {
                        if infer_at.is_some() {
                            return Err(EngineError::InvalidArgument(
                                "reshape allows at most one inferred dimension".into(),
                            ));
                        }
                        infer_at = Some(i);
                    }
                    d if d >= 0 => known = known.saturating_mul(d as usize),
                    d => {
                        return Err(EngineError::InvalidArgument(format!(
                            "reshape dimension {d} is negative"
                        )))
                    }
                }
            }
            let mut out: Vec<usize> = dims
                .iter()
                .map(|d| if *d < 0 { 0 } else { *d as usize })
                .collect();
            if let Some(i) = infer_at {
                if known == 0 || total % known != 0 {
                    return Err(EngineError::ShapeMismatch(format!(
                        "cannot infer reshape dimension: {total} elements over {known}"
                    )));
                }
                out[i] = total / known;
            } else if known != total {
                return Err(EngineError::ShapeMismatch(format!(
                    "reshape to {:?} changes element count ({known} vs {total})",
                    dims
                )));
            }
            Ok(vec![VarInfo {
                shape: Shape::new(out),
                dtype: src.dtype,
                order: src.order,
            }])
        }
        OpKind::Transpose { perm } => {
            let input = expect_inputs(kind, inputs, 1)?;
            let src = &input[0];
            let rank = src.shape.rank();
            if perm.len() != rank {
                return Err(EngineError::InvalidArgument(format!(
                    "transpose permutation length {} does not match rank {rank}",
                    perm.len()
                )));
            }
            let mut seen = vec![false; rank];
            let mut dims = Vec::with_capacity(rank);
            for axis in perm {
                if *axis >= rank || seen[*axis] {
                    return Err(EngineError::InvalidArgument(
                        "transpose permutation is not a permutation".into(),
                    ));
                }
                seen[*axis] = true;
                dims.push(src.shape.dims()[*axis]);
            }
            Ok(vec![VarInfo {
                shape: Shape::new(dims),
                dtype: src.dtype,
                order: src.order,
            }])
        }
        OpKind::BroadcastTo { dims } => {
            let input = expect_inputs(kind, inputs, 1)?;
            let src = &input[0];
            let src_dims = src.shape.dims();
            if src_dims.len() > dims.len() {
                return Err(EngineError::ShapeMismatch(format!(
                    "cannot broadcast rank {} to rank {}",
                    src_dims.len(),
                    dims.len()
                )));
            }
            let offset = dims.len() - src_dims.len();
            for (i, dim) in src_dims.iter().enumerate() {
                if *dim != 1 && *dim != dims[offset + i] {
                    return Err(EngineError::ShapeMismatch(format!(
                        "cannot broadcast {:?} to {:?}",
                        src_dims, dims
                    )));
                }
            }
            Ok(vec![VarInfo {
                shape: Shape::new(dims.clone()),
                dtype: src.dtype,
                order: src.order,
            }])
        }
        OpKind::Concat { axis } => {
            if inputs.is_empty() {
                return Err(EngineError::InvalidArgument(
                    "concat needs at least one input".into(),
                ));
            }
            let first = &inputs[0];
            let rank = first.shape.rank();
            if *axis >= rank {
                return Err(EngineError::InvalidArgument(format!(
                    "concat axis {axis} out of range for rank {rank}"
                )));
            }
            let mut dims = first.shape.dims().to_vec();
            for other in &inputs[1..] {
                if other.dtype != first.dtype || other.shape.rank() != rank {
                    return Err(EngineError::ShapeMismatch(
                        "concat inputs disagree on dtype or rank".into(),
                    ));
                }
                for (i, dim) in other.shape.dims().iter().enumerate() {
                    if i == *axis {
                        dims[i] += dim;
                    } else if *dim != dims[i] {
                        return Err(EngineError::ShapeMismatch(format!(
                            "concat inputs disagree on axis {i}"
                        )));
                    }
                }
            }
            Ok(vec![VarInfo {
                shape: Shape::new(dims),
                dtype: first.dtype,
                order: first.order,
            }])
        }
        OpKind::Slice { starts, sizes } => {
            let input = expect_inputs(kind, inputs, 1)?;
            let src = &input[0];
            let rank = src.shape.rank();
            if starts.len() != rank || sizes.len() != rank {
                return Err(EngineError::InvalidArgument(format!(
                    "slice starts/sizes must have rank {rank}"
                )));
            }
            for axis in 0..rank {
                if starts[axis] + sizes[axis] > src.shape.dims()[axis] {
                    return Err(EngineError::ShapeMismatch(format!(
                        "slice exceeds extent on axis {axis}"
                    )));
                }
            }
            Ok(vec![VarInfo {
                shape: Shape::new(sizes.clone()),
                dtype: src.dtype,
                order: src.order,
            }])
        }
        OpKind::Cast { dtype } => {
            let input = expect_inputs(kind, inputs, 1)?;
            Ok(vec![VarInfo {
                shape: input[0].shape.clone(),
                dtype: *dtype,
                order: input[0].order,
            }])
        }
    }
}

fn expect_inputs<'a>(
    kind: &OpKind,
    inputs: &'a [VarInfo],
    count: usize,
) -> EngineResult<&'a [VarInfo]> {
    if inputs.len() != count {
        return Err(EngineError::InvalidArgument(format!(
            "{} expects {count} inputs, got {}",
            kind.op_name(),
            inputs.len()
        )));
    }
    Ok(inputs)
}

fn dims2(shape: &Shape, transpose: bool) -> (usize, usize) {
    let dims = shape.dims();
    if transpose {
        (dims[1], dims[0])
    } else {
        (dims[0], dims[1])
    }
}

/// Elementwise broadcast rule: equal shapes, or one operand is a
/// one-element scalar.
pub fn broadcast_binary(lhs: &Shape, rhs: &Shape) -> EngineResult<Shape> {
    if lhs.dims() == rhs.dims() {
        return Ok(lhs.clone());
    }
    if rhs.num_elements() == 1 {
        return Ok(lhs.clone());
    }
    if lhs.num_elements() == 1 {
        return Ok(rhs.clone());
    }
    Err(EngineError::ShapeMismatch(format!(
        "binary operands {:?} and {:?} do not broadcast",
        lhs.dims(),
        rhs.dims()
    )))
}

/// Ensures `node`'s output metadata is inferred, walking ancestors as
/// needed, and returns the info for one output.
pub(crate) fn ensure_info(
    store: &mut GraphStore,
    node: ExprId,
    output: usize,
) -> EngineResult<VarInfo> {
    ensure_node_info(store, node, &mut HashSet::new())?;
    let node_ref = store.node(node)?;
    node_ref
        .info
        .get(output)
        .and_then(|info| info.clone())
        .ok_or(EngineError::InfoNotAvailable)
}

fn ensure_node_info(
    store: &mut GraphStore,
    id: ExprId,
    visiting: &mut HashSet<u32>,
) -> EngineResult<()> {
    {
        let node = store.node(id)?;
        if node.info.iter().all(|info| info.is_some()) {
            return Ok(());
        }
        if !visiting.insert(id.index) {
            return Err(EngineError::Unsupported(
                "expression graph contains a cycle".into(),
            ));
        }
    }

    let (kind, inputs, layout) = {
        let node = store.node(id)?;
        (node.kind.clone(), node.inputs.clone(), node.layout)
    };

    let infos = if let OpKind::Constant = kind {
        let node = store.node(id)?;
        let payload = node.payload.as_ref().ok_or(EngineError::InfoNotAvailable)?;
        vec![VarInfo {
            shape: payload.shape.clone(),
            dtype: payload.dtype,
            order: layout,
        }]
    } else {
        let mut input_infos = Vec::with_capacity(inputs.len());
        for slot in &inputs {
            let target = store.target_of(*slot)?;
            ensure_node_info(store, target.node, visiting)?;
            let producer = store.node(target.node)?;
            let info = producer
                .info
                .get(target.output)
                .and_then(|info| info.clone())
                .ok_or(EngineError::InfoNotAvailable)?;
            input_infos.push(info);
        }
        let mut infos = infer_op(&kind, &input_infos)?;
        for info in infos.iter_mut() {
            info.order = layout;
        }
        infos
    };

    visiting.remove(&id.index);
    let node = store.node_mut(id)?;
    if infos.len() != node.output_count {
        return Err(EngineError::InvalidArgument(format!(
            "{} produced {} outputs, {} declared",
            node.kind.op_name(),
            infos.len(),
            node.output_count
        )));
    }
    for (slot, info) in node.info.iter_mut().zip(infos.into_iter()) {
        *slot = Some(info);
    }
    Ok(())
}
