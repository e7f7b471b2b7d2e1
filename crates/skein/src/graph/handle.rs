//! Public `Variable` and `Expression` handles over the arena.
//!
//! Handles are reference counted: cloning bumps the arena refcount, drop
//! releases it. A `Variable` denotes one output of an expression through a
//! shared slot, so `replace` can retarget every handle at once.

use super::infer;
use super::node::{ExprNode, HostPayload, OpKind, SlotId, VarInfo, VarTarget};
use super::store::with_store;
use crate::backend::{EngineError, EngineResult};
use crate::exec::Executor;
use crate::tensor::{DType, MapState, Shape, TensorData};

/// Caller-visible reference to one output of a graph node.
pub struct Variable {
    slot: SlotId,
}

impl Clone for Variable {
    fn clone(&self) -> Self {
        with_store(|store| store.slot_ref(self.slot));
        Variable { slot: self.slot }
    }
}

impl Drop for Variable {
    fn drop(&mut self) {
        with_store(|store| store.slot_unref(self.slot));
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.name();
        f.debug_struct("Variable")
            .field("name", &name)
            .finish_non_exhaustive()
    }
}

impl Variable {
    pub(crate) fn from_slot(slot: SlotId) -> Variable {
        Variable { slot }
    }

    pub(crate) fn slot_id(&self) -> SlotId {
        self.slot
    }

    /// Creates a variable holding a baked value.
    pub fn constant(value: TensorData) -> Variable {
        let slot = with_store(|store| {
            let mut node = ExprNode::new(OpKind::Constant, Vec::new(), 1);
            node.payload = Some(HostPayload::from_data(&value));
            node.info = vec![Some(VarInfo {
                shape: value.shape().clone(),
                dtype: value.dtype(),
                order: Default::default(),
            })];
            let id = store.alloc_node(node);
            store
                .new_slot(VarTarget { node: id, output: 0 })
                .expect("freshly allocated node cannot be stale")
        });
        Variable { slot }
    }

    /// Creates a scalar f32 constant.
    pub fn scalar(value: f32) -> Variable {
        let data = TensorData::from_f32(Shape::new(Vec::new()), vec![value])
            .expect("scalar payload always matches its shape");
        Variable::constant(data)
    }

    /// Creates a host-writable input placeholder. The shape may be declared
    /// later through `resize`; until then `info` reports not-available.
    pub fn input(dtype: DType, shape: Option<Shape>) -> Variable {
        let slot = with_store(|store| {
            let mut node = ExprNode::new(
                OpKind::Input {
                    dtype,
                    shape: shape.clone(),
                },
                Vec::new(),
                1,
            );
            if let Some(shape) = shape {
                node.payload = Some(HostPayload::zeroed(dtype, shape.clone()));
                node.info = vec![Some(VarInfo {
                    shape,
                    dtype,
                    order: Default::default(),
                })];
            }
            let id = store.alloc_node(node);
            store
                .new_slot(VarTarget { node: id, output: 0 })
                .expect("freshly allocated node cannot be stale")
        });
        Variable { slot }
    }

    /// Creates a variable denoting one output of an existing expression.
    pub fn from_expr(expr: &Expression, output: usize) -> EngineResult<Variable> {
        let slot = with_store(|store| {
            let node = store.node(expr.id())?;
            if output >= node.output_count {
                return Err(EngineError::InvalidArgument(format!(
                    "output index {output} out of range ({} outputs)",
                    node.output_count
                )));
            }
            store.new_slot(VarTarget {
                node: expr.id(),
                output,
            })
        })?;
        Ok(Variable { slot })
    }

    /// Returns the producing expression and output index.
    pub fn expr(&self) -> EngineResult<(Expression, usize)> {
        let (id, output) = with_store(|store| {
            let target = store.target_of(self.slot)?;
            store.node_handle_ref(target.node);
            Ok::<_, EngineError>((target.node, target.output))
        })?;
        Ok((Expression::from_id(id), output))
    }

    /// Variable name: the producer's per-output name, falling back to the
    /// node name.
    pub fn name(&self) -> Option<String> {
        with_store(|store| {
            let target = store.target_of(self.slot).ok()?;
            let node = store.try_node(target.node)?;
            node.output_names
                .get(target.output)
                .and_then(|n| n.clone())
                .or_else(|| node.name.clone())
        })
    }

    pub fn set_name(&self, name: &str) -> EngineResult<()> {
        with_store(|store| {
            let target = store.target_of(self.slot)?;
            let node = store.node_mut(target.node)?;
            node.output_names[target.output] = Some(name.to_string());
            if node.name.is_none() {
                node.name = Some(name.to_string());
            }
            Ok(())
        })
    }

    /// Shape/dtype/layout metadata, inferred on demand. Returns
    /// [`EngineError::InfoNotAvailable`] when the upstream graph cannot
    /// determine it yet.
    pub fn info(&self) -> EngineResult<VarInfo> {
        with_store(|store| {
            let target = store.target_of(self.slot)?;
            infer::ensure_info(store, target.node, target.output)
        })
    }

    /// Forces evaluation through the current executor and returns the
    /// computed value.
    pub fn read(&self) -> EngineResult<TensorData> {
        Executor::current().compute(std::slice::from_ref(self))?;
        with_store(|store| {
            let target = store.target_of(self.slot)?;
            let node = store.node(target.node)?;
            node.values
                .get(target.output)
                .and_then(|value| value.clone())
                .ok_or(EngineError::InfoNotAvailable)
        })
    }

    /// Overwrites the payload of an `Input`/`Constant` producer and
    /// invalidates everything downstream.
    pub fn write(&self, value: &TensorData) -> EngineResult<()> {
        with_store(|store| {
            let target = store.target_of(self.slot)?;
            let node = store.node_mut(target.node)?;
            if !node.kind.is_leaf() {
                return Err(EngineError::Unsupported(
                    "only input and constant variables accept writes".into(),
                ));
            }
            if let Some(payload) = node.payload.as_ref() {
                if payload.map_state != MapState::Unmapped {
                    return Err(EngineError::MapState("variable is currently mapped"));
                }
                if payload.dtype != value.dtype() {
                    return Err(EngineError::InvalidArgument(format!(
                        "write dtype {:?} does not match declared {:?}",
                        value.dtype(),
                        payload.dtype
                    )));
                }
            }
            node.payload = Some(HostPayload::from_data(value));
            if let OpKind::Input { shape, .. } = &mut node.kind {
                *shape = Some(value.shape().clone());
            }
            node.info = vec![Some(VarInfo {
                shape: value.shape().clone(),
                dtype: value.dtype(),
                order: node.layout,
            })];
            store.invalidate_forward(target.node, true);
            Ok(())
        })
    }

    /// Maps the producer's payload for writing, returning the raw buffer.
    /// The pointer is borrowed: it stays valid until `unmap`, `resize`, or
    /// the variable's release, whichever comes first.
    pub fn write_map(&self) -> EngineResult<(*mut u8, usize)> {
        with_store(|store| {
            let target = store.target_of(self.slot)?;
            let node = store.node_mut(target.node)?;
            if !node.kind.is_leaf() {
                return Err(EngineError::Unsupported(
                    "only input and constant variables are writable".into(),
                ));
            }
            if node.payload.is_none() {
                let (dtype, shape) = match &node.kind {
                    OpKind::Input {
                        dtype,
                        shape: Some(shape),
                    } => (*dtype, shape.clone()),
                    _ => return Err(EngineError::InfoNotAvailable),
                };
                node.payload = Some(HostPayload::zeroed(dtype, shape));
            }
            let payload = node.payload.as_mut().expect("allocated above");
            if payload.map_state != MapState::Unmapped {
                return Err(EngineError::MapState("variable is already mapped"));
            }
            payload.map_state = MapState::MappedWrite;
            let ptr = payload.bytes.as_mut_ptr();
            let len = payload.bytes.len();
            store.invalidate_forward(target.node, true);
            Ok((ptr, len))
        })
    }

    /// Ends a `write_map` mapping.
    pub fn unmap(&self) -> EngineResult<()> {
        with_store(|store| {
            let target = store.target_of(self.slot)?;
            let node = store.node_mut(target.node)?;
            let payload = node
                .payload
                .as_mut()
                .ok_or(EngineError::MapState("variable is not mapped"))?;
            if payload.map_state == MapState::Unmapped {
                log::warn!("unmap called on an unmapped variable");
                return Err(EngineError::MapState("variable is not mapped"));
            }
            payload.map_state = MapState::Unmapped;
            Ok(())
        })
    }

    /// Mutates the declared shape of an `Input`/`Constant` producer,
    /// reallocating its payload and invalidating downstream caches.
    pub fn resize(&self, dims: Vec<usize>) -> EngineResult<()> {
        with_store(|store| {
            let target = store.target_of(self.slot)?;
            let node = store.node_mut(target.node)?;
            if !node.kind.is_leaf() {
                return Err(EngineError::Unsupported(
                    "only input and constant variables can be resized".into(),
                ));
            }
            if let Some(payload) = node.payload.as_ref() {
                if payload.map_state != MapState::Unmapped {
                    return Err(EngineError::MapState("cannot resize a mapped variable"));
                }
            }
            let shape = Shape::new(dims);
            let dtype = match &mut node.kind {
                OpKind::Input {
                    dtype,
                    shape: declared,
                } => {
                    *declared = Some(shape.clone());
                    *dtype
                }
                OpKind::Constant => node
                    .payload
                    .as_ref()
                    .map(|p| p.dtype)
                    .unwrap_or(DType::F32),
                _ => unreachable!("leaf check above"),
            };
            node.payload = Some(HostPayload::zeroed(dtype, shape.clone()));
            node.info = vec![Some(VarInfo {
                shape,
                dtype,
                order: node.layout,
            })];
            store.invalidate_forward(target.node, true);
            Ok(())
        })
    }

    /// Rewires every handle that denoted `dst` to observe `src`'s value,
    /// in place. Existing `Variable` handles stay valid and transparently
    /// read the new producer.
    pub fn replace(dst: &Variable, src: &Variable) -> EngineResult<()> {
        with_store(|store| store.replace_slot(dst.slot, src.slot))
    }

    /// Number of live consumer edges attached to this variable.
    pub fn link_number(&self) -> usize {
        with_store(|store| {
            let Ok(slot) = store.slot(self.slot) else {
                return 0;
            };
            slot.consumers
                .iter()
                .filter(|id| store.try_node(**id).is_some())
                .count()
        })
    }

    /// Snapshot of the expressions currently consuming this variable.
    pub fn consumers(&self) -> Vec<Expression> {
        let ids = with_store(|store| {
            let Ok(slot) = store.slot(self.slot) else {
                return Vec::new();
            };
            let ids: Vec<_> = slot
                .consumers
                .iter()
                .copied()
                .filter(|id| store.try_node(*id).is_some())
                .collect();
            for id in &ids {
                store.node_handle_ref(*id);
            }
            ids
        });
        ids.into_iter().map(Expression::from_id).collect()
    }
}

/// Caller-visible handle to a whole expression node.
pub struct Expression {
    id: super::node::ExprId,
}

impl Clone for Expression {
    fn clone(&self) -> Self {
        with_store(|store| store.node_handle_ref(self.id));
        Expression { id: self.id }
    }
}

impl Drop for Expression {
    fn drop(&mut self) {
        with_store(|store| store.node_handle_unref(self.id));
    }
}

impl Expression {
    pub(crate) fn from_id(id: super::node::ExprId) -> Expression {
        Expression { id }
    }

    pub(crate) fn id(&self) -> super::node::ExprId {
        self.id
    }

    /// Records a new expression applying `kind` to `inputs`. In an eager
    /// executor context the node is computed immediately; in a lazy one
    /// only the graph is extended.
    pub fn create(
        kind: OpKind,
        inputs: &[Variable],
        output_count: usize,
    ) -> EngineResult<Expression> {
        if kind.is_leaf() {
            return Err(EngineError::InvalidArgument(
                "leaf nodes are created through Variable::constant/input".into(),
            ));
        }
        let id = with_store(|store| {
            let slots: Vec<SlotId> = inputs.iter().map(|v| v.slot_id()).collect();
            let node = ExprNode::new(kind, slots, output_count);
            let id = store.create_expr(node)?;
            store.node_handle_ref(id);
            Ok::<_, EngineError>(id)
        })?;
        let expr = Expression { id };

        let executor = Executor::current();
        if !executor.lazy_eval() {
            executor.compute_nodes(&[id])?;
        }
        Ok(expr)
    }

    /// Returns a variable denoting one output.
    pub fn output(&self, index: usize) -> EngineResult<Variable> {
        Variable::from_expr(self, index)
    }

    pub fn output_size(&self) -> EngineResult<usize> {
        with_store(|store| Ok(store.node(self.id)?.output_count))
    }

    /// Clones handles to the expression's input variables.
    pub fn inputs(&self) -> EngineResult<Vec<Variable>> {
        let slots = with_store(|store| {
            let node = store.node(self.id)?;
            let slots = node.inputs.clone();
            for slot in &slots {
                store.slot_ref(*slot);
            }
            Ok::<_, EngineError>(slots)
        })?;
        Ok(slots.into_iter().map(Variable::from_slot).collect())
    }

    pub fn name(&self) -> Option<String> {
        with_store(|store| store.try_node(self.id).and_then(|node| node.name.clone()))
    }

    pub fn set_name(&self, name: &str) -> EngineResult<()> {
        with_store(|store| {
            store.node_mut(self.id)?.name = Some(name.to_string());
            Ok(())
        })
    }

    pub fn output_name(&self, index: usize) -> EngineResult<Option<String>> {
        with_store(|store| {
            let node = store.node(self.id)?;
            node.output_names
                .get(index)
                .cloned()
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!("output index {index} out of range"))
                })
        })
    }

    /// Attempts to infer metadata for every output; false when the graph
    /// cannot determine it yet.
    pub fn require_info(&self) -> bool {
        with_store(|store| {
            (0..store.node(self.id).map(|n| n.output_count).unwrap_or(0))
                .all(|i| infer::ensure_info(store, self.id, i).is_ok())
        })
    }

    /// Metadata of one output.
    pub fn output_info(&self, index: usize) -> EngineResult<VarInfo> {
        with_store(|store| infer::ensure_info(store, self.id, index))
    }

    pub fn kind(&self) -> EngineResult<OpKind> {
        with_store(|store| Ok(store.node(self.id)?.kind.clone()))
    }
}
