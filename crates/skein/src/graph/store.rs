//! The expression arena: generation-checked node and slot storage,
//! refcounted liveness, weak consumer back-edges, memoization, and cache
//! invalidation.
//!
//! Ownership model: a `Variable` handle references a slot; a slot
//! references the node currently producing its value; a node references
//! its input slots. Consumer back-edges (slot -> consuming nodes) are bare
//! ids and never keep anything alive — a stale id is skipped on lookup.

use std::collections::HashSet;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use super::node::{ExprId, ExprNode, SlotId, VarSlot, VarTarget};
use crate::backend::{EngineError, EngineResult};

struct NodeEntry {
    node: Option<ExprNode>,
    generation: u32,
}

struct SlotEntry {
    slot: Option<VarSlot>,
    generation: u32,
}

/// Process-wide expression arena. All mutation happens under one mutex;
/// public handles lock per call and never hold the guard across user code.
pub(crate) struct GraphStore {
    nodes: Vec<NodeEntry>,
    free_nodes: Vec<u32>,
    slots: Vec<SlotEntry>,
    free_slots: Vec<u32>,
    /// Operator executions since process start; debug instrumentation for
    /// the lazy-evaluation contract.
    compute_count: u64,
}

static STORE: Lazy<Mutex<GraphStore>> = Lazy::new(|| Mutex::new(GraphStore::new()));

/// Runs `f` with the arena locked. Callers must not drop handles or call
/// back into the public graph API inside `f`.
pub(crate) fn with_store<R>(f: impl FnOnce(&mut GraphStore) -> R) -> R {
    let mut guard = STORE.lock().expect("graph store poisoned");
    f(&mut guard)
}

enum ReleaseOp {
    SlotRef(SlotId),
    Node(ExprId),
}

impl GraphStore {
    fn new() -> Self {
        GraphStore {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            compute_count: 0,
        }
    }

    // ------------------------------------------------------------------
    // Lookup

    pub fn node(&self, id: ExprId) -> EngineResult<&ExprNode> {
        self.try_node(id)
            .ok_or(EngineError::StaleHandle("expression no longer exists"))
    }

    pub fn node_mut(&mut self, id: ExprId) -> EngineResult<&mut ExprNode> {
        self.try_node_mut(id)
            .ok_or(EngineError::StaleHandle("expression no longer exists"))
    }

    pub fn try_node(&self, id: ExprId) -> Option<&ExprNode> {
        let entry = self.nodes.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.node.as_ref()
    }

    fn try_node_mut(&mut self, id: ExprId) -> Option<&mut ExprNode> {
        let entry = self.nodes.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.node.as_mut()
    }

    pub fn slot(&self, id: SlotId) -> EngineResult<&VarSlot> {
        self.try_slot(id)
            .ok_or(EngineError::StaleHandle("variable no longer exists"))
    }

    pub fn slot_mut(&mut self, id: SlotId) -> EngineResult<&mut VarSlot> {
        self.try_slot_mut(id)
            .ok_or(EngineError::StaleHandle("variable no longer exists"))
    }

    pub fn try_slot(&self, id: SlotId) -> Option<&VarSlot> {
        let entry = self.slots.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_ref()
    }

    fn try_slot_mut(&mut self, id: SlotId) -> Option<&mut VarSlot> {
        let entry = self.slots.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_mut()
    }

    /// Resolves a slot to the node/output it currently denotes.
    pub fn target_of(&self, slot: SlotId) -> EngineResult<VarTarget> {
        Ok(self.slot(slot)?.target)
    }

    // ------------------------------------------------------------------
    // Allocation and refcounts

    pub fn alloc_node(&mut self, node: ExprNode) -> ExprId {
        if let Some(index) = self.free_nodes.pop() {
            let entry = &mut self.nodes[index as usize];
            entry.node = Some(node);
            ExprId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.nodes.len() as u32;
            self.nodes.push(NodeEntry {
                node: Some(node),
                generation: 0,
            });
            ExprId {
                index,
                generation: 0,
            }
        }
    }

    /// Creates a slot denoting `target` with one reference owned by the
    /// caller.
    pub fn new_slot(&mut self, target: VarTarget) -> EngineResult<SlotId> {
        // Validate and pre-wire the node before the slot exists.
        self.node(target.node)?;
        let id = if let Some(index) = self.free_slots.pop() {
            let entry = &mut self.slots[index as usize];
            entry.slot = Some(VarSlot {
                target,
                refs: 1,
                consumers: Vec::new(),
            });
            SlotId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(SlotEntry {
                slot: Some(VarSlot {
                    target,
                    refs: 1,
                    consumers: Vec::new(),
                }),
                generation: 0,
            });
            SlotId {
                index,
                generation: 0,
            }
        };
        let node = self.node_mut(target.node)?;
        node.slot_refs += 1;
        node.out_slots.push(id);
        Ok(id)
    }

    pub fn slot_ref(&mut self, id: SlotId) {
        if let Some(slot) = self.try_slot_mut(id) {
            slot.refs += 1;
        }
    }

    pub fn slot_unref(&mut self, id: SlotId) {
        self.run_release(vec![ReleaseOp::SlotRef(id)]);
    }

    pub fn node_handle_ref(&mut self, id: ExprId) {
        if let Some(node) = self.try_node_mut(id) {
            node.handle_refs += 1;
        }
    }

    pub fn node_handle_unref(&mut self, id: ExprId) {
        let dead = match self.try_node_mut(id) {
            Some(node) => {
                node.handle_refs = node.handle_refs.saturating_sub(1);
                !node.is_alive_after_release()
            }
            None => false,
        };
        if dead {
            self.run_release(vec![ReleaseOp::Node(id)]);
        }
    }

    /// Releases a node that ended up with no references at all (e.g. a
    /// deserialized node nothing consumes).
    pub fn release_orphan(&mut self, id: ExprId) {
        let orphaned = self
            .try_node(id)
            .map(|node| node.handle_refs == 0 && node.slot_refs == 0)
            .unwrap_or(false);
        if orphaned {
            self.run_release(vec![ReleaseOp::Node(id)]);
        }
    }

    fn run_release(&mut self, mut stack: Vec<ReleaseOp>) {
        while let Some(op) = stack.pop() {
            match op {
                ReleaseOp::SlotRef(sid) => {
                    let Some(slot) = self.try_slot_mut(sid) else {
                        continue;
                    };
                    slot.refs = slot.refs.saturating_sub(1);
                    if slot.refs > 0 {
                        continue;
                    }
                    let target = slot.target;
                    let entry = &mut self.slots[sid.index as usize];
                    entry.slot = None;
                    entry.generation = entry.generation.wrapping_add(1);
                    self.free_slots.push(sid.index);

                    if let Some(node) = self.try_node_mut(target.node) {
                        node.out_slots.retain(|s| *s != sid);
                        node.slot_refs = node.slot_refs.saturating_sub(1);
                        if !node.is_alive_after_release() {
                            stack.push(ReleaseOp::Node(target.node));
                        }
                    }
                }
                ReleaseOp::Node(nid) => {
                    let entry = match self.nodes.get_mut(nid.index as usize) {
                        Some(entry) if entry.generation == nid.generation => entry,
                        _ => continue,
                    };
                    let Some(node) = entry.node.take() else {
                        continue;
                    };
                    entry.generation = entry.generation.wrapping_add(1);
                    self.free_nodes.push(nid.index);

                    for input in node.inputs {
                        if let Some(slot) = self.try_slot_mut(input) {
                            if let Some(pos) =
                                slot.consumers.iter().position(|c| *c == nid)
                            {
                                slot.consumers.swap_remove(pos);
                            }
                        }
                        stack.push(ReleaseOp::SlotRef(input));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Graph construction and rewrites

    /// Records a new expression node consuming the given slots. Each input
    /// edge takes a slot reference and registers a consumer back-edge.
    pub fn create_expr(
        &mut self,
        node: ExprNode,
    ) -> EngineResult<ExprId> {
        for input in &node.inputs {
            self.slot(*input)?;
        }
        let inputs = node.inputs.clone();
        let id = self.alloc_node(node);
        for input in inputs {
            let slot = self
                .try_slot_mut(input)
                .expect("input slot validated above");
            slot.refs += 1;
            slot.consumers.push(id);
        }
        Ok(id)
    }

    /// Retargets `dst`'s slot at `src`'s producing node, in place. Every
    /// live handle sharing `dst`'s slot — including consumer expressions —
    /// observes `src`'s value afterwards. Downstream caches are dropped.
    pub fn replace_slot(&mut self, dst: SlotId, src: SlotId) -> EngineResult<()> {
        let src_target = self.slot(src)?.target;
        let dst_target = self.slot(dst)?.target;
        if src_target == dst_target {
            return Ok(());
        }

        {
            let node = self.node_mut(src_target.node)?;
            node.slot_refs += 1;
            node.out_slots.push(dst);
        }
        self.slot_mut(dst)?.target = src_target;
        self.invalidate_consumers_of_slot(dst);

        // Drop the old producer's claim on the slot; this may release it.
        if let Some(node) = self.try_node_mut(dst_target.node) {
            node.out_slots.retain(|s| *s != dst);
            node.slot_refs = node.slot_refs.saturating_sub(1);
            if !node.is_alive_after_release() {
                self.run_release(vec![ReleaseOp::Node(dst_target.node)]);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cache invalidation and collection

    /// Drops memoized values and inferred info on everything reachable
    /// forward from `node` (the node's own state included when
    /// `include_self`).
    pub fn invalidate_forward(&mut self, node: ExprId, include_self: bool) {
        let mut seen: HashSet<u32> = HashSet::new();
        let mut work = vec![node];
        let mut first = true;
        while let Some(current) = work.pop() {
            if !seen.insert(current.index) {
                continue;
            }
            let consumers = {
                let Some(node) = self.try_node_mut(current) else {
                    continue;
                };
                if include_self || !first {
                    for value in node.values.iter_mut() {
                        *value = None;
                    }
                    if !node.kind.is_leaf() {
                        for info in node.info.iter_mut() {
                            *info = None;
                        }
                    }
                }
                node.out_slots.clone()
            };
            first = false;
            for slot_id in consumers {
                if let Some(slot) = self.try_slot(slot_id) {
                    for consumer in slot.consumers.clone() {
                        work.push(consumer);
                    }
                }
            }
        }
    }

    fn invalidate_consumers_of_slot(&mut self, slot_id: SlotId) {
        let consumers = match self.try_slot(slot_id) {
            Some(slot) => slot.consumers.clone(),
            None => return,
        };
        for consumer in consumers {
            self.invalidate_forward(consumer, true);
        }
    }

    /// Drops memoized values on nodes no handle denotes directly. Graph
    /// structure and leaf payloads are untouched, so any value a live
    /// Variable can observe remains recomputable.
    pub fn gc(&mut self) {
        let mut reclaimed = 0usize;
        for index in 0..self.nodes.len() {
            let externally_held = {
                let Some(node) = self.nodes[index].node.as_ref() else {
                    continue;
                };
                if node.handle_refs > 0 {
                    true
                } else {
                    node.out_slots.iter().any(|slot_id| {
                        self.try_slot(*slot_id)
                            .map(|slot| slot.refs > slot.consumers.len())
                            .unwrap_or(false)
                    })
                }
            };
            if externally_held {
                continue;
            }
            let node = self.nodes[index]
                .node
                .as_mut()
                .expect("checked alive above");
            if node.kind.is_leaf() {
                continue;
            }
            for value in node.values.iter_mut() {
                if value.take().is_some() {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            log::debug!("graph gc reclaimed {reclaimed} cached buffers");
        }
    }

    // ------------------------------------------------------------------
    // Instrumentation

    pub fn note_compute(&mut self) {
        self.compute_count += 1;
    }

    pub fn compute_count(&self) -> u64 {
        self.compute_count
    }

    /// Number of live nodes; used by leak tests.
    pub fn live_node_count(&self) -> usize {
        self.nodes.iter().filter(|e| e.node.is_some()).count()
    }

    /// Number of live slots; used by leak tests.
    pub fn live_slot_count(&self) -> usize {
        self.slots.iter().filter(|e| e.slot.is_some()).count()
    }
}

/// Operator executions performed since process start. Debug
/// instrumentation for asserting the lazy-evaluation contract.
pub fn compute_count() -> u64 {
    with_store(|store| store.compute_count())
}

/// Live node count snapshot; debug instrumentation for leak tests.
pub fn live_node_count() -> usize {
    with_store(|store| store.live_node_count())
}

/// Live slot count snapshot; debug instrumentation for leak tests.
pub fn live_slot_count() -> usize {
    with_store(|store| store.live_slot_count())
}
