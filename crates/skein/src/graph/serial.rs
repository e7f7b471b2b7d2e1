//! Serialized graph format: save/load of named output variables together
//! with their transitive input subgraph.
//!
//! The binary form is bincode; a JSON dump exists for debugging. The
//! format carries a version tag checked on load. Round-tripping
//! save-then-load reproduces an observably equivalent graph: same
//! structure, same leaf payloads, same output names.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::handle::Variable;
use super::node::{ExprId, ExprNode, HostPayload, LayoutOrder, OpKind, SlotId, VarInfo, VarTarget};
use super::store::{with_store, GraphStore};
use crate::backend::{EngineError, EngineResult};
use crate::tensor::{DType, Shape};

/// Format tag enforced by this build.
pub const FORMAT_TAG: &str = "skein.graph.v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PayloadProto {
    pub dtype: DType,
    pub shape: Shape,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeProto {
    pub kind: OpKind,
    /// Edges as (producer proto index, output index); producers always
    /// precede consumers.
    pub inputs: Vec<(u32, u32)>,
    pub output_count: u32,
    pub name: Option<String>,
    pub output_names: Vec<Option<String>>,
    pub layout: LayoutOrder,
    pub payload: Option<PayloadProto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OutputProto {
    pub name: String,
    pub node: u32,
    pub output: u32,
}

/// Serialized graph: a topologically ordered node list plus named outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphProto {
    version: String,
    pub(crate) nodes: Vec<NodeProto>,
    pub(crate) outputs: Vec<OutputProto>,
}

impl GraphProto {
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<GraphProto> {
        let proto: GraphProto = bincode::deserialize(bytes)?;
        if proto.version != FORMAT_TAG {
            return Err(EngineError::Serde(format!(
                "graph format '{}' does not match expected '{FORMAT_TAG}'",
                proto.version
            )));
        }
        Ok(proto)
    }

    /// Human-readable dump for debugging.
    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }
}

/// Serializes the named variables and their transitive subgraph.
pub fn save(vars: &[Variable]) -> EngineResult<Vec<u8>> {
    snapshot(vars)?.0.to_bytes()
}

/// Serializes to a file.
pub fn save_file(vars: &[Variable], path: impl AsRef<Path>) -> EngineResult<()> {
    let bytes = save(vars)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Captures the subgraph of `vars` into a proto, returning the proto plus
/// each variable's (node, output) coordinates inside it.
pub(crate) fn snapshot(vars: &[Variable]) -> EngineResult<(GraphProto, Vec<(u32, u32)>)> {
    with_store(|store| {
        let mut targets = Vec::with_capacity(vars.len());
        for var in vars {
            targets.push(store.target_of(var.slot_id())?);
        }

        let order = input_post_order(store, &targets)?;
        let mut proto_index: HashMap<u32, u32> = HashMap::new();
        let mut nodes = Vec::with_capacity(order.len());
        for (i, id) in order.iter().enumerate() {
            proto_index.insert(id.index, i as u32);
            let node = store.node(*id)?;
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for slot in &node.inputs {
                let target = store.target_of(*slot)?;
                let producer = proto_index
                    .get(&target.node.index)
                    .copied()
                    .expect("post-order places producers before consumers");
                inputs.push((producer, target.output as u32));
            }
            nodes.push(NodeProto {
                kind: node.kind.clone(),
                inputs,
                output_count: node.output_count as u32,
                name: node.name.clone(),
                output_names: node.output_names.clone(),
                layout: node.layout,
                payload: node.payload.as_ref().map(|payload| PayloadProto {
                    dtype: payload.dtype,
                    shape: payload.shape.clone(),
                    bytes: payload.bytes.clone(),
                }),
            });
        }

        let mut outputs = Vec::with_capacity(targets.len());
        let mut coords = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            let node_index = proto_index[&target.node.index];
            let node = store.node(target.node)?;
            let name = node
                .output_names
                .get(target.output)
                .and_then(|n| n.clone())
                .or_else(|| node.name.clone())
                .unwrap_or_else(|| format!("output:{i}"));
            outputs.push(OutputProto {
                name,
                node: node_index,
                output: target.output as u32,
            });
            coords.push((node_index, target.output as u32));
        }

        Ok((
            GraphProto {
                version: FORMAT_TAG.to_string(),
                nodes,
                outputs,
            },
            coords,
        ))
    })
}

/// Post-order over the input edges of the targets' producers.
fn input_post_order(store: &GraphStore, targets: &[VarTarget]) -> EngineResult<Vec<ExprId>> {
    let mut order = Vec::new();
    let mut done: std::collections::HashSet<u32> = std::collections::HashSet::new();
    for target in targets {
        let mut frames: Vec<(ExprId, usize)> = vec![(target.node, 0)];
        while let Some((id, child)) = frames.pop() {
            if done.contains(&id.index) && child == 0 {
                continue;
            }
            let node = store.node(id)?;
            if child < node.inputs.len() {
                frames.push((id, child + 1));
                let dep = store.target_of(node.inputs[child])?;
                if !done.contains(&dep.node.index) {
                    frames.push((dep.node, 0));
                }
            } else if done.insert(id.index) {
                order.push(id);
            }
        }
    }
    Ok(order)
}

/// Rebuilds a serialized graph into the arena, returning one variable per
/// stored named output.
pub fn load(bytes: &[u8]) -> EngineResult<Vec<Variable>> {
    let proto = GraphProto::from_bytes(bytes)?;
    instantiate(&proto)
}

/// Loads and pairs each output variable with its stored name.
pub fn load_map(bytes: &[u8]) -> EngineResult<Vec<(String, Variable)>> {
    let proto = GraphProto::from_bytes(bytes)?;
    let names = proto.output_names();
    let vars = instantiate(&proto)?;
    Ok(names.into_iter().zip(vars).collect())
}

/// Loads from a file.
pub fn load_file(path: impl AsRef<Path>) -> EngineResult<Vec<Variable>> {
    let bytes = std::fs::read(path)?;
    load(&bytes)
}

/// Instantiates a proto's nodes into the arena.
pub(crate) fn instantiate(proto: &GraphProto) -> EngineResult<Vec<Variable>> {
    let slots = with_store(|store| {
        let mut created: Vec<ExprId> = Vec::with_capacity(proto.nodes.len());
        // One shared slot per referenced (node, output) pair, released
        // after wiring so only consumer edges keep them alive.
        let mut wiring: HashMap<(u32, u32), SlotId> = HashMap::new();

        let result = (|| -> EngineResult<Vec<SlotId>> {
            for node_proto in &proto.nodes {
                let mut inputs = Vec::with_capacity(node_proto.inputs.len());
                for (producer, output) in &node_proto.inputs {
                    let id = *created.get(*producer as usize).ok_or_else(|| {
                        EngineError::Serde(format!(
                            "graph proto references node {producer} before definition"
                        ))
                    })?;
                    let slot = match wiring.entry((*producer, *output)) {
                        std::collections::hash_map::Entry::Occupied(e) => *e.get(),
                        std::collections::hash_map::Entry::Vacant(e) => *e.insert(
                            store.new_slot(VarTarget {
                                node: id,
                                output: *output as usize,
                            })?,
                        ),
                    };
                    inputs.push(slot);
                }

                let output_count = node_proto.output_count as usize;
                let mut node = ExprNode::new(node_proto.kind.clone(), inputs, output_count);
                node.name = node_proto.name.clone();
                node.output_names = node_proto.output_names.clone();
                node.layout = node_proto.layout;
                if let Some(payload) = &node_proto.payload {
                    node.info = vec![Some(VarInfo {
                        shape: payload.shape.clone(),
                        dtype: payload.dtype,
                        order: node_proto.layout,
                    })];
                    node.payload = Some(HostPayload {
                        dtype: payload.dtype,
                        shape: payload.shape.clone(),
                        bytes: payload.bytes.clone(),
                        map_state: crate::tensor::MapState::Unmapped,
                    });
                }
                created.push(store.create_expr(node)?);
            }

            let mut out_slots = Vec::with_capacity(proto.outputs.len());
            for output in &proto.outputs {
                let id = *created.get(output.node as usize).ok_or_else(|| {
                    EngineError::Serde(format!("graph proto output references node {}", output.node))
                })?;
                out_slots.push(store.new_slot(VarTarget {
                    node: id,
                    output: output.output as usize,
                })?);
            }
            Ok(out_slots)
        })();

        // Drop the construction references whether or not wiring succeeded;
        // consumer edges (or nothing) keep the graph alive from here.
        for slot in wiring.into_values() {
            store.slot_unref(slot);
        }
        for id in created.into_iter().rev() {
            store.release_orphan(id);
        }
        result
    })?;

    Ok(slots.into_iter().map(Variable::from_slot).collect())
}
