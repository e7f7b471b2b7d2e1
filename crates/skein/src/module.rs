//! Named, parameterized, reusable subgraphs.
//!
//! A module stores its body as a compact node plan plus live parameter
//! variables. `forward` splices the plan into the arena at the call site —
//! conceptually identical to constructing the module's operations inline —
//! so lazy/eager gating and memoization apply unchanged. Cloning with
//! shared parameters aliases the parameter storage: a write through one
//! clone is observable through the other.

use std::collections::{HashMap, HashSet};

use crate::backend::{EngineError, EngineResult, ScheduleConfig};
use crate::graph::node::{LayoutOrder, OpKind, VarInfo};
use crate::graph::serial::{self, GraphProto};
use crate::graph::{Expression, Variable};
use crate::tensor::TensorData;

/// Load-time configuration.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    /// Load as a dynamic-shape module.
    pub dynamic: bool,
    /// Static mode: whether input shapes may change between runs.
    pub shape_mutable: bool,
    /// Pre-rearrange weight layouts at load time.
    pub rearrange: bool,
    /// Target backend for the module's computations.
    pub backend: Option<ScheduleConfig>,
}

/// Module metadata surfaced to callers.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// Declared metadata per input, where the stored graph knows it.
    pub inputs: Vec<Option<VarInfo>>,
    pub default_layout: LayoutOrder,
}

enum ModNode {
    /// Forward argument at this position.
    Input { index: usize },
    /// Trainable parameter storage shared with clones on request.
    Param { index: usize },
    /// Frozen constant storage, always shared.
    Baked { index: usize },
    Op {
        kind: OpKind,
        inputs: Vec<(usize, usize)>,
        output_count: usize,
        name: Option<String>,
    },
}

/// A named unit holding parameter variables and an internal subgraph.
pub struct Module {
    name: Option<String>,
    nodes: Vec<ModNode>,
    outputs: Vec<(String, usize, usize)>,
    input_names: Vec<String>,
    input_infos: Vec<Option<VarInfo>>,
    params: Vec<Variable>,
    baked: Vec<Variable>,
    is_training: bool,
    config: ModuleConfig,
}

impl Module {
    /// Loads a module from serialized graph bytes, restricted to the
    /// declared input/output name sets. Constants become live parameters.
    pub fn load(
        bytes: &[u8],
        input_names: &[String],
        output_names: &[String],
        config: ModuleConfig,
    ) -> EngineResult<Module> {
        let proto = GraphProto::from_bytes(bytes)?;

        let mut chosen_outputs = Vec::with_capacity(output_names.len());
        for name in output_names {
            let output = proto
                .outputs
                .iter()
                .find(|o| &o.name == name)
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "output '{name}' is not present in the serialized graph"
                    ))
                })?;
            chosen_outputs.push((name.clone(), output.node, output.output));
        }

        // Match declared input names against the stored placeholder nodes.
        let mut input_marks: HashMap<u32, usize> = HashMap::new();
        for (position, wanted) in input_names.iter().enumerate() {
            let index = proto
                .nodes
                .iter()
                .position(|node| {
                    matches!(node.kind, OpKind::Input { .. })
                        && (node.name.as_deref() == Some(wanted.as_str())
                            || node
                                .output_names
                                .first()
                                .and_then(|n| n.as_deref())
                                == Some(wanted.as_str()))
                })
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "input '{wanted}' is not present in the serialized graph"
                    ))
                })?;
            input_marks.insert(index as u32, position);
        }

        assemble(
            &proto,
            input_marks,
            input_names.to_vec(),
            chosen_outputs,
            true,
            config,
        )
    }

    /// Loads from a file.
    pub fn load_file(
        path: impl AsRef<std::path::Path>,
        input_names: &[String],
        output_names: &[String],
        config: ModuleConfig,
    ) -> EngineResult<Module> {
        let bytes = std::fs::read(path)?;
        Module::load(&bytes, input_names, output_names, config)
    }

    /// Builds a module from live graph variables, cutting the graph at the
    /// given inputs. With `for_train`, constants are lifted into shared
    /// parameter storage; otherwise they stay frozen.
    pub fn extract(
        inputs: &[Variable],
        outputs: &[Variable],
        for_train: bool,
    ) -> EngineResult<Module> {
        let mut all = Vec::with_capacity(outputs.len() + inputs.len());
        all.extend(outputs.iter().cloned());
        all.extend(inputs.iter().cloned());
        let (proto, coords) = serial::snapshot(&all)?;

        let mut input_marks: HashMap<u32, usize> = HashMap::new();
        let mut input_names = Vec::with_capacity(inputs.len());
        for (position, var) in inputs.iter().enumerate() {
            let (node, _) = coords[outputs.len() + position];
            input_marks.insert(node, position);
            input_names.push(
                var.name()
                    .unwrap_or_else(|| format!("input:{position}")),
            );
        }

        let mut chosen_outputs = Vec::with_capacity(outputs.len());
        for (i, var) in outputs.iter().enumerate() {
            let (node, output) = coords[i];
            let name = var.name().unwrap_or_else(|| format!("output:{i}"));
            chosen_outputs.push((name, node, output));
        }

        assemble(
            &proto,
            input_marks,
            input_names,
            chosen_outputs,
            for_train,
            ModuleConfig::default(),
        )
    }

    /// Runs the module over a single input.
    pub fn forward(&self, input: &Variable) -> EngineResult<Variable> {
        let mut outputs = self.on_forward(std::slice::from_ref(input))?;
        let result = outputs.drain(..).next().ok_or_else(|| {
            EngineError::InvalidArgument("module declares no outputs".into())
        });
        result
    }

    /// Runs the module over a list of inputs, returning its outputs.
    /// The input count must match the module's declared inputs.
    pub fn on_forward(&self, inputs: &[Variable]) -> EngineResult<Vec<Variable>> {
        if inputs.len() != self.input_names.len() {
            return Err(EngineError::InvalidArgument(format!(
                "module expects {} inputs, got {}",
                self.input_names.len(),
                inputs.len()
            )));
        }

        let mut produced: Vec<Vec<Variable>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let vars = match node {
                ModNode::Input { index } => vec![inputs[*index].clone()],
                ModNode::Param { index } => vec![self.params[*index].clone()],
                ModNode::Baked { index } => vec![self.baked[*index].clone()],
                ModNode::Op {
                    kind,
                    inputs: edges,
                    output_count,
                    name,
                } => {
                    let mapped: Vec<Variable> = edges
                        .iter()
                        .map(|(node, output)| produced[*node][*output].clone())
                        .collect();
                    let expr = Expression::create(kind.clone(), &mapped, *output_count)?;
                    if let Some(name) = name {
                        expr.set_name(name)?;
                    }
                    (0..*output_count)
                        .map(|i| expr.output(i))
                        .collect::<EngineResult<Vec<_>>>()?
                }
            };
            produced.push(vars);
        }

        Ok(self
            .outputs
            .iter()
            .map(|(_, node, output)| produced[*node][*output].clone())
            .collect())
    }

    /// Duplicates the module. With `share_params`, parameter storage is
    /// aliased rather than copied; without it, each parameter value is
    /// snapshotted into fresh storage.
    pub fn clone_module(&self, share_params: bool) -> EngineResult<Module> {
        let params = if share_params {
            self.params.clone()
        } else {
            let mut copies = Vec::with_capacity(self.params.len());
            for param in &self.params {
                let value = param.read()?;
                copies.push(Variable::constant(value));
            }
            copies
        };
        Ok(Module {
            name: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|node| match node {
                    ModNode::Input { index } => ModNode::Input { index: *index },
                    ModNode::Param { index } => ModNode::Param { index: *index },
                    ModNode::Baked { index } => ModNode::Baked { index: *index },
                    ModNode::Op {
                        kind,
                        inputs,
                        output_count,
                        name,
                    } => ModNode::Op {
                        kind: kind.clone(),
                        inputs: inputs.clone(),
                        output_count: *output_count,
                        name: name.clone(),
                    },
                })
                .collect(),
            outputs: self.outputs.clone(),
            input_names: self.input_names.clone(),
            input_infos: self.input_infos.clone(),
            params,
            baked: self.baked.clone(),
            is_training: self.is_training,
            config: self.config.clone(),
        })
    }

    /// Handles to the parameter variables (shared storage).
    pub fn parameters(&self) -> Vec<Variable> {
        self.params.clone()
    }

    /// Registers an extra parameter, returning its index.
    pub fn add_parameter(&mut self, parameter: &Variable) -> usize {
        self.params.push(parameter.clone());
        self.params.len() - 1
    }

    /// Swaps the parameter handle at `index`.
    pub fn set_parameter(&mut self, parameter: &Variable, index: usize) -> EngineResult<()> {
        let slot = self.params.get_mut(index).ok_or_else(|| {
            EngineError::InvalidArgument(format!("parameter index {index} out of range"))
        })?;
        *slot = parameter.clone();
        Ok(())
    }

    /// Bulk-loads parameter values into the module's storage. Visible
    /// through every clone sharing that storage.
    pub fn load_parameters(&self, values: &[TensorData]) -> EngineResult<()> {
        if values.len() != self.params.len() {
            return Err(EngineError::InvalidArgument(format!(
                "module holds {} parameters, got {}",
                self.params.len(),
                values.len()
            )));
        }
        for (param, value) in self.params.iter().zip(values) {
            param.write(value)?;
        }
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn is_training(&self) -> bool {
        self.is_training
    }

    pub fn set_is_training(&mut self, training: bool) {
        self.is_training = training;
    }

    /// Drops memoized intermediate values so later forwards recompute
    /// from current parameter contents.
    pub fn clear_cache(&self) {
        crate::exec::Executor::current().gc();
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            input_names: self.input_names.clone(),
            output_names: self.outputs.iter().map(|(name, _, _)| name.clone()).collect(),
            inputs: self.input_infos.clone(),
            default_layout: LayoutOrder::default(),
        }
    }
}

/// Builds the module plan from a proto, cutting at the marked inputs.
fn assemble(
    proto: &GraphProto,
    input_marks: HashMap<u32, usize>,
    input_names: Vec<String>,
    chosen_outputs: Vec<(String, u32, u32)>,
    lift_constants: bool,
    config: ModuleConfig,
) -> EngineResult<Module> {
    // Backward reachability from the chosen outputs, not crossing inputs.
    let mut reachable: HashSet<u32> = HashSet::new();
    let mut work: Vec<u32> = chosen_outputs.iter().map(|(_, node, _)| *node).collect();
    while let Some(index) = work.pop() {
        if !reachable.insert(index) {
            continue;
        }
        if input_marks.contains_key(&index) {
            continue;
        }
        let node = proto.nodes.get(index as usize).ok_or_else(|| {
            EngineError::Serde(format!("graph proto references missing node {index}"))
        })?;
        for (producer, _) in &node.inputs {
            work.push(*producer);
        }
    }

    let mut nodes = Vec::new();
    let mut remap: HashMap<u32, usize> = HashMap::new();
    let mut params = Vec::new();
    let mut baked = Vec::new();
    let mut input_infos = vec![None; input_names.len()];

    for (index, node_proto) in proto.nodes.iter().enumerate() {
        let index = index as u32;
        if !reachable.contains(&index) {
            continue;
        }
        let mod_node = if let Some(position) = input_marks.get(&index) {
            if let Some(payload) = &node_proto.payload {
                input_infos[*position] = Some(VarInfo {
                    shape: payload.shape.clone(),
                    dtype: payload.dtype,
                    order: node_proto.layout,
                });
            } else if let OpKind::Input {
                dtype,
                shape: Some(shape),
            } = &node_proto.kind
            {
                input_infos[*position] = Some(VarInfo {
                    shape: shape.clone(),
                    dtype: *dtype,
                    order: node_proto.layout,
                });
            }
            ModNode::Input { index: *position }
        } else {
            match &node_proto.kind {
                OpKind::Input { .. } => {
                    let name = node_proto.name.clone().unwrap_or_default();
                    return Err(EngineError::InvalidArgument(format!(
                        "graph input '{name}' is not covered by the declared input set"
                    )));
                }
                OpKind::Constant => {
                    let payload = node_proto.payload.as_ref().ok_or_else(|| {
                        EngineError::Serde("constant node is missing its payload".into())
                    })?;
                    let value = TensorData::new(
                        payload.dtype,
                        payload.shape.clone(),
                        std::sync::Arc::from(payload.bytes.clone().into_boxed_slice()),
                    )?;
                    let var = Variable::constant(value);
                    if let Some(name) = &node_proto.name {
                        var.set_name(name)?;
                    }
                    if lift_constants {
                        params.push(var);
                        ModNode::Param {
                            index: params.len() - 1,
                        }
                    } else {
                        baked.push(var);
                        ModNode::Baked {
                            index: baked.len() - 1,
                        }
                    }
                }
                kind => {
                    let mut inputs = Vec::with_capacity(node_proto.inputs.len());
                    for (producer, output) in &node_proto.inputs {
                        let mapped = remap.get(producer).ok_or_else(|| {
                            EngineError::Serde(format!(
                                "graph proto node {index} consumes unreachable node {producer}"
                            ))
                        })?;
                        inputs.push((*mapped, *output as usize));
                    }
                    ModNode::Op {
                        kind: kind.clone(),
                        inputs,
                        output_count: node_proto.output_count as usize,
                        name: node_proto.name.clone(),
                    }
                }
            }
        };
        remap.insert(index, nodes.len());
        nodes.push(mod_node);
    }

    let outputs = chosen_outputs
        .into_iter()
        .map(|(name, node, output)| {
            let mapped = remap.get(&node).copied().ok_or_else(|| {
                EngineError::InvalidArgument(format!("output '{name}' is unreachable"))
            })?;
            Ok((name, mapped, output as usize))
        })
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(Module {
        name: None,
        nodes,
        outputs,
        input_names,
        input_infos,
        params,
        baked,
        is_training: false,
        config,
    })
}
