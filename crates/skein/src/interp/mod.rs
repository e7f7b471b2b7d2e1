//! Interpreter/session lifecycle: compile a serialized graph against a
//! schedule configuration, resize it, run it, tear it down.
//!
//! A `Session` is a fixed compiled schedule: op execution order is decided
//! at compile time and never changes across runs, so two sessions compiled
//! from the same graph produce bit-identical outputs regardless of thread
//! count. Session input/output tensors are owned by the session and handed
//! out as borrows.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::backend::{registry, Backend, EngineError, EngineResult, ScheduleConfig};
use crate::graph::infer::infer_op;
use crate::graph::node::{OpKind, VarInfo};
use crate::graph::GraphProto;
use crate::tensor::{RawTensor, TensorData};

/// Owns a deserialized graph and the sessions compiled from it.
pub struct Interpreter {
    proto: Option<GraphProto>,
    sessions: Vec<Arc<Mutex<Session>>>,
}

impl Interpreter {
    /// Deserializes a model from bytes.
    pub fn from_buffer(bytes: &[u8]) -> EngineResult<Interpreter> {
        let proto = GraphProto::from_bytes(bytes)?;
        Ok(Interpreter {
            proto: Some(proto),
            sessions: Vec::new(),
        })
    }

    /// Deserializes a model from a file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Interpreter> {
        let bytes = std::fs::read(path)?;
        Interpreter::from_buffer(&bytes)
    }

    /// Drops the retained model graph. Compiled sessions stay runnable;
    /// creating new ones is no longer possible.
    pub fn release_model(&mut self) {
        self.proto = None;
    }

    /// Compiles the model against a schedule configuration. Returns `None`
    /// when the requested backend (and its backup) is unavailable or the
    /// graph cannot be compiled; the cause is logged.
    pub fn create_session(&mut self, config: &ScheduleConfig) -> Option<Arc<Mutex<Session>>> {
        let proto = match self.proto.as_ref() {
            Some(proto) => proto,
            None => {
                log::warn!("create_session called after release_model");
                return None;
            }
        };
        let backend = registry::create_backend(config.kind)
            .or_else(|| registry::create_backend(config.backup));
        let backend = match backend {
            Some(backend) => backend,
            None => {
                log::warn!(
                    "no backend registered for {:?} (backup {:?})",
                    config.kind,
                    config.backup
                );
                return None;
            }
        };
        match Session::compile(proto, backend, config.worker_count()) {
            Ok(session) => {
                let session = Arc::new(Mutex::new(session));
                self.sessions.push(Arc::clone(&session));
                Some(session)
            }
            Err(err) => {
                log::warn!("session compilation failed: {err}");
                None
            }
        }
    }

    /// Releases a session created by this interpreter.
    pub fn release_session(&mut self, session: &Arc<Mutex<Session>>) -> EngineResult<()> {
        let before = self.sessions.len();
        self.sessions.retain(|s| !Arc::ptr_eq(s, session));
        if self.sessions.len() == before {
            return Err(EngineError::InvalidArgument(
                "session does not belong to this interpreter".into(),
            ));
        }
        Ok(())
    }

    /// Number of live sessions owned by this interpreter.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs a session to completion (blocking).
    pub fn run_session(&self, session: &Arc<Mutex<Session>>) -> EngineResult<()> {
        session.lock().expect("session poisoned").run()
    }

    /// Re-infers every shape in a session from its current input tensor
    /// dimensions. Must be called whenever an input shape changed.
    pub fn resize_session(&self, session: &Arc<Mutex<Session>>) -> EngineResult<()> {
        session.lock().expect("session poisoned").resize()
    }
}

struct SessionTensor {
    name: String,
    node: usize,
    output: usize,
    /// Boxed so borrowed pointers handed across the boundary stay stable.
    tensor: Box<RawTensor>,
}

struct PlanOp {
    node: usize,
    kind: OpKind,
    inputs: Vec<(usize, usize)>,
    output_count: usize,
}

/// A compiled, runnable instance of a graph.
pub struct Session {
    backend: Arc<dyn Backend>,
    threads: usize,
    node_count: usize,
    plan: Vec<PlanOp>,
    constants: Vec<(usize, TensorData)>,
    inputs: Vec<SessionTensor>,
    outputs: Vec<SessionTensor>,
}

impl Session {
    fn compile(
        proto: &GraphProto,
        backend: Arc<dyn Backend>,
        threads: usize,
    ) -> EngineResult<Session> {
        let mut plan = Vec::new();
        let mut constants = Vec::new();
        let mut inputs = Vec::new();
        let mut infos: Vec<Vec<VarInfo>> = Vec::with_capacity(proto.nodes.len());

        for (index, node) in proto.nodes.iter().enumerate() {
            match &node.kind {
                OpKind::Input { dtype, shape } => {
                    let declared = node
                        .payload
                        .as_ref()
                        .map(|p| (p.dtype, p.shape.clone()))
                        .or_else(|| shape.clone().map(|s| (*dtype, s)))
                        .ok_or(EngineError::InfoNotAvailable)?;
                    let (dtype, shape) = declared;
                    let mut tensor = Box::new(RawTensor::alloc_host(shape.clone(), dtype));
                    if let Some(payload) = &node.payload {
                        tensor.host_bytes_mut()?.copy_from_slice(&payload.bytes);
                    }
                    let name = node_display_name(node, || format!("input:{}", inputs.len()));
                    infos.push(vec![VarInfo {
                        shape,
                        dtype,
                        order: node.layout,
                    }]);
                    inputs.push(SessionTensor {
                        name,
                        node: index,
                        output: 0,
                        tensor,
                    });
                }
                OpKind::Constant => {
                    let payload = node.payload.as_ref().ok_or_else(|| {
                        EngineError::Serde("constant node is missing its payload".into())
                    })?;
                    let value = TensorData::new(
                        payload.dtype,
                        payload.shape.clone(),
                        Arc::from(payload.bytes.clone().into_boxed_slice()),
                    )?;
                    infos.push(vec![VarInfo {
                        shape: payload.shape.clone(),
                        dtype: payload.dtype,
                        order: node.layout,
                    }]);
                    constants.push((index, value));
                }
                kind => {
                    let input_infos = gather_infos(&infos, &node.inputs)?;
                    infos.push(infer_op(kind, &input_infos)?);
                    plan.push(PlanOp {
                        node: index,
                        kind: kind.clone(),
                        inputs: node
                            .inputs
                            .iter()
                            .map(|(n, o)| (*n as usize, *o as usize))
                            .collect(),
                        output_count: node.output_count as usize,
                    });
                }
            }
        }

        let mut outputs = Vec::with_capacity(proto.outputs.len());
        for output in &proto.outputs {
            let info = infos
                .get(output.node as usize)
                .and_then(|outs| outs.get(output.output as usize))
                .ok_or_else(|| {
                    EngineError::Serde(format!(
                        "graph output '{}' references a missing value",
                        output.name
                    ))
                })?;
            outputs.push(SessionTensor {
                name: output.name.clone(),
                node: output.node as usize,
                output: output.output as usize,
                tensor: Box::new(RawTensor::alloc_host(info.shape.clone(), info.dtype)),
            });
        }

        Ok(Session {
            backend,
            threads,
            node_count: proto.nodes.len(),
            plan,
            constants,
            inputs,
            outputs,
        })
    }

    /// Executes every op in the compiled order and populates the output
    /// tensors. Blocking; repeatable.
    pub fn run(&mut self) -> EngineResult<()> {
        let mut values: Vec<Option<Vec<TensorData>>> = (0..self.node_count).map(|_| None).collect();

        for input in &self.inputs {
            values[input.node] = Some(vec![input.tensor.to_data()]);
        }
        for (node, value) in &self.constants {
            values[*node] = Some(vec![value.clone()]);
        }

        for op in &self.plan {
            let mut operands = Vec::with_capacity(op.inputs.len());
            for (node, output) in &op.inputs {
                let value = values[*node]
                    .as_ref()
                    .and_then(|outs| outs.get(*output))
                    .ok_or_else(|| {
                        EngineError::InvalidArgument(
                            "session plan consumes a value before it is produced".into(),
                        )
                    })?;
                operands.push(value.clone());
            }
            let produced = self.backend.execute(&op.kind, &operands, self.threads)?;
            if produced.len() != op.output_count {
                return Err(EngineError::InvalidArgument(format!(
                    "{} produced {} outputs, {} declared",
                    op.kind.op_name(),
                    produced.len(),
                    op.output_count
                )));
            }
            values[op.node] = Some(produced);
        }

        for output in &mut self.outputs {
            let value = values[output.node]
                .as_ref()
                .and_then(|outs| outs.get(output.output))
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "session output '{}' was never produced",
                        output.name
                    ))
                })?;
            if output.tensor.shape() != value.shape() {
                // Caller resized an input without resize_session; correct
                // the output allocation rather than writing garbage.
                output.tensor.resize_dims(value.shape().dims().to_vec())?;
            }
            output.tensor.write_data(value)?;
        }
        Ok(())
    }

    /// Recomputes every shape from the current input tensor dims and
    /// reallocates the output tensors.
    pub fn resize(&mut self) -> EngineResult<()> {
        let mut infos: Vec<Option<Vec<VarInfo>>> = (0..self.node_count).map(|_| None).collect();
        for input in &self.inputs {
            infos[input.node] = Some(vec![VarInfo {
                shape: input.tensor.shape().clone(),
                dtype: input.tensor.dtype(),
                order: Default::default(),
            }]);
        }
        for (node, value) in &self.constants {
            infos[*node] = Some(vec![VarInfo {
                shape: value.shape().clone(),
                dtype: value.dtype(),
                order: Default::default(),
            }]);
        }
        for op in &self.plan {
            let mut input_infos = Vec::with_capacity(op.inputs.len());
            for (node, output) in &op.inputs {
                let info = infos[*node]
                    .as_ref()
                    .and_then(|outs| outs.get(*output))
                    .ok_or_else(|| {
                        EngineError::InvalidArgument(
                            "session plan consumes a value before it is produced".into(),
                        )
                    })?;
                input_infos.push(info.clone());
            }
            infos[op.node] = Some(infer_op(&op.kind, &input_infos)?);
        }

        for output in &mut self.outputs {
            let info = infos[output.node]
                .as_ref()
                .and_then(|outs| outs.get(output.output))
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "session output '{}' has no inferable shape",
                        output.name
                    ))
                })?;
            output.tensor.resize_dims(info.shape.dims().to_vec())?;
        }
        Ok(())
    }

    /// Borrowed handle to a named input tensor (`None` selects the first).
    /// The tensor is owned by the session and must not outlive it.
    pub fn input(&mut self, name: Option<&str>) -> Option<&mut RawTensor> {
        find_tensor(&mut self.inputs, name)
    }

    /// Borrowed handle to a named output tensor (`None` selects the
    /// first). Owned by the session.
    pub fn output(&mut self, name: Option<&str>) -> Option<&mut RawTensor> {
        find_tensor(&mut self.outputs, name)
    }

    /// All input tensors with their names.
    pub fn inputs(&mut self) -> Vec<(&str, &mut RawTensor)> {
        self.inputs
            .iter_mut()
            .map(|t| (t.name.as_str(), t.tensor.as_mut()))
            .collect()
    }

    /// All output tensors with their names.
    pub fn outputs(&mut self) -> Vec<(&str, &mut RawTensor)> {
        self.outputs
            .iter_mut()
            .map(|t| (t.name.as_str(), t.tensor.as_mut()))
            .collect()
    }

    /// Resizes an input tensor in place. Callers must `resize()` the
    /// session before the next run.
    pub fn resize_input(&mut self, name: Option<&str>, dims: Vec<usize>) -> EngineResult<()> {
        let tensor = self
            .input(name)
            .ok_or_else(|| EngineError::InvalidArgument("no such input tensor".into()))?;
        tensor.resize_dims(dims)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }
}

fn find_tensor<'a>(
    tensors: &'a mut [SessionTensor],
    name: Option<&str>,
) -> Option<&'a mut RawTensor> {
    match name {
        None => tensors.first_mut().map(|t| t.tensor.as_mut()),
        Some(name) => tensors
            .iter_mut()
            .find(|t| t.name == name)
            .map(|t| t.tensor.as_mut()),
    }
}

fn gather_infos(
    infos: &[Vec<VarInfo>],
    edges: &[(u32, u32)],
) -> EngineResult<Vec<VarInfo>> {
    edges
        .iter()
        .map(|(node, output)| {
            infos
                .get(*node as usize)
                .and_then(|outs| outs.get(*output as usize))
                .cloned()
                .ok_or_else(|| {
                    EngineError::Serde("graph proto consumes a value before it is produced".into())
                })
        })
        .collect()
}

fn node_display_name(
    node: &crate::graph::serial::NodeProto,
    fallback: impl FnOnce() -> String,
) -> String {
    node.name
        .clone()
        .or_else(|| node.output_names.first().and_then(|n| n.clone()))
        .unwrap_or_else(fallback)
}
