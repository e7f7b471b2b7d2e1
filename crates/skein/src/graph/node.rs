//! Node and operator descriptors stored in the graph arena.

use serde::{Deserialize, Serialize};

use crate::tensor::{DType, MapState, Shape, TensorData};

/// Generation-checked identifier of an expression node. A stale id (the
/// slot was reused after the node died) is detected on lookup and reported
/// as a defined error, never a dangling access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Generation-checked identifier of a variable slot (the level of
/// indirection shared by every handle that denotes the same value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Denotes one output of one expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarTarget {
    pub(crate) node: ExprId,
    pub(crate) output: usize,
}

/// Elementwise unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Rsqrt,
    Exp,
    Log,
    Tanh,
    Sigmoid,
    Relu,
    Square,
}

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

/// Reduction families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

/// Logical dimension layout attached to variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LayoutOrder {
    #[default]
    Nchw,
    Nhwc,
}

impl LayoutOrder {
    pub fn tag(self) -> i32 {
        match self {
            LayoutOrder::Nchw => 0,
            LayoutOrder::Nhwc => 1,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(LayoutOrder::Nchw),
            1 => Some(LayoutOrder::Nhwc),
            _ => None,
        }
    }
}

/// Declarative operation descriptor: kind plus parameter payload. Every
/// operator constructor funnels into this one representation, and one
/// generic node-construction path consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Host-writable placeholder with a declared dtype and, once known, a
    /// declared shape.
    Input {
        dtype: DType,
        shape: Option<Shape>,
    },
    /// Baked value; the payload lives on the node.
    Constant,
    Unary(UnaryOp),
    Binary(BinaryOp),
    Reduce {
        op: ReduceOp,
        axes: Vec<usize>,
        keep_dims: bool,
    },
    MatMul {
        transpose_a: bool,
        transpose_b: bool,
    },
    Reshape {
        /// `-1` infers one dimension from the element count.
        dims: Vec<i64>,
    },
    Transpose {
        perm: Vec<usize>,
    },
    BroadcastTo {
        dims: Vec<usize>,
    },
    Concat {
        axis: usize,
    },
    Slice {
        starts: Vec<usize>,
        sizes: Vec<usize>,
    },
    Cast {
        dtype: DType,
    },
}

impl OpKind {
    /// True for the leaf kinds that carry a host payload on the node.
    pub fn is_leaf(&self) -> bool {
        matches!(self, OpKind::Input { .. } | OpKind::Constant)
    }

    /// Short operator name for diagnostics.
    pub fn op_name(&self) -> &'static str {
        match self {
            OpKind::Input { .. } => "input",
            OpKind::Constant => "constant",
            OpKind::Unary(_) => "unary",
            OpKind::Binary(_) => "binary",
            OpKind::Reduce { .. } => "reduce",
            OpKind::MatMul { .. } => "matmul",
            OpKind::Reshape { .. } => "reshape",
            OpKind::Transpose { .. } => "transpose",
            OpKind::BroadcastTo { .. } => "broadcast_to",
            OpKind::Concat { .. } => "concat",
            OpKind::Slice { .. } => "slice",
            OpKind::Cast { .. } => "cast",
        }
    }
}

/// Shape/dtype/layout metadata of one variable, lazily computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarInfo {
    pub shape: Shape,
    pub dtype: DType,
    pub order: LayoutOrder,
}

impl VarInfo {
    pub fn size(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn byte_len(&self) -> usize {
        self.size() * self.dtype.size_in_bytes()
    }
}

/// Host payload carried by `Input`/`Constant` nodes, with the same
/// map-state discipline as tensor buffers.
#[derive(Debug)]
pub(crate) struct HostPayload {
    pub dtype: DType,
    pub shape: Shape,
    pub bytes: Vec<u8>,
    pub map_state: MapState,
}

impl HostPayload {
    pub fn from_data(value: &TensorData) -> Self {
        HostPayload {
            dtype: value.dtype(),
            shape: value.shape().clone(),
            bytes: value.bytes().to_vec(),
            map_state: MapState::Unmapped,
        }
    }

    pub fn zeroed(dtype: DType, shape: Shape) -> Self {
        let len = shape.num_elements() * dtype.size_in_bytes();
        HostPayload {
            dtype,
            shape,
            bytes: vec![0u8; len],
            map_state: MapState::Unmapped,
        }
    }

    pub fn snapshot(&self) -> TensorData {
        TensorData::new(
            self.dtype,
            self.shape.clone(),
            std::sync::Arc::from(self.bytes.clone().into_boxed_slice()),
        )
        .expect("payload length always matches its shape")
    }
}

/// Arena-resident expression node.
///
/// Inputs are slot ids (strong: each edge holds a slot reference, which in
/// turn keeps the producing node alive). Consumer back-references live on
/// the slots and never extend a lifetime.
pub(crate) struct ExprNode {
    pub kind: OpKind,
    pub inputs: Vec<SlotId>,
    pub output_count: usize,
    pub name: Option<String>,
    pub output_names: Vec<Option<String>>,
    pub layout: LayoutOrder,
    /// Present for `Input`/`Constant` nodes only.
    pub payload: Option<HostPayload>,
    /// Lazily inferred metadata, one entry per output.
    pub info: Vec<Option<VarInfo>>,
    /// Memoized computed values, one entry per output.
    pub values: Vec<Option<TensorData>>,
    /// Live slots currently targeting this node.
    pub out_slots: Vec<SlotId>,
    /// Live `Expression` handles.
    pub handle_refs: usize,
    /// Live slots counted toward node liveness.
    pub slot_refs: usize,
}

impl ExprNode {
    pub fn new(kind: OpKind, inputs: Vec<SlotId>, output_count: usize) -> Self {
        ExprNode {
            kind,
            inputs,
            output_count,
            name: None,
            output_names: vec![None; output_count],
            layout: LayoutOrder::default(),
            payload: None,
            info: vec![None; output_count],
            values: vec![None; output_count],
            out_slots: Vec::new(),
            handle_refs: 0,
            slot_refs: 0,
        }
    }

    pub fn is_alive_after_release(&self) -> bool {
        self.handle_refs > 0 || self.slot_refs > 0
    }
}

/// Variable slot: the shared indirection between handles and the node they
/// currently denote. `replace` retargets the slot, which is what lets every
/// existing handle observe the new producer.
pub(crate) struct VarSlot {
    pub target: VarTarget,
    /// Handle references plus one reference per consumer edge.
    pub refs: usize,
    /// Expressions that consume this slot as an input (weak back-edges).
    pub consumers: Vec<ExprId>,
}
