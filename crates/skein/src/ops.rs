//! Operator constructors.
//!
//! Each constructor is a mechanical forward: it packages parameters into an
//! [`OpKind`] and funnels through one generic application path. Whether the
//! node is computed immediately depends on the current executor's lazy
//! flag.

use crate::backend::EngineResult;
use crate::graph::{BinaryOp, Expression, OpKind, ReduceOp, UnaryOp, Variable};
use crate::tensor::DType;

/// Applies an operator to the inputs, returning its single output.
pub fn apply(kind: OpKind, inputs: &[Variable]) -> EngineResult<Variable> {
    let expr = Expression::create(kind, inputs, 1)?;
    expr.output(0)
}

/// Applies an operator with a declared output count, returning every
/// output.
pub fn apply_multi(
    kind: OpKind,
    inputs: &[Variable],
    output_count: usize,
) -> EngineResult<Vec<Variable>> {
    let expr = Expression::create(kind, inputs, output_count)?;
    (0..output_count).map(|i| expr.output(i)).collect()
}

fn binary(op: BinaryOp, lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    apply(OpKind::Binary(op), &[lhs.clone(), rhs.clone()])
}

fn unary(op: UnaryOp, input: &Variable) -> EngineResult<Variable> {
    apply(OpKind::Unary(op), &[input.clone()])
}

pub fn add(lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    binary(BinaryOp::Add, lhs, rhs)
}

pub fn sub(lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    binary(BinaryOp::Sub, lhs, rhs)
}

pub fn mul(lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    binary(BinaryOp::Mul, lhs, rhs)
}

pub fn div(lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    binary(BinaryOp::Div, lhs, rhs)
}

pub fn maximum(lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    binary(BinaryOp::Maximum, lhs, rhs)
}

pub fn minimum(lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    binary(BinaryOp::Minimum, lhs, rhs)
}

pub fn neg(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Neg, input)
}

pub fn abs(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Abs, input)
}

pub fn sqrt(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Sqrt, input)
}

pub fn rsqrt(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Rsqrt, input)
}

pub fn exp(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Exp, input)
}

pub fn log(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Log, input)
}

pub fn tanh(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Tanh, input)
}

pub fn sigmoid(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Sigmoid, input)
}

pub fn relu(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Relu, input)
}

pub fn square(input: &Variable) -> EngineResult<Variable> {
    unary(UnaryOp::Square, input)
}

fn reduce(
    op: ReduceOp,
    input: &Variable,
    axes: Vec<usize>,
    keep_dims: bool,
) -> EngineResult<Variable> {
    apply(
        OpKind::Reduce { op, axes, keep_dims },
        &[input.clone()],
    )
}

/// Sum over the given axes (all axes when empty).
pub fn reduce_sum(input: &Variable, axes: Vec<usize>, keep_dims: bool) -> EngineResult<Variable> {
    reduce(ReduceOp::Sum, input, axes, keep_dims)
}

/// Mean over the given axes (all axes when empty).
pub fn reduce_mean(input: &Variable, axes: Vec<usize>, keep_dims: bool) -> EngineResult<Variable> {
    reduce(ReduceOp::Mean, input, axes, keep_dims)
}

pub fn reduce_max(input: &Variable, axes: Vec<usize>, keep_dims: bool) -> EngineResult<Variable> {
    reduce(ReduceOp::Max, input, axes, keep_dims)
}

pub fn reduce_min(input: &Variable, axes: Vec<usize>, keep_dims: bool) -> EngineResult<Variable> {
    reduce(ReduceOp::Min, input, axes, keep_dims)
}

pub fn matmul(lhs: &Variable, rhs: &Variable) -> EngineResult<Variable> {
    apply(
        OpKind::MatMul {
            transpose_a: false,
            transpose_b: false,
        },
        &[lhs.clone(), rhs.clone()],
    )
}

pub fn matmul_transposed(
    lhs: &Variable,
    rhs: &Variable,
    transpose_a: bool,
    transpose_b: bool,
) -> EngineResult<Variable> {
    apply(
        OpKind::MatMul {
            transpose_a,
            transpose_b,
        },
        &[lhs.clone(), rhs.clone()],
    )
}

/// Reshape; `-1` infers one dimension.
pub fn reshape(input: &Variable, dims: Vec<i64>) -> EngineResult<Variable> {
    apply(OpKind::Reshape { dims }, &[input.clone()])
}

pub fn transpose(input: &Variable, perm: Vec<usize>) -> EngineResult<Variable> {
    apply(OpKind::Transpose { perm }, &[input.clone()])
}

pub fn broadcast_to(input: &Variable, dims: Vec<usize>) -> EngineResult<Variable> {
    apply(OpKind::BroadcastTo { dims }, &[input.clone()])
}

pub fn concat(inputs: &[Variable], axis: usize) -> EngineResult<Variable> {
    apply(OpKind::Concat { axis }, inputs)
}

pub fn slice(input: &Variable, starts: Vec<usize>, sizes: Vec<usize>) -> EngineResult<Variable> {
    apply(OpKind::Slice { starts, sizes }, &[input.clone()])
}

pub fn cast(input: &Variable, dtype: DType) -> EngineResult<Variable> {
    apply(OpKind::Cast { dtype }, &[input.clone()])
}
