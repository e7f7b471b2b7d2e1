//! Scalar kernel loops for the CPU backend.
//!
//! Elementwise kernels partition their output into contiguous chunks, one
//! per worker, so results are bit-identical for every thread count: the
//! same scalar operations run in the same element order, only on different
//! threads.

use skein::graph::{infer_op, BinaryOp, OpKind, ReduceOp, UnaryOp, VarInfo};
use skein::tensor::{DType, Shape, TensorData};
use skein::{EngineError, EngineResult};

/// Below this element count the chunking overhead outweighs the work.
const PARALLEL_THRESHOLD: usize = 4096;

pub(crate) fn execute(
    op: &OpKind,
    inputs: &[TensorData],
    threads: usize,
) -> EngineResult<Vec<TensorData>> {
    match op {
        OpKind::Input { .. } | OpKind::Constant => Err(EngineError::Unsupported(
            "leaf nodes carry their own payload and never reach the backend".into(),
        )),
        OpKind::Unary(op) => unary(*op, expect(inputs, 1)?, threads).map(one),
        OpKind::Binary(op) => binary(*op, inputs, threads).map(one),
        OpKind::Reduce { op, axes, keep_dims } => {
            reduce(*op, expect(inputs, 1)?, axes, *keep_dims).map(one)
        }
        OpKind::MatMul {
            transpose_a,
            transpose_b,
        } => matmul(inputs, *transpose_a, *transpose_b, threads).map(one),
        OpKind::Reshape { .. }
        | OpKind::Transpose { .. }
        | OpKind::BroadcastTo { .. }
        | OpKind::Concat { .. }
        | OpKind::Slice { .. }
        | OpKind::Cast { .. } => shaped(op, inputs).map(one),
    }
}

fn one(value: TensorData) -> Vec<TensorData> {
    vec![value]
}

fn expect(inputs: &[TensorData], count: usize) -> EngineResult<&TensorData> {
    if inputs.len() != count {
        return Err(EngineError::InvalidArgument(format!(
            "kernel expects {count} inputs, got {}",
            inputs.len()
        )));
    }
    Ok(&inputs[0])
}

/// Resolves the output metadata through the shared inference rules so
/// kernels and graph bookkeeping can never disagree on shapes.
fn output_info(op: &OpKind, inputs: &[TensorData]) -> EngineResult<VarInfo> {
    let infos: Vec<VarInfo> = inputs
        .iter()
        .map(|value| VarInfo {
            shape: value.shape().clone(),
            dtype: value.dtype(),
            order: Default::default(),
        })
        .collect();
    let mut out = infer_op(op, &infos)?;
    let result = out
        .drain(..)
        .next()
        .ok_or_else(|| EngineError::InvalidArgument("operation declares no outputs".into()));
    result
}

// ----------------------------------------------------------------------
// Elementwise

fn unary(op: UnaryOp, input: &TensorData, threads: usize) -> EngineResult<TensorData> {
    let src = input.as_f32()?;
    let mut out = vec![0.0f32; src.len()];
    let f = |x: f32| -> f32 {
        match op {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Rsqrt => x.sqrt().recip(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Square => x * x,
        }
    };
    for_each_chunk(&mut out, threads, |offset, chunk| {
        for (i, slot) in chunk.iter_mut().enumerate() {
            *slot = f(src[offset + i]);
        }
    });
    TensorData::from_f32(input.shape().clone(), out)
}

fn binary(op: BinaryOp, inputs: &[TensorData], threads: usize) -> EngineResult<TensorData> {
    if inputs.len() != 2 {
        return Err(EngineError::InvalidArgument(format!(
            "binary kernel expects 2 inputs, got {}",
            inputs.len()
        )));
    }
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let out_info = output_info(&OpKind::Binary(op), inputs)?;
    match out_info.dtype {
        DType::F32 => binary_f32(op, lhs, rhs, out_info.shape, threads),
        DType::I32 => binary_i32(op, lhs, rhs, out_info.shape),
        other => Err(EngineError::Unsupported(format!(
            "binary kernel does not support {other:?}"
        ))),
    }
}

fn binary_f32(
    op: BinaryOp,
    lhs: &TensorData,
    rhs: &TensorData,
    shape: Shape,
    threads: usize,
) -> EngineResult<TensorData> {
    let a = lhs.as_f32()?;
    let b = rhs.as_f32()?;
    let len = shape.num_elements();
    let mut out = vec![0.0f32; len];
    let f = |x: f32, y: f32| -> f32 {
        match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Maximum => x.max(y),
            BinaryOp::Minimum => x.min(y),
        }
    };
    // Scalar operands repeat their single element.
    let (a_step, b_step) = (usize::from(a.len() > 1), usize::from(b.len() > 1));
    for_each_chunk(&mut out, threads, |offset, chunk| {
        for (i, slot) in chunk.iter_mut().enumerate() {
            let index = offset + i;
            *slot = f(a[index * a_step], b[index * b_step]);
        }
    });
    TensorData::from_f32(shape, out)
}

fn binary_i32(
    op: BinaryOp,
    lhs: &TensorData,
    rhs: &TensorData,
    shape: Shape,
) -> EngineResult<TensorData> {
    let a = lhs.as_i32()?;
    let b = rhs.as_i32()?;
    let len = shape.num_elements();
    let (a_step, b_step) = (usize::from(a.len() > 1), usize::from(b.len() > 1));
    let mut out = Vec::with_capacity(len);
    for index in 0..len {
        let (x, y) = (a[index * a_step], b[index * b_step]);
        let value = match op {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::Div => {
                if y == 0 {
                    return Err(EngineError::InvalidArgument("integer division by zero".into()));
                }
                x / y
            }
            BinaryOp::Maximum => x.max(y),
            BinaryOp::Minimum => x.min(y),
        };
        out.push(value);
    }
    TensorData::from_i32(shape, out)
}

/// Splits `out` into one contiguous chunk per worker and runs `f` on each.
/// Chunk boundaries depend only on length and worker count, and every
/// element is produced by the same scalar expression, so the result is
/// independent of the actual parallelism.
fn for_each_chunk<F>(out: &mut [f32], threads: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    let threads = threads.max(1);
    if threads == 1 || out.len() < PARALLEL_THRESHOLD {
        f(0, out);
        return;
    }
    let chunk_len = out.len().div_ceil(threads);
    std::thread::scope(|scope| {
        for (i, chunk) in out.chunks_mut(chunk_len).enumerate() {
            let f = &f;
            scope.spawn(move || f(i * chunk_len, chunk));
        }
    });
}

// ----------------------------------------------------------------------
// Reductions

fn reduce(
    op: ReduceOp,
    input: &TensorData,
    axes: &[usize],
    keep_dims: bool,
) -> EngineResult<TensorData> {
    let out_info = output_info(
        &OpKind::Reduce {
            op,
            axes: axes.to_vec(),
            keep_dims,
        },
        std::slice::from_ref(input),
    )?;
    let src = input.as_f32()?;
    let in_dims = input.shape().dims();
    let rank = in_dims.len();

    let reduce_all = axes.is_empty();
    let reduced: Vec<bool> = (0..rank)
        .map(|axis| reduce_all || axes.contains(&axis))
        .collect();

    let out_len = out_info.shape.num_elements();
    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean => 0.0f32,
        ReduceOp::Max => f32::NEG_INFINITY,
        ReduceOp::Min => f32::INFINITY,
    };
    let mut acc = vec![init; out_len];
    let mut counts = vec![0usize; out_len];

    // Strides over the output for the kept axes only.
    let in_strides = input.shape().default_strides();
    let mut kept_strides = vec![0usize; rank];
    {
        let mut stride = 1usize;
        for axis in (0..rank).rev() {
            if !reduced[axis] {
                kept_strides[axis] = stride;
                stride *= in_dims[axis];
            }
        }
    }

    for (flat, value) in src.iter().enumerate() {
        let mut out_index = 0usize;
        for axis in 0..rank {
            if !reduced[axis] {
                let coord = (flat / in_strides[axis]) % in_dims[axis];
                out_index += coord * kept_strides[axis];
            }
        }
        counts[out_index] += 1;
        let slot = &mut acc[out_index];
        match op {
            ReduceOp::Sum | ReduceOp::Mean => *slot += value,
            ReduceOp::Max => *slot = slot.max(*value),
            ReduceOp::Min => *slot = slot.min(*value),
        }
    }

    if op == ReduceOp::Mean {
        for (slot, count) in acc.iter_mut().zip(counts) {
            if count > 0 {
                *slot /= count as f32;
            }
        }
    }
    TensorData::from_f32(out_info.shape, acc)
}

// ----------------------------------------------------------------------
// Contraction

fn matmul(
    inputs: &[TensorData],
    transpose_a: bool,
    transpose_b: bool,
    threads: usize,
) -> EngineResult<TensorData> {
    if inputs.len() != 2 {
        return Err(EngineError::InvalidArgument(format!(
            "matmul kernel expects 2 inputs, got {}",
            inputs.len()
        )));
    }
    let out_info = output_info(
        &OpKind::MatMul {
            transpose_a,
            transpose_b,
        },
        inputs,
    )?;
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let a = lhs.as_f32()?;
    let b = rhs.as_f32()?;
    let a_dims = lhs.shape().dims();
    let b_dims = rhs.shape().dims();
    let (m, k) = if transpose_a {
        (a_dims[1], a_dims[0])
    } else {
        (a_dims[0], a_dims[1])
    };
    let n = if transpose_b { b_dims[0] } else { b_dims[1] };

    let a_at = |row: usize, depth: usize| {
        if transpose_a {
            a[depth * m + row]
        } else {
            a[row * k + depth]
        }
    };
    let b_at = |depth: usize, col: usize| {
        if transpose_b {
            b[col * k + depth]
        } else {
            b[depth * n + col]
        }
    };

    let mut out = vec![0.0f32; m * n];
    let threads = threads.max(1).min(m.max(1));
    let rows_per_chunk = m.div_ceil(threads).max(1);
    std::thread::scope(|scope| {
        for (chunk_index, chunk) in out.chunks_mut(rows_per_chunk * n).enumerate() {
            let a_at = &a_at;
            let b_at = &b_at;
            scope.spawn(move || {
                let row0 = chunk_index * rows_per_chunk;
                for (local_row, row_out) in chunk.chunks_mut(n).enumerate() {
                    let row = row0 + local_row;
                    for (col, slot) in row_out.iter_mut().enumerate() {
                        let mut accum = 0.0f32;
                        for depth in 0..k {
                            accum += a_at(row, depth) * b_at(depth, col);
                        }
                        *slot = accum;
                    }
                }
            });
        }
    });
    TensorData::from_f32(out_info.shape, out)
}

// ----------------------------------------------------------------------
// Data movement

fn shaped(op: &OpKind, inputs: &[TensorData]) -> EngineResult<TensorData> {
    let out_info = output_info(op, inputs)?;
    match op {
        OpKind::Reshape { .. } => inputs[0].with_shape(out_info.shape),
        OpKind::Transpose { perm } => transpose(&inputs[0], perm, out_info.shape),
        OpKind::BroadcastTo { .. } => broadcast(&inputs[0], out_info.shape),
        OpKind::Concat { axis } => concat(inputs, *axis, out_info.shape),
        OpKind::Slice { starts, sizes } => slice(&inputs[0], starts, sizes, out_info.shape),
        OpKind::Cast { dtype } => cast(&inputs[0], *dtype, out_info.shape),
        _ => unreachable!("dispatched in execute"),
    }
}

fn transpose(input: &TensorData, perm: &[usize], out_shape: Shape) -> EngineResult<TensorData> {
    let elem = input.dtype().size_in_bytes();
    let src = input.bytes();
    let in_strides = input.shape().default_strides();
    let out_dims = out_shape.dims().to_vec();
    let out_strides = out_shape.default_strides();
    let len = out_shape.num_elements();
    let mut out = vec![0u8; len * elem];
    for flat in 0..len {
        let mut src_flat = 0usize;
        for (axis, stride) in out_strides.iter().enumerate() {
            let coord = (flat / stride) % out_dims[axis];
            src_flat += coord * in_strides[perm[axis]];
        }
        out[flat * elem..(flat + 1) * elem]
            .copy_from_slice(&src[src_flat * elem..(src_flat + 1) * elem]);
    }
    TensorData::new(input.dtype(), out_shape, out.into_boxed_slice().into())
}

fn broadcast(input: &TensorData, out_shape: Shape) -> EngineResult<TensorData> {
    let elem = input.dtype().size_in_bytes();
    let src = input.bytes();
    let in_dims = input.shape().dims();
    let in_strides = input.shape().default_strides();
    let out_dims = out_shape.dims().to_vec();
    let out_strides = out_shape.default_strides();
    let offset = out_dims.len() - in_dims.len();
    let len = out_shape.num_elements();
    let mut out = vec![0u8; len * elem];
    for flat in 0..len {
        let mut src_flat = 0usize;
        for (axis, dim) in in_dims.iter().enumerate() {
            let coord = (flat / out_strides[offset + axis]) % out_dims[offset + axis];
            if *dim > 1 {
                src_flat += coord * in_strides[axis];
            }
        }
        out[flat * elem..(flat + 1) * elem]
            .copy_from_slice(&src[src_flat * elem..(src_flat + 1) * elem]);
    }
    TensorData::new(input.dtype(), out_shape, out.into_boxed_slice().into())
}

fn concat(inputs: &[TensorData], axis: usize, out_shape: Shape) -> EngineResult<TensorData> {
    let elem = inputs[0].dtype().size_in_bytes();
    let dims = inputs[0].shape().dims();
    // Treat the tensor as (outer, axis, inner) blocks.
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    let mut out = Vec::with_capacity(out_shape.num_elements() * elem);
    for block in 0..outer {
        for input in inputs {
            let axis_len = input.shape().dims()[axis];
            let row = axis_len * inner * elem;
            let src = input.bytes();
            out.extend_from_slice(&src[block * row..(block + 1) * row]);
        }
    }
    TensorData::new(inputs[0].dtype(), out_shape, out.into_boxed_slice().into())
}

fn slice(
    input: &TensorData,
    starts: &[usize],
    sizes: &[usize],
    out_shape: Shape,
) -> EngineResult<TensorData> {
    let elem = input.dtype().size_in_bytes();
    let src = input.bytes();
    let in_strides = input.shape().default_strides();
    let out_strides = out_shape.default_strides();
    let len = out_shape.num_elements();
    let mut out = vec![0u8; len * elem];
    for flat in 0..len {
        let mut src_flat = 0usize;
        for axis in 0..sizes.len() {
            let coord = (flat / out_strides[axis]) % sizes[axis];
            src_flat += (starts[axis] + coord) * in_strides[axis];
        }
        out[flat * elem..(flat + 1) * elem]
            .copy_from_slice(&src[src_flat * elem..(src_flat + 1) * elem]);
    }
    TensorData::new(input.dtype(), out_shape, out.into_boxed_slice().into())
}

fn cast(input: &TensorData, dtype: DType, out_shape: Shape) -> EngineResult<TensorData> {
    if input.dtype() == dtype {
        return input.with_shape(out_shape);
    }
    let scalars: Vec<f32> = match input.dtype() {
        DType::F32 => input.as_f32()?.to_vec(),
        DType::I32 => input.as_i32()?.iter().map(|&x| x as f32).collect(),
        DType::U8 => input.bytes().iter().map(|&x| x as f32).collect(),
    };
    match dtype {
        DType::F32 => TensorData::from_f32(out_shape, scalars),
        DType::I32 => TensorData::from_i32(out_shape, scalars.iter().map(|&x| x as i32).collect()),
        DType::U8 => {
            let bytes: Vec<u8> = scalars.iter().map(|&x| x.clamp(0.0, 255.0) as u8).collect();
            TensorData::new(DType::U8, out_shape, bytes.into_boxed_slice().into())
        }
    }
}
