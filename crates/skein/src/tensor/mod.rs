//! Tensor buffers and value snapshots.

mod buffer;
mod data;
mod dtype;
mod shape;

pub use buffer::{MapGuard, MapMode, MapState, RawTensor};
pub use data::TensorData;
pub use dtype::DType;
pub use shape::Shape;
