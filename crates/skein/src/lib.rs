//! skein: a lazy tensor-graph engine built for cross-language embedding.
//!
//! The crate exposes a reference-counted Variable/Expression graph over a
//! generation-checked arena, thread-scoped executors with a lazy/eager
//! evaluation contract, reusable parameterized modules, and an
//! interpreter/session lifecycle that compiles serialized graphs against
//! pluggable backends.

pub mod backend;
pub mod exec;
pub mod graph;
pub mod interp;
pub mod module;
pub mod ops;
pub mod tensor;

pub use backend::{
    Backend, BackendConfig, BackendKind, EngineError, EngineResult, ScheduleConfig,
};
pub use exec::Executor;
pub use graph::{Expression, Variable};
pub use interp::{Interpreter, Session};
pub use module::{Module, ModuleConfig};
pub use tensor::{DType, RawTensor, Shape, TensorData};
