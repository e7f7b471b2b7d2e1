//! Backend contract: error taxonomy, schedule configuration, and the
//! execution trait implemented by backend crates.

pub mod registry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::OpKind;
use crate::tensor::TensorData;

/// Engine error surfaced to higher layers and mapped onto the C boundary's
/// error-code enumeration.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("allocation failed: {0}")]
    AllocFailed(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("map state violation: {0}")]
    MapState(&'static str),
    #[error("tensor info is not available yet")]
    InfoNotAvailable,
    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stale handle: {0}")]
    StaleHandle(&'static str),
}

/// Convenience alias for results returned by engine routines.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serde(err.to_string())
    }
}

/// Hardware backend families selectable through a schedule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Cpu,
    Gpu,
}

impl BackendKind {
    /// Stable tag used across the C boundary.
    pub fn tag(self) -> i32 {
        match self {
            BackendKind::Cpu => 0,
            BackendKind::Gpu => 1,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(BackendKind::Cpu),
            1 => Some(BackendKind::Gpu),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Gpu => "gpu",
        }
    }
}

/// Numeric precision preference forwarded to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Normal,
    High,
    Low,
}

/// Memory/performance trade-off preference forwarded to backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryMode {
    #[default]
    Normal,
    High,
    Low,
}

/// Backend-specific tuning block carried by a schedule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub precision: Precision,
    pub memory: MemoryMode,
}

/// Schedule configuration consumed by session, module, and executor
/// creation: backend kind, thread count (or backend-specific mode), a
/// fallback kind, and an optional tuning block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub kind: BackendKind,
    /// CPU: number of worker threads; other backends: an opaque mode value.
    pub threads: i32,
    pub backup: BackendKind,
    pub config: Option<BackendConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            kind: BackendKind::Cpu,
            threads: 1,
            backup: BackendKind::Cpu,
            config: None,
        }
    }
}

impl ScheduleConfig {
    /// Effective worker count, clamped to at least one.
    pub fn worker_count(&self) -> usize {
        self.threads.max(1) as usize
    }
}

/// Execution backend: evaluates one graph operation over materialized
/// input values.
pub trait Backend: Send + Sync {
    /// Human-readable backend identifier (e.g. `"cpu"`).
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Executes one operation, returning one value per declared output.
    /// `threads` is the schedule's worker count; implementations must
    /// produce bit-identical results for any thread count.
    fn execute(
        &self,
        op: &OpKind,
        inputs: &[TensorData],
        threads: usize,
    ) -> EngineResult<Vec<TensorData>>;
}
