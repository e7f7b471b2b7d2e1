//! Reference CPU backend for the skein engine.
//!
//! Registers under [`BackendKind::Cpu`]; call [`register`] once at startup
//! (host boundaries do this during initialization).

mod kernels;

use std::sync::{Arc, Once};

use skein::backend::registry::register_backend;
use skein::graph::OpKind;
use skein::tensor::TensorData;
use skein::{Backend, BackendKind, EngineResult};

/// Scalar reference backend. Deterministic for any thread count.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn execute(
        &self,
        op: &OpKind,
        inputs: &[TensorData],
        threads: usize,
    ) -> EngineResult<Vec<TensorData>> {
        kernels::execute(op, inputs, threads)
    }
}

/// Registers the CPU backend in the global registry. Idempotent.
pub fn register() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register_backend(BackendKind::Cpu, || Arc::new(CpuBackend::new()));
        log::debug!("cpu backend registered");
    });
}
