//! Execution contexts: lazy/eager gating, backend defaults, and cache GC.

mod eval;
mod scope;

pub use scope::{depth, enter, with_executor, ExecutorScope};

use std::sync::{Arc, Mutex, OnceLock};

use crate::backend::{registry, Backend, EngineError, EngineResult, ScheduleConfig};
use crate::graph::node::ExprId;
use crate::graph::store::with_store;
use crate::graph::Variable;

struct ExecutorState {
    lazy: bool,
    schedule: ScheduleConfig,
}

/// Reference-counted execution context. Controls whether expression
/// construction defers computation, which backend evaluates forced values,
/// and how many workers that backend may use.
pub struct Executor {
    state: Mutex<ExecutorState>,
}

impl Executor {
    /// Creates an executor with the given schedule. Backend availability is
    /// checked at compute time, so constructing an executor for an
    /// unregistered backend succeeds and computing through it fails.
    pub fn new(schedule: ScheduleConfig) -> Arc<Executor> {
        Arc::new(Executor {
            state: Mutex::new(ExecutorState {
                lazy: true,
                schedule,
            }),
        })
    }

    /// The process-wide default executor (lazy, default schedule).
    pub fn global() -> Arc<Executor> {
        static GLOBAL: OnceLock<Arc<Executor>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Executor::new(ScheduleConfig::default())))
    }

    /// The innermost scoped executor on this thread, falling back to the
    /// global one.
    pub fn current() -> Arc<Executor> {
        scope::current_scoped().unwrap_or_else(Executor::global)
    }

    pub fn lazy_eval(&self) -> bool {
        self.state.lock().expect("executor state poisoned").lazy
    }

    /// Switches between lazy and eager construction at runtime. Only nodes
    /// created after the switch are affected.
    pub fn set_lazy_eval(&self, lazy: bool) {
        self.state.lock().expect("executor state poisoned").lazy = lazy;
    }

    pub fn schedule(&self) -> ScheduleConfig {
        self.state
            .lock()
            .expect("executor state poisoned")
            .schedule
            .clone()
    }

    pub fn set_schedule(&self, schedule: ScheduleConfig) {
        self.state.lock().expect("executor state poisoned").schedule = schedule;
    }

    /// Resolves the backend named by this executor's schedule, trying the
    /// backup kind when the primary is unavailable.
    fn backend(&self) -> EngineResult<Arc<dyn Backend>> {
        let schedule = self.schedule();
        registry::create_backend(schedule.kind)
            .or_else(|| registry::create_backend(schedule.backup))
            .ok_or_else(|| EngineError::BackendUnavailable(schedule.kind.name().into()))
    }

    /// Forces evaluation of the given variables. Every reachable pending
    /// node is computed exactly once; already-computed values are reused.
    pub fn compute(&self, vars: &[Variable]) -> EngineResult<()> {
        let roots = collect_roots(vars)?;
        let backend = self.backend().ok();
        let threads = self.schedule().worker_count();
        eval::compute_nodes(backend.as_ref(), threads, &roots)
    }

    /// Ensures shapes and backend resources exist for the given variables
    /// without materializing any value.
    pub fn prepare_compute(&self, vars: &[Variable]) -> EngineResult<()> {
        let roots = collect_roots(vars)?;
        eval::prepare_nodes(&roots)
    }

    pub(crate) fn compute_nodes(&self, roots: &[ExprId]) -> EngineResult<()> {
        let backend = self.backend().ok();
        let threads = self.schedule().worker_count();
        eval::compute_nodes(backend.as_ref(), threads, roots)
    }

    /// Discards cached intermediate buffers not denoted by any live
    /// variable. Safe at any time; values stay recomputable.
    pub fn gc(&self) {
        with_store(|store| store.gc());
    }
}

fn collect_roots(vars: &[Variable]) -> EngineResult<Vec<ExprId>> {
    with_store(|store| {
        vars.iter()
            .map(|var| Ok(store.target_of(var.slot_id())?.node))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_stack_restores_in_reverse_order() {
        let a = Executor::new(ScheduleConfig::default());
        let b = Executor::new(ScheduleConfig::default());
        let c = Executor::new(ScheduleConfig::default());

        assert!(Arc::ptr_eq(&Executor::current(), &Executor::global()));
        {
            let _ga = enter(Arc::clone(&a));
            assert!(Arc::ptr_eq(&Executor::current(), &a));
            {
                let _gb = enter(Arc::clone(&b));
                assert!(Arc::ptr_eq(&Executor::current(), &b));
                {
                    let _gc = enter(Arc::clone(&c));
                    assert!(Arc::ptr_eq(&Executor::current(), &c));
                    assert_eq!(depth(), 3);
                }
                assert!(Arc::ptr_eq(&Executor::current(), &b));
            }
            assert!(Arc::ptr_eq(&Executor::current(), &a));
        }
        assert!(Arc::ptr_eq(&Executor::current(), &Executor::global()));
        assert_eq!(depth(), 0);
    }

    #[test]
    fn scope_unwinds_on_panic() {
        let a = Executor::new(ScheduleConfig::default());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = enter(Arc::clone(&a));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn lazy_flag_is_switchable() {
        let executor = Executor::new(ScheduleConfig::default());
        assert!(executor.lazy_eval());
        executor.set_lazy_eval(false);
        assert!(!executor.lazy_eval());
        executor.set_lazy_eval(true);
        assert!(executor.lazy_eval());
    }
}
