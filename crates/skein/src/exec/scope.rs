//! Thread-local "current executor" stack with RAII scoping.
//!
//! Entering a scope pushes an executor as current for the dynamic extent
//! of the guard; dropping the guard pops it. Scopes nest and unwind in
//! reverse order of entry, including on panic paths.

use std::cell::RefCell;
use std::sync::Arc;

use super::Executor;

thread_local! {
    static EXECUTOR_STACK: RefCell<Vec<Arc<Executor>>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard that restores the previous current executor when dropped.
pub struct ExecutorScope {
    active: bool,
}

impl Drop for ExecutorScope {
    fn drop(&mut self) {
        if self.active {
            EXECUTOR_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

/// Pushes `executor` as the thread's current executor and returns the
/// guard that pops it.
pub fn enter(executor: Arc<Executor>) -> ExecutorScope {
    EXECUTOR_STACK.with(|stack| {
        stack.borrow_mut().push(executor);
    });
    ExecutorScope { active: true }
}

/// Runs `f` with `executor` installed as current.
pub fn with_executor<F, R>(executor: Arc<Executor>, f: F) -> R
where
    F: FnOnce() -> R,
{
    let guard = enter(executor);
    let result = f();
    drop(guard);
    result
}

/// The innermost executor pushed on this thread, if any.
pub(crate) fn current_scoped() -> Option<Arc<Executor>> {
    EXECUTOR_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Current nesting depth; debug instrumentation.
pub fn depth() -> usize {
    EXECUTOR_STACK.with(|stack| stack.borrow().len())
}
