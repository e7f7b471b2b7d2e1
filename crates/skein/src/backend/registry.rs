//! Runtime backend registry for dynamic backend selection.
//!
//! Backend crates register a constructor under their [`BackendKind`]; the
//! executor and session layers look backends up by kind at compute time, so
//! an unavailable backend is an ordinary lookup miss rather than a link
//! error.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::{Backend, BackendKind};

type BackendConstructor = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<BackendKind, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        BackendRegistry {
            backends: RwLock::new(HashMap::new()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Registers a backend constructor under a kind. Later registrations for
/// the same kind replace earlier ones.
pub fn register_backend<F>(kind: BackendKind, constructor: F)
where
    F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
{
    global_registry()
        .backends
        .write()
        .expect("backend registry poisoned")
        .insert(kind, Box::new(constructor));
}

/// Instantiates a backend by kind. Returns `None` when nothing is
/// registered for it.
pub fn create_backend(kind: BackendKind) -> Option<Arc<dyn Backend>> {
    let registry = global_registry()
        .backends
        .read()
        .expect("backend registry poisoned");
    registry.get(&kind).map(|constructor| constructor())
}

/// Reports whether a backend kind has a registered constructor.
pub fn has_backend(kind: BackendKind) -> bool {
    global_registry()
        .backends
        .read()
        .expect("backend registry poisoned")
        .contains_key(&kind)
}

/// Lists every registered backend kind.
pub fn list_backends() -> Vec<BackendKind> {
    global_registry()
        .backends
        .read()
        .expect("backend registry poisoned")
        .keys()
        .copied()
        .collect()
}
