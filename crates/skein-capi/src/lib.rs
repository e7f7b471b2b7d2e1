//! Flat C-callable entry-point surface over the skein engine.
//!
//! Conventions, uniform across every entry point:
//! - create-style calls return an opaque pointer, or null on failure;
//!   nothing ever throws or unwinds across the boundary;
//! - every create has exactly one paired destroy, and destroy on null is
//!   a no-op;
//! - accessors documented as *borrowed* return pointers owned by another
//!   live object and must never be destroyed independently;
//! - fallible calls return [`error::SkeinCode`];
//! - an optional trailing callback, when non-null, is invoked exactly
//!   once after the call's blocking work completes, success or failure.

pub mod array;
pub mod error;
pub mod executor;
pub mod expr;
mod handle;
pub mod interp;
pub mod module;
pub mod tensor;

pub use array::*;
pub use error::SkeinCode;
pub use executor::*;
pub use expr::*;
pub use handle::{
    skein_buffer_free, skein_string_array_free, skein_string_free, SkeinCallback,
};
pub use interp::*;
pub use module::*;
pub use tensor::*;

use std::os::raw::c_char;
use std::sync::Once;

/// Registers the bundled backends; called by every entry point.
pub(crate) fn ensure_runtime() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        skein_backend_cpu::register();
    });
}

static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// Library version as a static string; do not free.
#[no_mangle]
pub extern "C" fn skein_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}
