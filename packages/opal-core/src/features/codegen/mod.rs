//! Code generation: the runtime contract and the C emission driver

pub mod domain;
pub mod infrastructure;

pub use domain::{free_call, release_fn, retain_fn, RuntimeFn, RUNTIME_INCLUDE};
pub use infrastructure::driver::{emit_unit, CodegenInput};
pub use infrastructure::emitter::CWriter;
