//! Symbol resolution: binding, mangling, canonicalisation, lambda lifting

pub mod application;
pub mod domain;

pub use application::resolve_program;
pub use domain::{FunctionDef, GlobalDef, Program, RCallee, RExpr, VarInfo, VarTable};
