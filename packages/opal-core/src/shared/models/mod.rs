//! Shared data models
//!
//! Types used across multiple features live here to avoid circular
//! dependencies between feature modules.

pub mod cfg;
pub mod span;
pub mod strategy;
pub mod symbol;
pub mod types;
pub mod value;

pub use cfg::{BasicBlock, BlockId, Callee, Cfg, DefUse, Rvalue, ScopeExtent, Stmt, Terminator};
pub use span::{Location, Span};
pub use strategy::{AllocStrategy, FreeStrategy, RegionId};
pub use symbol::{Binding, BindingKind, FnId, GlobalId, PrimOp, Resolution, SymbolTable, VarId};
pub use types::{FieldDef, FieldStrength, OwnershipEdge, TypeDef, TypeId, TypeRef, TypeRegistry};
pub use value::{Value, ValueKind};
