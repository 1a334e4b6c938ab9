//! Symbol bindings and the scoped symbol table
//!
//! Shared across the resolver, the CFG builder and codegen, so these types
//! live in shared/models rather than inside a single feature.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Per-function variable index (parameters, locals, temporaries)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VarId(pub u32);

/// Index of a user-defined (or lifted) function in the program
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FnId(pub u32);

/// Index of a top-level binding initialised before `main`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GlobalId(pub u32);

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// What kind of definition a name is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingKind {
    Local,
    Parameter,
    TopLevel,
    Primitive,
}

/// Binding record for one resolved identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Surface identifier
    pub name: String,
    /// Emitted C identifier
    pub mangled: String,
    pub kind: BindingKind,
    /// Scope that introduced this binding
    pub scope_id: u32,
}

/// Fixed primitive operations and their arities.
///
/// Pre-seeded into the symbol table before resolution; each is bound to a
/// known mangled name. The concurrency surface (`chan`, `send`, `recv`,
/// `close`, `spawn`) is part of the primitive set so the concurrency
/// inference has sites to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimOp {
    Add,
    Sub,
    Mul,
    Div,
    NumEq,
    Lt,
    Gt,
    Cons,
    Car,
    Cdr,
    IsNull,
    Display,
    Print,
    Newline,
    ChanNew,
    ChanSend,
    ChanRecv,
    ChanClose,
    Spawn,
}

impl PrimOp {
    /// Surface spelling
    pub fn name(&self) -> &'static str {
        match self {
            PrimOp::Add => "+",
            PrimOp::Sub => "-",
            PrimOp::Mul => "*",
            PrimOp::Div => "/",
            PrimOp::NumEq => "=",
            PrimOp::Lt => "<",
            PrimOp::Gt => ">",
            PrimOp::Cons => "cons",
            PrimOp::Car => "car",
            PrimOp::Cdr => "cdr",
            PrimOp::IsNull => "null?",
            PrimOp::Display => "display",
            PrimOp::Print => "print",
            PrimOp::Newline => "newline",
            PrimOp::ChanNew => "chan",
            PrimOp::ChanSend => "send",
            PrimOp::ChanRecv => "recv",
            PrimOp::ChanClose => "close",
            PrimOp::Spawn => "spawn",
        }
    }

    /// Fixed arity. `Spawn` is variadic above its minimum (function plus
    /// captured arguments), encoded as the minimum here.
    pub fn arity(&self) -> usize {
        match self {
            PrimOp::Newline => 0,
            PrimOp::Car | PrimOp::Cdr | PrimOp::IsNull => 1,
            PrimOp::Display | PrimOp::Print => 1,
            PrimOp::ChanNew | PrimOp::ChanClose => 1,
            PrimOp::ChanRecv => 1,
            PrimOp::ChanSend => 2,
            PrimOp::Spawn => 1,
            _ => 2,
        }
    }

    pub fn is_variadic(&self) -> bool {
        matches!(self, PrimOp::Spawn)
    }

    pub fn all() -> &'static [PrimOp] {
        &[
            PrimOp::Add,
            PrimOp::Sub,
            PrimOp::Mul,
            PrimOp::Div,
            PrimOp::NumEq,
            PrimOp::Lt,
            PrimOp::Gt,
            PrimOp::Cons,
            PrimOp::Car,
            PrimOp::Cdr,
            PrimOp::IsNull,
            PrimOp::Display,
            PrimOp::Print,
            PrimOp::Newline,
            PrimOp::ChanNew,
            PrimOp::ChanSend,
            PrimOp::ChanRecv,
            PrimOp::ChanClose,
            PrimOp::Spawn,
        ]
    }
}

/// What a name resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Var(VarId),
    Fn(FnId),
    Global(GlobalId),
    Prim(PrimOp),
    /// A `deftype` constructor, by type index
    Ctor(u32),
}

/// Lexically scoped symbol table.
///
/// Shadowing creates a new entry in an inner scope; lookup walks outward.
/// Within one scope each identifier maps to at most one record.
#[derive(Debug, Default)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    /// Indices into `scopes` forming the active chain, innermost last
    active: Vec<usize>,
    next_scope_id: u32,
}

#[derive(Debug)]
struct Scope {
    id: u32,
    entries: FxHashMap<String, Resolution>,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        // Scope 0 is the top level
        table.enter_scope();
        table
    }

    pub fn enter_scope(&mut self) -> u32 {
        let id = self.next_scope_id;
        self.next_scope_id += 1;
        self.scopes.push(Scope {
            id,
            entries: FxHashMap::default(),
        });
        self.active.push(self.scopes.len() - 1);
        id
    }

    pub fn exit_scope(&mut self) {
        debug_assert!(self.active.len() > 1, "cannot exit the top-level scope");
        self.active.pop();
    }

    pub fn current_scope_id(&self) -> u32 {
        let idx = *self.active.last().expect("symbol table has no active scope");
        self.scopes[idx].id
    }

    /// Bind `name` in the current scope.
    ///
    /// Returns `false` when the name is already bound in this scope (the
    /// uniqueness invariant); the existing entry is left untouched.
    pub fn bind(&mut self, name: &str, resolution: Resolution) -> bool {
        let idx = *self.active.last().expect("symbol table has no active scope");
        let entries = &mut self.scopes[idx].entries;
        if entries.contains_key(name) {
            return false;
        }
        entries.insert(name.to_string(), resolution);
        true
    }

    /// Look up `name`, walking scopes outward
    pub fn lookup(&self, name: &str) -> Option<Resolution> {
        for &idx in self.active.iter().rev() {
            if let Some(res) = self.scopes[idx].entries.get(name) {
                return Some(*res);
            }
        }
        None
    }

    /// Look up only in the current scope (shadowing checks)
    pub fn lookup_local(&self, name: &str) -> Option<Resolution> {
        let idx = *self.active.last()?;
        self.scopes[idx].entries.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_outward() {
        let mut table = SymbolTable::new();
        table.bind("x", Resolution::Var(VarId(0)));
        table.enter_scope();
        assert_eq!(table.lookup("x"), Some(Resolution::Var(VarId(0))));
    }

    #[test]
    fn test_shadowing_creates_inner_entry() {
        let mut table = SymbolTable::new();
        table.bind("x", Resolution::Var(VarId(0)));
        table.enter_scope();
        table.bind("x", Resolution::Var(VarId(1)));
        assert_eq!(table.lookup("x"), Some(Resolution::Var(VarId(1))));
        table.exit_scope();
        assert_eq!(table.lookup("x"), Some(Resolution::Var(VarId(0))));
    }

    #[test]
    fn test_duplicate_binding_in_scope_rejected() {
        let mut table = SymbolTable::new();
        assert!(table.bind("x", Resolution::Var(VarId(0))));
        assert!(!table.bind("x", Resolution::Var(VarId(1))));
        assert_eq!(table.lookup("x"), Some(Resolution::Var(VarId(0))));
    }

    #[test]
    fn test_primitive_arities() {
        assert_eq!(PrimOp::Add.arity(), 2);
        assert_eq!(PrimOp::Newline.arity(), 0);
        assert_eq!(PrimOp::ChanSend.arity(), 2);
    }
}
