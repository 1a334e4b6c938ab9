//! Resolved program representation
//!
//! The resolver rewrites the surface tree into `RExpr`, where every
//! identifier use points at its binding record and every special form has a
//! canonical shape. Lambdas have already been lifted to top-level functions
//! by the time an `RExpr` exists.

use serde::{Deserialize, Serialize};

use crate::shared::models::{
    BindingKind, FnId, GlobalId, PrimOp, Span, TypeId, Value, VarId,
};

/// One variable's binding record inside a function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarInfo {
    pub name: String,
    /// Emitted C identifier
    pub c_name: String,
    pub kind: BindingKind,
    pub span: Option<Span>,
}

/// Per-function variable table, indexed by `VarId`
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct VarTable {
    vars: Vec<VarInfo>,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, info: VarInfo) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(info);
        id
    }

    pub fn get(&self, id: VarId) -> &VarInfo {
        &self.vars[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &VarInfo)> {
        self.vars
            .iter()
            .enumerate()
            .map(|(i, v)| (VarId(i as u32), v))
    }
}

/// Call target at resolution level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RCallee {
    Prim(PrimOp),
    Fn(FnId),
    /// Call through an arbitrary expression (lifted lambda value)
    Expr(Box<RExpr>),
}

/// Resolved, canonicalised expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RExpr {
    /// Self-evaluating literal
    Lit(Value),
    /// Quoted datum, emitted as constant structure
    Quote(Value),
    /// Use of a local or parameter
    Ref(VarId),
    /// Read of a top-level binding
    Global(GlobalId),
    /// Address of a lifted or named function
    FnAddr(FnId),
    If(Box<RExpr>, Box<RExpr>, Box<RExpr>),
    Let {
        /// `let*` makes each binding visible to the next RHS
        sequential: bool,
        bindings: Vec<(VarId, RExpr)>,
        body: Box<RExpr>,
    },
    Do(Vec<RExpr>),
    Call {
        callee: RCallee,
        args: Vec<RExpr>,
    },
    /// `deftype` constructor application
    MakeRecord { ty: TypeId, fields: Vec<RExpr> },
    FieldGet {
        ty: TypeId,
        field: usize,
        obj: Box<RExpr>,
    },
    FieldSet {
        ty: TypeId,
        field: usize,
        obj: Box<RExpr>,
        value: Box<RExpr>,
    },
    /// Resolution failed; analysis for the enclosing function stops and the
    /// function is emitted as a stub
    Fail(String),
}

impl RExpr {
    pub fn is_fail(&self) -> bool {
        matches!(self, RExpr::Fail(_))
    }

    /// Walk the expression tree, calling `f` on every node
    pub fn walk(&self, f: &mut impl FnMut(&RExpr)) {
        f(self);
        match self {
            RExpr::If(c, t, e) => {
                c.walk(f);
                t.walk(f);
                e.walk(f);
            }
            RExpr::Let { bindings, body, .. } => {
                for (_, rhs) in bindings {
                    rhs.walk(f);
                }
                body.walk(f);
            }
            RExpr::Do(exprs) => {
                for e in exprs {
                    e.walk(f);
                }
            }
            RExpr::Call { callee, args } => {
                if let RCallee::Expr(e) = callee {
                    e.walk(f);
                }
                for a in args {
                    a.walk(f);
                }
            }
            RExpr::MakeRecord { fields, .. } => {
                for e in fields {
                    e.walk(f);
                }
            }
            RExpr::FieldGet { obj, .. } => obj.walk(f),
            RExpr::FieldSet { obj, value, .. } => {
                obj.walk(f);
                value.walk(f);
            }
            _ => {}
        }
    }
}

/// One function after resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub id: FnId,
    pub name: String,
    pub c_name: String,
    pub params: Vec<VarId>,
    pub vars: VarTable,
    pub body: RExpr,
    pub span: Option<Span>,
    /// Created by lambda lifting rather than a surface `define`
    pub is_lifted: bool,
}

impl FunctionDef {
    pub fn failed(&self) -> Option<&str> {
        match &self.body {
            RExpr::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}

/// One top-level binding with its zero-argument initializer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDef {
    pub id: GlobalId,
    pub name: String,
    pub c_name: String,
    pub init: FnId,
}

/// A resolved compilation unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<FunctionDef>,
    pub globals: Vec<GlobalDef>,
    pub types: crate::shared::models::TypeRegistry,
    /// Function holding the top-level expressions, when any exist
    pub toplevel: Option<FnId>,
}

impl Program {
    pub fn function(&self, id: FnId) -> &FunctionDef {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FnId) -> &mut FunctionDef {
        &mut self.functions[id.0 as usize]
    }
}
