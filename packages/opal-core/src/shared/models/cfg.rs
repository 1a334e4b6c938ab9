//! Control-flow graph model
//!
//! One `Cfg` per function body. Blocks carry lowered three-address
//! statements; edges are derived from terminators. These types are shared by
//! every analysis and by codegen, so they live in shared/models.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::shared::models::{FnId, GlobalId, PrimOp, TypeId, Value, VarId};

/// Stable block identifier within one function
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Call target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Prim(PrimOp),
    Fn(FnId),
    /// Call through a variable holding a lifted function address
    Dynamic(VarId),
}

/// Right-hand side of an assignment (or an evaluation for effect)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rvalue {
    /// Literal or quoted datum
    Const(Value),
    /// Copy/alias of another variable
    Use(VarId),
    LoadGlobal(GlobalId),
    Call { callee: Callee, args: Vec<VarId> },
    /// Cons-pair allocation
    MakeCell(VarId, VarId),
    /// Record allocation from a `deftype` constructor
    MakeRecord { ty: TypeId, fields: Vec<VarId> },
    MakeArray(Vec<VarId>),
    /// Read of a record field (borrowed view)
    FieldGet { obj: VarId, ty: TypeId, field: usize },
    /// Address of a lifted function
    FnAddr(FnId),
}

impl Rvalue {
    /// Whether evaluating this rvalue allocates a fresh value
    pub fn allocates(&self) -> bool {
        matches!(
            self,
            Rvalue::MakeCell(_, _) | Rvalue::MakeRecord { .. } | Rvalue::MakeArray(_)
        )
    }

    /// Variables read by this rvalue
    pub fn operands(&self) -> Vec<VarId> {
        match self {
            Rvalue::Const(_) | Rvalue::LoadGlobal(_) | Rvalue::FnAddr(_) => Vec::new(),
            Rvalue::Use(v) => vec![*v],
            Rvalue::Call { callee, args } => {
                let mut ops = args.clone();
                if let Callee::Dynamic(v) = callee {
                    ops.push(*v);
                }
                ops
            }
            Rvalue::MakeCell(head, tail) => vec![*head, *tail],
            Rvalue::MakeRecord { fields, .. } => fields.clone(),
            Rvalue::MakeArray(items) => items.clone(),
            Rvalue::FieldGet { obj, .. } => vec![*obj],
        }
    }
}

/// One lowered statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Assign { dst: VarId, rv: Rvalue },
    /// Evaluation for effect only
    Eval(Rvalue),
    FieldSet { obj: VarId, ty: TypeId, field: usize, value: VarId },
    StoreGlobal { global: GlobalId, value: VarId },
}

impl Stmt {
    pub fn defs(&self) -> Option<VarId> {
        match self {
            Stmt::Assign { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    pub fn uses(&self) -> Vec<VarId> {
        match self {
            Stmt::Assign { rv, .. } | Stmt::Eval(rv) => rv.operands(),
            Stmt::FieldSet { obj, value, .. } => vec![*obj, *value],
            Stmt::StoreGlobal { value, .. } => vec![*value],
        }
    }

    pub fn rvalue(&self) -> Option<&Rvalue> {
        match self {
            Stmt::Assign { rv, .. } | Stmt::Eval(rv) => Some(rv),
            _ => None,
        }
    }
}

/// Block terminator; edges are derived from these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    Fallthrough(BlockId),
    Branch { cond: VarId, then_bb: BlockId, else_bb: BlockId },
    Return(Option<VarId>),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Fallthrough(next) => vec![*next],
            Terminator::Branch { then_bb, else_bb, .. } => vec![*then_bb, *else_bb],
            Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
        }
    }

    pub fn uses(&self) -> Vec<VarId> {
        match self {
            Terminator::Branch { cond, .. } => vec![*cond],
            Terminator::Return(Some(v)) => vec![*v],
            _ => Vec::new(),
        }
    }
}

/// Basic block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub stmts: Vec<Stmt>,
    pub term: Terminator,
}

/// Extent of one lexical `let` scope, recorded during lowering for region
/// inference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeExtent {
    pub vars: Vec<VarId>,
    pub entry: BlockId,
    /// Block holding the scope's single exit point
    pub exit: BlockId,
    /// Nesting depth, outermost `let` is 0
    pub depth: u32,
}

/// Per-block def/use sets
#[derive(Debug, Clone)]
pub struct DefUse {
    pub defs: Vec<FxHashSet<VarId>>,
    pub uses: Vec<FxHashSet<VarId>>,
}

/// Control-flow graph for one function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cfg {
    pub fn_id: FnId,
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
    pub scopes: Vec<ScopeExtent>,
}

impl Cfg {
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.block(id).term.successors()
    }

    /// Predecessor lists, indexed by block
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.term.successors() {
                preds[succ.0 as usize].push(block.id);
            }
        }
        preds
    }

    /// Blocks whose terminator leaves the function
    pub fn exit_blocks(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|b| matches!(b.term, Terminator::Return(_) | Terminator::Unreachable))
            .map(|b| b.id)
            .collect()
    }

    /// Reverse post-order from the entry block.
    ///
    /// The worklist analyses iterate in this order so forward transfer
    /// functions converge quickly.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    pub fn postorder(&self) -> Vec<BlockId> {
        let mut visited = FxHashSet::default();
        let mut order = Vec::with_capacity(self.blocks.len());
        // Iterative DFS keeps deep CFGs off the call stack
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry);
        while let Some((block, child)) = stack.pop() {
            let succs = self.successors(block);
            if child < succs.len() {
                stack.push((block, child + 1));
                let next = succs[child];
                if visited.insert(next) {
                    stack.push((next, 0));
                }
            } else {
                order.push(block);
            }
        }
        order
    }

    /// Compute def/use sets for every block (statements plus terminator)
    pub fn def_use(&self) -> DefUse {
        let mut defs = vec![FxHashSet::default(); self.blocks.len()];
        let mut uses = vec![FxHashSet::default(); self.blocks.len()];
        for block in &self.blocks {
            let idx = block.id.0 as usize;
            for stmt in &block.stmts {
                for used in stmt.uses() {
                    uses[idx].insert(used);
                }
                if let Some(dst) = stmt.defs() {
                    defs[idx].insert(dst);
                }
            }
            for used in block.term.uses() {
                uses[idx].insert(used);
            }
        }
        DefUse { defs, uses }
    }

    /// Allocation sites: (block, statement index, destination)
    pub fn alloc_sites(&self) -> Vec<(BlockId, usize, VarId)> {
        let mut sites = Vec::new();
        for block in &self.blocks {
            for (i, stmt) in block.stmts.iter().enumerate() {
                if let Stmt::Assign { dst, rv } = stmt {
                    if rv.allocates() {
                        sites.push((block.id, i, *dst));
                    }
                }
            }
        }
        sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Cfg {
        // bb0 -> bb1 / bb2 -> bb3
        let v0 = VarId(0);
        Cfg {
            fn_id: FnId(0),
            entry: BlockId(0),
            scopes: Vec::new(),
            blocks: vec![
                BasicBlock {
                    id: BlockId(0),
                    stmts: vec![Stmt::Assign {
                        dst: v0,
                        rv: Rvalue::Const(Value::int(1)),
                    }],
                    term: Terminator::Branch {
                        cond: v0,
                        then_bb: BlockId(1),
                        else_bb: BlockId(2),
                    },
                },
                BasicBlock {
                    id: BlockId(1),
                    stmts: vec![Stmt::Eval(Rvalue::Use(v0))],
                    term: Terminator::Fallthrough(BlockId(3)),
                },
                BasicBlock {
                    id: BlockId(2),
                    stmts: vec![],
                    term: Terminator::Fallthrough(BlockId(3)),
                },
                BasicBlock {
                    id: BlockId(3),
                    stmts: vec![],
                    term: Terminator::Return(None),
                },
            ],
        }
    }

    #[test]
    fn test_predecessors() {
        let cfg = diamond();
        let preds = cfg.predecessors();
        assert_eq!(preds[3], vec![BlockId(1), BlockId(2)]);
        assert!(preds[0].is_empty());
    }

    #[test]
    fn test_reverse_postorder_starts_at_entry() {
        let cfg = diamond();
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], BlockId(0));
        assert_eq!(*rpo.last().unwrap(), BlockId(3));
    }

    #[test]
    fn test_def_use_includes_terminator() {
        let cfg = diamond();
        let du = cfg.def_use();
        assert!(du.defs[0].contains(&VarId(0)));
        // Branch condition counts as a use
        assert!(du.uses[0].contains(&VarId(0)));
        assert!(du.uses[1].contains(&VarId(0)));
    }

    #[test]
    fn test_exit_blocks() {
        let cfg = diamond();
        assert_eq!(cfg.exit_blocks(), vec![BlockId(3)]);
    }
}
