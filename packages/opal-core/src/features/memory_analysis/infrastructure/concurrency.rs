//! Concurrency inference
//!
//! A variable is `ThreadShared` when it flows through a channel send, is
//! captured by a spawned function, or is stored into a global. Everything
//! else stays `ThreadLocal` and uses the non-atomic reference counter.
//! Sharing propagates backwards through moves and into the children of
//! shared structures.

use crate::features::memory_analysis::domain::{AnalysisContext, ThreadClass};
use crate::shared::models::{Callee, Cfg, PrimOp, Rvalue, Stmt, VarId};

pub fn analyze_concurrency(cfg: &Cfg, ctx: &mut AnalysisContext) {
    let mut changed = true;
    while changed {
        changed = false;
        for block in &cfg.blocks {
            for stmt in &block.stmts {
                match stmt {
                    Stmt::Assign { dst, rv } => {
                        // Seeds: values crossing a thread boundary
                        changed |= seed_from_rvalue(rv, ctx);
                        // Children of a shared structure are shared
                        if ctx.usage(*dst).thread == ThreadClass::ThreadShared {
                            for op in rv.operands() {
                                changed |= share(ctx, op);
                            }
                        }
                    }
                    Stmt::Eval(rv) => {
                        changed |= seed_from_rvalue(rv, ctx);
                    }
                    Stmt::FieldSet { obj, value, .. } => {
                        if ctx.usage(*obj).thread == ThreadClass::ThreadShared {
                            changed |= share(ctx, *value);
                        }
                    }
                    Stmt::StoreGlobal { value, .. } => {
                        changed |= share(ctx, *value);
                    }
                }
            }
        }
    }
}

fn seed_from_rvalue(rv: &Rvalue, ctx: &mut AnalysisContext) -> bool {
    let mut changed = false;
    if let Rvalue::Call { callee, args } = rv {
        match callee {
            Callee::Prim(PrimOp::ChanSend) => {
                if let Some(value) = args.get(1) {
                    changed |= share(ctx, *value);
                }
            }
            Callee::Prim(PrimOp::Spawn) => {
                for arg in args.iter().skip(1) {
                    changed |= share(ctx, *arg);
                }
            }
            _ => {}
        }
    }
    changed
}

fn share(ctx: &mut AnalysisContext, var: VarId) -> bool {
    let usage = ctx.usage_mut(var);
    if usage.thread == ThreadClass::ThreadLocal {
        usage.thread = ThreadClass::ThreadShared;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{BasicBlock, BlockId, FnId, Terminator};

    #[test]
    fn test_sent_value_and_its_children_are_shared() {
        // v0 = cell(v1, v2); send(v3, v0)
        let cfg = Cfg {
            fn_id: FnId(0),
            entry: BlockId(0),
            scopes: Vec::new(),
            blocks: vec![BasicBlock {
                id: BlockId(0),
                stmts: vec![
                    Stmt::Assign {
                        dst: VarId(0),
                        rv: Rvalue::MakeCell(VarId(1), VarId(2)),
                    },
                    Stmt::Eval(Rvalue::Call {
                        callee: Callee::Prim(PrimOp::ChanSend),
                        args: vec![VarId(3), VarId(0)],
                    }),
                ],
                term: Terminator::Return(None),
            }],
        };
        let mut ctx = AnalysisContext::new(FnId(0), 4, 1);
        analyze_concurrency(&cfg, &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).thread, ThreadClass::ThreadShared);
        assert_eq!(ctx.usage(VarId(1)).thread, ThreadClass::ThreadShared);
        // The channel handle itself is not the payload
        assert_eq!(ctx.usage(VarId(3)).thread, ThreadClass::ThreadLocal);
    }

    #[test]
    fn test_local_data_stays_thread_local() {
        let cfg = Cfg {
            fn_id: FnId(0),
            entry: BlockId(0),
            scopes: Vec::new(),
            blocks: vec![BasicBlock {
                id: BlockId(0),
                stmts: vec![Stmt::Assign {
                    dst: VarId(0),
                    rv: Rvalue::MakeCell(VarId(1), VarId(2)),
                }],
                term: Terminator::Return(Some(VarId(0))),
            }],
        };
        let mut ctx = AnalysisContext::new(FnId(0), 3, 1);
        analyze_concurrency(&cfg, &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).thread, ThreadClass::ThreadLocal);
    }
}
