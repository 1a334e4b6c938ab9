//! Liveness and last-use analysis
//!
//! Standard backward dataflow over the CFG:
//! `live_out[n] = ⋃ live_in[s]` over successors,
//! `live_in[n] = uses[n] ∪ (live_out[n] − defs[n])`.
//! A variable's last use on a path is the block where it is used or defined
//! and no longer live out; the free-point placer turns these into
//! free-insertion points.

use crate::features::memory_analysis::domain::AnalysisContext;
use crate::shared::models::{Cfg, VarId};

pub fn analyze_liveness(cfg: &Cfg, params: &[VarId], ctx: &mut AnalysisContext) {
    let du = cfg.def_use();
    let order = cfg.postorder();

    // Backward worklist; postorder visits successors before predecessors
    let mut changed = true;
    while changed {
        changed = false;
        for &block in &order {
            let n = block.0 as usize;
            let mut out = rustc_hash::FxHashSet::default();
            for succ in cfg.successors(block) {
                out.extend(ctx.live_in[succ.0 as usize].iter().copied());
            }
            let mut live_in = du.uses[n].clone();
            for v in &out {
                if !du.defs[n].contains(v) {
                    live_in.insert(*v);
                }
            }
            if out != ctx.live_out[n] {
                ctx.live_out[n] = out;
                changed = true;
            }
            if live_in != ctx.live_in[n] {
                ctx.live_in[n] = live_in;
                changed = true;
            }
        }
    }

    // Usage records: use sites, first definition, per-path last uses
    for block in &cfg.blocks {
        let n = block.id.0 as usize;
        for v in &du.uses[n] {
            ctx.usage_mut(*v).use_blocks.insert(block.id);
        }
    }

    for param in params {
        ctx.usage_mut(*param).first_def = Some(cfg.entry);
    }
    for block_id in cfg.reverse_postorder() {
        for stmt in &cfg.block(block_id).stmts {
            if let Some(dst) = stmt.defs() {
                let usage = ctx.usage_mut(dst);
                if usage.first_def.is_none() {
                    usage.first_def = Some(block_id);
                }
            }
        }
    }

    for block in &cfg.blocks {
        let n = block.id.0 as usize;
        let mut seen = du.uses[n].clone();
        seen.extend(du.defs[n].iter().copied());
        for v in seen {
            if !ctx.live_out[n].contains(&v) {
                ctx.usage_mut(v).last_use_blocks.push(block.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{
        BasicBlock, BlockId, FnId, Rvalue, Stmt, Terminator, Value,
    };

    /// x defined in bb0, used only on the then-branch (bb1)
    fn branchy_cfg() -> Cfg {
        let x = VarId(0);
        let c = VarId(1);
        Cfg {
            fn_id: FnId(0),
            entry: BlockId(0),
            scopes: Vec::new(),
            blocks: vec![
                BasicBlock {
                    id: BlockId(0),
                    stmts: vec![
                        Stmt::Assign { dst: x, rv: Rvalue::Const(Value::int(1)) },
                        Stmt::Assign { dst: c, rv: Rvalue::Const(Value::int(1)) },
                    ],
                    term: Terminator::Branch {
                        cond: c,
                        then_bb: BlockId(1),
                        else_bb: BlockId(2),
                    },
                },
                BasicBlock {
                    id: BlockId(1),
                    stmts: vec![Stmt::Eval(Rvalue::Use(x))],
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
    fn test_live_out_is_union_of_successor_live_in() {
        let cfg = branchy_cfg();
        let mut ctx = AnalysisContext::new(cfg.fn_id, 2, cfg.blocks.len());
        analyze_liveness(&cfg, &[], &mut ctx);
        // x is live out of bb0 because the then-branch uses it
        assert!(ctx.live_out[0].contains(&VarId(0)));
        // but dead out of bb1 and never live into bb2
        assert!(!ctx.live_out[1].contains(&VarId(0)));
        assert!(!ctx.live_in[2].contains(&VarId(0)));
    }

    #[test]
    fn test_last_use_falls_on_branch_not_merge() {
        let cfg = branchy_cfg();
        let mut ctx = AnalysisContext::new(cfg.fn_id, 2, cfg.blocks.len());
        analyze_liveness(&cfg, &[], &mut ctx);
        let usage = ctx.usage(VarId(0));
        assert_eq!(usage.last_use_blocks, vec![BlockId(1)]);
    }

    #[test]
    fn test_dead_def_is_its_own_last_use() {
        let cfg = branchy_cfg();
        let mut ctx = AnalysisContext::new(cfg.fn_id, 2, cfg.blocks.len());
        analyze_liveness(&cfg, &[], &mut ctx);
        // c is used by the branch terminator of bb0 and dead after
        let usage = ctx.usage(VarId(1));
        assert_eq!(usage.last_use_blocks, vec![BlockId(0)]);
        assert_eq!(usage.first_def, Some(BlockId(0)));
    }
}
