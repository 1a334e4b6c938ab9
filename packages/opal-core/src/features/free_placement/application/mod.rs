//! Free-point placement
//!
//! Computes `frees_at[n]`: the ordered set of variables reclaimed in block
//! `n`. A variable dies either inside a block (its last use is a statement
//! there and it is not live out) or on a branch edge (live out of the
//! predecessor, not live into one successor); edge deaths push the free into
//! that branch, never into the merge. Frees inside one block are ordered in
//! reverse definition order (LIFO).

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::features::memory_analysis::domain::AnalysisContext;
use crate::shared::models::{BlockId, Cfg, VarId};

pub fn place_frees(cfg: &Cfg, ctx: &mut AnalysisContext) {
    let du = cfg.def_use();
    let mut frees: Vec<(BlockId, VarId)> = Vec::new();

    for idx in 0..ctx.vars.len() {
        let var = VarId(idx as u32);
        if !ctx.usage(var).free_strategy.is_inline() {
            continue;
        }

        for block in &cfg.blocks {
            let n = block.id.0 as usize;
            let in_stmts =
                du.uses[n].contains(&var) || du.defs[n].contains(&var);
            let in_term = block.term.uses().contains(&var);
            let live_out = ctx.live_out[n].contains(&var);

            if (in_stmts || in_term) && !live_out {
                // Transferring uses hand ownership away; nothing to free on
                // this path.
                if ctx.usage(var).is_transferred_at(block.id) {
                    continue;
                }
                if !in_term {
                    // Last use is a statement: free at the end of this block
                    frees.push((block.id, var));
                } else {
                    // Last use is the branch condition: the value is dead on
                    // entry to every successor
                    for succ in cfg.successors(block.id) {
                        frees.push((succ, var));
                    }
                }
            } else if live_out {
                // Dies on an edge out of this block: insert the free at the
                // head of each successor that no longer needs it. At a merge
                // this is only legal when every predecessor still carries the
                // value, which holds exactly when it is live out of all of
                // them.
                for succ in cfg.successors(block.id) {
                    let s = succ.0 as usize;
                    if ctx.live_in[s].contains(&var) {
                        continue;
                    }
                    let preds_agree = cfg.predecessors()[s]
                        .iter()
                        .all(|p| ctx.live_out[p.0 as usize].contains(&var));
                    if preds_agree {
                        frees.push((succ, var));
                    }
                }
            }
        }
    }

    // Dedup (a variable can reach the same block once per rule) and order
    // each block's frees LIFO: temporaries are numbered in definition order.
    let mut seen: FxHashSet<(BlockId, VarId)> = FxHashSet::default();
    for (block, var) in frees {
        if seen.insert((block, var)) {
            ctx.frees_at.entry(block).or_default().push(var);
        }
    }
    for list in ctx.frees_at.values_mut() {
        list.sort_by(|a, b| b.cmp(a));
    }
    trace!(fn_id = ?ctx.fn_id, blocks = ctx.frees_at.len(), "frees placed");
}
