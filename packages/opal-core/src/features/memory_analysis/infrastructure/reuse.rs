//! Reuse analysis
//!
//! Finds free-then-alloc pairs: a variable whose storage dies immediately
//! before an allocation of the same size tier, in the same block, with no
//! call in between. The freed variable must be owned, unique (shape Tree),
//! local and thread-local so its storage can be rewritten in place.

use tracing::debug;

use crate::features::memory_analysis::domain::{
    AnalysisContext, Ownership, ReuseCandidate, Shape, ThreadClass,
};
use crate::shared::models::{Cfg, Rvalue, Stmt, TypeRegistry, VarId};

pub fn analyze_reuse(cfg: &Cfg, types: &TypeRegistry, ctx: &mut AnalysisContext) {
    let record_fields = |ty| types.get(ty).fields.len();
    let mut claimed: rustc_hash::FxHashSet<VarId> = rustc_hash::FxHashSet::default();

    for block in &cfg.blocks {
        let n = block.id.0 as usize;

        // Last position (statement index) at which each variable occurs in
        // this block; variables used by the terminator never die here.
        let mut last_pos: rustc_hash::FxHashMap<VarId, usize> = rustc_hash::FxHashMap::default();
        for (i, stmt) in block.stmts.iter().enumerate() {
            for v in stmt.uses() {
                last_pos.insert(v, i);
            }
            if let Some(d) = stmt.defs() {
                last_pos.insert(d, i);
            }
        }
        for v in block.term.uses() {
            last_pos.remove(&v);
        }

        let is_call = |stmt: &Stmt| {
            matches!(
                stmt,
                Stmt::Assign { rv: Rvalue::Call { .. }, .. } | Stmt::Eval(Rvalue::Call { .. })
            )
        };

        for (i, stmt) in block.stmts.iter().enumerate() {
            let Stmt::Assign { dst, rv } = stmt else {
                continue;
            };
            if !rv.allocates() {
                continue;
            }
            let Some(alloc) = ctx.usage(*dst).alloc else {
                continue;
            };
            let tier = alloc.tag.size_tier(record_fields);
            let operands = rv.operands();

            // Pick the most recently dead eligible variable
            let mut best: Option<(usize, VarId)> = None;
            for (&v, &pos) in &last_pos {
                if pos >= i || v == *dst || operands.contains(&v) || claimed.contains(&v) {
                    continue;
                }
                let usage = ctx.usage(v);
                let eligible = usage.ownership == Ownership::Owned
                    && usage.transfer_sites.is_empty()
                    && usage.escape.is_local()
                    && usage.shape == Shape::Tree
                    && usage.thread == ThreadClass::ThreadLocal
                    && usage.region.is_none()
                    && !ctx.live_out[n].contains(&v)
                    && usage.last_use_blocks == vec![block.id];
                if !eligible {
                    continue;
                }
                let Some(freed_alloc) = usage.alloc else {
                    continue;
                };
                if freed_alloc.tag.size_tier(record_fields) != tier {
                    continue;
                }
                // No reuse across call boundaries
                if block.stmts[pos + 1..i].iter().any(is_call) {
                    continue;
                }
                if best.map(|(p, _)| pos > p).unwrap_or(true) {
                    best = Some((pos, v));
                }
            }

            if let Some((_, freed)) = best {
                debug!(?freed, alloc_var = ?dst, block = %block.id, "reuse candidate");
                claimed.insert(freed);
                claimed.insert(*dst);
                ctx.reuse.push(ReuseCandidate {
                    freed,
                    alloc_var: *dst,
                    block: block.id,
                    stmt_idx: i,
                });
            }
        }
    }
}
