//! Escape analysis
//!
//! Lattice: `Local < Returned < Captured < Global`. The transfer function is
//! monotone; a worklist over reverse post-order runs to a fixed point. A
//! variable is `Returned` when it flows to the function's return, `Captured`
//! when stored into a heap object that itself is not `Local`, and `Global`
//! when assigned to a top-level binding.

use tracing::trace;

use crate::features::memory_analysis::domain::{
    AnalysisContext, EscapeClass, FnSummary, ParamMode, SummaryMap,
};
use crate::features::memory_analysis::infrastructure::prims::prim_param_mode;
use crate::shared::models::{Callee, Cfg, Rvalue, Stmt, Terminator, VarId};

pub fn analyze_escape(cfg: &Cfg, summaries: &SummaryMap, ctx: &mut AnalysisContext) {
    let rpo = cfg.reverse_postorder();

    // The lattice has height 4, so iteration count is bounded by
    // 4 × |vars| joins; in practice two sweeps settle most functions.
    let mut changed = true;
    while changed {
        changed = false;
        for &block_id in &rpo {
            let block = cfg.block(block_id);
            for stmt in &block.stmts {
                changed |= transfer_stmt(stmt, summaries, ctx);
            }
            if let Terminator::Return(Some(v)) = &block.term {
                changed |= join(ctx, *v, EscapeClass::Returned);
            }
        }
    }

    for usage in &mut ctx.vars {
        if usage.escape >= EscapeClass::Captured {
            usage.is_captured = true;
        }
    }
    trace!(fn_id = ?cfg.fn_id, "escape analysis converged");
}

fn join(ctx: &mut AnalysisContext, var: VarId, class: EscapeClass) -> bool {
    let usage = ctx.usage_mut(var);
    let joined = usage.escape.join(class);
    if joined != usage.escape {
        usage.escape = joined;
        true
    } else {
        false
    }
}

fn class_of(ctx: &AnalysisContext, var: VarId) -> EscapeClass {
    ctx.usage(var).escape
}

fn transfer_stmt(stmt: &Stmt, summaries: &SummaryMap, ctx: &mut AnalysisContext) -> bool {
    let mut changed = false;
    match stmt {
        Stmt::Assign { dst, rv } => match rv {
            // A move aliases the same value: the source escapes wherever the
            // destination does.
            Rvalue::Use(v) => {
                let dst_class = class_of(ctx, *dst);
                changed |= join(ctx, *v, dst_class);
            }
            // Children stored into a heap object escape once the object
            // itself is observable outside the scope.
            Rvalue::MakeCell(head, tail) => {
                if class_of(ctx, *dst) > EscapeClass::Local {
                    changed |= join(ctx, *head, EscapeClass::Captured);
                    changed |= join(ctx, *tail, EscapeClass::Captured);
                }
            }
            Rvalue::MakeRecord { fields, .. } | Rvalue::MakeArray(fields) => {
                if class_of(ctx, *dst) > EscapeClass::Local {
                    for f in fields.clone() {
                        changed |= join(ctx, f, EscapeClass::Captured);
                    }
                }
            }
            // A field view escaping means the object's contents escape
            Rvalue::FieldGet { obj, .. } => {
                let dst_class = class_of(ctx, *dst);
                changed |= join(ctx, *obj, dst_class);
            }
            Rvalue::Call { callee, args } => {
                changed |= transfer_call(callee, args, summaries, ctx);
            }
            Rvalue::Const(_) | Rvalue::LoadGlobal(_) | Rvalue::FnAddr(_) => {}
        },
        Stmt::Eval(rv) => {
            if let Rvalue::Call { callee, args } = rv {
                changed |= transfer_call(callee, args, summaries, ctx);
            }
        }
        Stmt::FieldSet { obj, value, .. } => {
            if class_of(ctx, *obj) > EscapeClass::Local {
                changed |= join(ctx, *value, EscapeClass::Captured);
            }
        }
        Stmt::StoreGlobal { value, .. } => {
            changed |= join(ctx, *value, EscapeClass::Global);
        }
    }
    changed
}

fn transfer_call(
    callee: &Callee,
    args: &[VarId],
    summaries: &SummaryMap,
    ctx: &mut AnalysisContext,
) -> bool {
    let mut changed = false;
    match callee {
        Callee::Prim(op) => {
            for (i, arg) in args.iter().enumerate() {
                if prim_param_mode(*op, i) == ParamMode::Captured {
                    changed |= join(ctx, *arg, EscapeClass::Captured);
                }
            }
        }
        Callee::Fn(f) => {
            let pessimistic = FnSummary::pessimistic(args.len());
            let summary = summaries.get(f).unwrap_or(&pessimistic);
            for (i, arg) in args.iter().enumerate() {
                let escapes = summary
                    .params
                    .get(i)
                    .map(|p| p.mode == ParamMode::Captured || !p.escapes.is_local())
                    .unwrap_or(true);
                if escapes {
                    changed |= join(ctx, *arg, EscapeClass::Captured);
                }
            }
        }
        // Nothing is known about the target; assume the worst
        Callee::Dynamic(_) => {
            for arg in args {
                changed |= join(ctx, *arg, EscapeClass::Captured);
            }
        }
    }
    changed
}
