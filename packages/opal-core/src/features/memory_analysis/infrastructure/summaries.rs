//! Interprocedural summaries
//!
//! After per-function analysis each function's parameter modes, return
//! ownership and effect flags are recorded; callers consult them to decide
//! whether an argument is retained or moved. Recursion is seeded with a
//! pessimistic summary (all parameters consumed, return fresh) and re-passed
//! until the map stops changing.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::features::memory_analysis::domain::{
    AnalysisContext, EscapeClass, FnSummary, Ownership, ParamMode, ParamSummary, ReturnOwnership,
    Shape, SummaryMap,
};
use crate::features::memory_analysis::infrastructure::escape::analyze_escape;
use crate::features::memory_analysis::infrastructure::liveness::analyze_liveness;
use crate::features::memory_analysis::infrastructure::ownership::analyze_ownership;
use crate::features::memory_analysis::infrastructure::shape::{refine_var_shapes, TypeShape};
use crate::features::resolve::domain::{FunctionDef, Program};
use crate::shared::models::{Callee, Cfg, FnId, PrimOp, Rvalue, Terminator, TypeId};

const MAX_PASSES: usize = 4;

pub fn compute_summaries(
    program: &Program,
    cfgs: &FxHashMap<FnId, Cfg>,
    type_shapes: &FxHashMap<TypeId, TypeShape>,
) -> SummaryMap {
    let mut summaries: SummaryMap = program
        .functions
        .iter()
        .map(|f| (f.id, FnSummary::pessimistic(f.params.len())))
        .collect();

    for pass in 0..MAX_PASSES {
        let mut changed = false;
        for def in &program.functions {
            if def.failed().is_some() {
                continue;
            }
            let Some(cfg) = cfgs.get(&def.id) else {
                continue;
            };
            let new = summarize_fn(def, cfg, program, type_shapes, &summaries);
            if summaries.get(&def.id) != Some(&new) {
                summaries.insert(def.id, new);
                changed = true;
            }
        }
        if !changed {
            debug!(pass, "summaries reached fixed point");
            break;
        }
    }
    summaries
}

fn summarize_fn(
    def: &FunctionDef,
    cfg: &Cfg,
    program: &Program,
    type_shapes: &FxHashMap<TypeId, TypeShape>,
    summaries: &SummaryMap,
) -> FnSummary {
    let mut ctx = AnalysisContext::new(def.id, def.vars.len(), cfg.blocks.len());
    let own_modes: Vec<ParamMode> = summaries
        .get(&def.id)
        .map(|s| s.params.iter().map(|p| p.mode).collect())
        .unwrap_or_default();

    analyze_liveness(cfg, &def.params, &mut ctx);
    analyze_escape(cfg, summaries, &mut ctx);
    analyze_ownership(cfg, &program.types, summaries, &def.params, &own_modes, &mut ctx);
    refine_var_shapes(cfg, type_shapes, summaries, &mut ctx);

    let ret_var = cfg.blocks.iter().find_map(|b| match b.term {
        Terminator::Return(Some(v)) => Some(v),
        _ => None,
    });

    let params: Vec<ParamSummary> = def
        .params
        .iter()
        .map(|p| {
            let usage = ctx.usage(*p);
            let mode = if ret_var == Some(*p) {
                ParamMode::Passthrough
            } else if usage.escape >= EscapeClass::Captured {
                ParamMode::Captured
            } else if !usage.transfer_sites.is_empty() {
                ParamMode::Consumed
            } else {
                ParamMode::Borrowed
            };
            ParamSummary {
                mode,
                escapes: usage.escape,
            }
        })
        .collect();

    let (ret, ret_shape, ret_tag) = match ret_var {
        None => (ReturnOwnership::None, Shape::Tree, None),
        Some(v) => {
            if let Some(idx) = def.params.iter().position(|p| *p == v) {
                let usage = ctx.usage(v);
                (ReturnOwnership::Passthrough(idx), usage.shape, None)
            } else {
                let usage = ctx.usage(v);
                match usage.ownership {
                    Ownership::Owned => (
                        ReturnOwnership::Fresh,
                        usage.shape,
                        usage.alloc.map(|a| a.tag),
                    ),
                    Ownership::Borrowed => (ReturnOwnership::Borrowed, usage.shape, None),
                    Ownership::Transferred => {
                        (ReturnOwnership::Fresh, usage.shape, usage.alloc.map(|a| a.tag))
                    }
                }
            }
        }
    };

    let mut allocates = ctx.vars.iter().any(|u| u.alloc.is_some());
    let mut may_throw = false;
    let mut may_spawn = false;
    for block in &cfg.blocks {
        for stmt in &block.stmts {
            let Some(rv) = stmt.rvalue() else { continue };
            if let Rvalue::Call { callee, .. } = rv {
                match callee {
                    Callee::Prim(PrimOp::Spawn) => may_spawn = true,
                    Callee::Fn(f) => {
                        if let Some(s) = summaries.get(f) {
                            allocates |= s.allocates;
                            may_throw |= s.may_throw;
                            may_spawn |= s.may_spawn;
                        }
                    }
                    Callee::Dynamic(_) => {
                        may_throw = true;
                        allocates = true;
                    }
                    _ => {}
                }
            }
        }
    }

    FnSummary {
        params,
        ret,
        ret_shape,
        ret_tag,
        allocates,
        may_throw,
        may_spawn,
    }
}
