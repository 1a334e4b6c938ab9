//! Strategy selection
//!
//! Merges the analysis results for each variable and allocation site into a
//! single `FreeStrategy` and `AllocStrategy`. The selection matrix:
//!
//! | Shape   | Cycle status | Mutable | Strategy      |
//! |---------|--------------|---------|---------------|
//! | Tree    | –            | any     | Unique        |
//! | DAG     | –            | any     | Rc            |
//! | Cyclic  | broken       | any     | Rc            |
//! | Cyclic  | unbroken     | frozen  | SccRc         |
//! | Cyclic  | unbroken     | mutable | SymmetricRc   |
//! | Unknown | –            | –       | SymmetricRc   |
//!
//! Tie-breaks: reuse > region > stack > heap for allocation; none >
//! region-exit > unique > rc > scc/symmetric for free. Anything the
//! analyses could not prove falls back to `SymmetricRc` + `Heap`, which is
//! always sound.

use tracing::{debug, warn};

use crate::config::CompilerConfig;
use crate::features::memory_analysis::domain::{
    AnalysisContext, Ownership, Shape, ThreadClass,
};
use crate::shared::models::{AllocStrategy, FreeStrategy, VarId};

pub fn select_strategies(config: &CompilerConfig, ctx: &mut AnalysisContext) {
    for idx in 0..ctx.vars.len() {
        let var = VarId(idx as u32);
        let alloc_strategy = select_alloc(ctx, var);
        let free_strategy = select_free(config, ctx, var, alloc_strategy);
        let usage = ctx.usage_mut(var);
        usage.alloc_strategy = alloc_strategy;
        usage.free_strategy = free_strategy;
    }
    debug!(fn_id = ?ctx.fn_id, fallbacks = ctx.fallbacks, "strategies selected");
}

fn select_alloc(ctx: &AnalysisContext, var: VarId) -> Option<AllocStrategy> {
    let usage = ctx.usage(var);
    let site = usage.alloc?;
    // Tie-break order: reuse > region > stack > heap
    if let Some(cand) = ctx.reuse_into(var) {
        return Some(AllocStrategy::ReuseOf(cand.freed));
    }
    if let Some(region) = usage.region {
        return Some(AllocStrategy::Region(region));
    }
    let stack_ok = usage.escape.is_local()
        && usage.shape == Shape::Tree
        && site.tag.is_scalar()
        && !usage.alloc_is_call
        && usage.thread == ThreadClass::ThreadLocal
        && usage.transfer_sites.is_empty();
    if stack_ok {
        return Some(AllocStrategy::Stack);
    }
    Some(AllocStrategy::Heap)
}

fn select_free(
    config: &CompilerConfig,
    ctx: &mut AnalysisContext,
    var: VarId,
    alloc_strategy: Option<AllocStrategy>,
) -> FreeStrategy {
    let usage = ctx.usage(var);

    // Borrowed values are never ours to free
    if usage.ownership == Ownership::Borrowed {
        return FreeStrategy::None;
    }
    // The reuse rewrite consumes the storage at the allocation site
    if ctx.reuse_of(var).is_some() {
        return FreeStrategy::None;
    }
    if usage.region.is_some() {
        return FreeStrategy::RegionExit;
    }
    if alloc_strategy == Some(AllocStrategy::Stack) {
        return FreeStrategy::None;
    }
    // Transferred on every path: ownership has left by the last use
    if !usage.last_use_blocks.is_empty()
        && usage
            .last_use_blocks
            .iter()
            .all(|b| usage.transfer_sites.contains(b))
    {
        return FreeStrategy::None;
    }
    // Owned but nothing was allocated (nil, moved-away constants)
    if usage.alloc.is_none() && usage.shape != Shape::Unknown {
        return FreeStrategy::None;
    }

    match usage.shape {
        Shape::Tree => FreeStrategy::Unique,
        Shape::Dag => FreeStrategy::Rc,
        Shape::Cyclic if usage.cycle_broken => FreeStrategy::Rc,
        Shape::Cyclic if usage.cycle_mutable => FreeStrategy::SymmetricRc,
        Shape::Cyclic => FreeStrategy::SccRc,
        Shape::Unknown => {
            // AnalysisFallback: conservative default, sound but slower
            ctx.fallbacks += 1;
            if config.verbose {
                warn!(?var, "analysis fallback to symmetric-rc");
            } else {
                debug!(?var, "analysis fallback to symmetric-rc");
            }
            FreeStrategy::SymmetricRc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::memory_analysis::domain::{AllocSite, AllocTag, EscapeClass};
    use crate::shared::models::{BlockId, FnId, RegionId};

    fn ctx_with_one_var() -> AnalysisContext {
        AnalysisContext::new(FnId(0), 1, 1)
    }

    fn site(tag: AllocTag) -> AllocSite {
        AllocSite {
            block: BlockId(0),
            stmt_idx: 0,
            tag,
        }
    }

    #[test]
    fn test_tree_heap_value_gets_unique() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Tree;
        usage.alloc = Some(site(AllocTag::Cell));
        usage.last_use_blocks = vec![BlockId(0)];
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::Unique);
        assert_eq!(ctx.usage(VarId(0)).alloc_strategy, Some(AllocStrategy::Heap));
    }

    #[test]
    fn test_local_scalar_goes_on_the_stack() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Tree;
        usage.alloc = Some(site(AllocTag::Int));
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).alloc_strategy, Some(AllocStrategy::Stack));
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::None);
    }

    #[test]
    fn test_dag_gets_rc() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Dag;
        usage.alloc = Some(site(AllocTag::Cell));
        usage.last_use_blocks = vec![BlockId(0)];
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::Rc);
    }

    #[test]
    fn test_broken_cycle_gets_rc() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Cyclic;
        usage.cycle_broken = true;
        usage.alloc = Some(site(AllocTag::Record(crate::shared::models::TypeId(0))));
        usage.last_use_blocks = vec![BlockId(0)];
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::Rc);
    }

    #[test]
    fn test_frozen_unbroken_cycle_gets_scc_rc() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Cyclic;
        usage.alloc = Some(site(AllocTag::Record(crate::shared::models::TypeId(0))));
        usage.last_use_blocks = vec![BlockId(0)];
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::SccRc);
    }

    #[test]
    fn test_mutable_unbroken_cycle_gets_symmetric_rc() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Cyclic;
        usage.cycle_mutable = true;
        usage.alloc = Some(site(AllocTag::Record(crate::shared::models::TypeId(0))));
        usage.last_use_blocks = vec![BlockId(0)];
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::SymmetricRc);
    }

    #[test]
    fn test_unknown_shape_falls_back_to_symmetric_rc() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Unknown;
        usage.last_use_blocks = vec![BlockId(0)];
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::SymmetricRc);
        assert_eq!(ctx.fallbacks, 1);
    }

    #[test]
    fn test_borrowed_is_never_freed() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.ownership = Ownership::Borrowed;
        usage.shape = Shape::Unknown;
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::None);
    }

    #[test]
    fn test_transferred_on_all_paths_is_none() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Tree;
        usage.alloc = Some(site(AllocTag::Cell));
        usage.last_use_blocks = vec![BlockId(0)];
        usage.transfer_sites.insert(BlockId(0));
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::None);
    }

    #[test]
    fn test_region_member_waits_for_teardown() {
        let mut ctx = ctx_with_one_var();
        let usage = ctx.usage_mut(VarId(0));
        usage.shape = Shape::Tree;
        usage.escape = EscapeClass::Local;
        usage.region = Some(RegionId(0));
        usage.alloc = Some(site(AllocTag::Cell));
        usage.last_use_blocks = vec![BlockId(0)];
        select_strategies(&CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).free_strategy, FreeStrategy::RegionExit);
        assert_eq!(
            ctx.usage(VarId(0)).alloc_strategy,
            Some(AllocStrategy::Region(RegionId(0)))
        );
    }
}
