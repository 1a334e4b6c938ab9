//! Region inference
//!
//! Finds maximal lexical scopes in which every allocation is escape class
//! `Local` with shape Tree or DAG. Such a scope gets a fresh region id; its
//! allocations become region allocations and their individual frees collapse
//! into one teardown at the scope's single exit.

use tracing::debug;

use crate::config::CompilerConfig;
use crate::features::memory_analysis::domain::{
    AllocTag, AnalysisContext, Ownership, RegionInfo, Shape, ThreadClass,
};
use crate::shared::models::{
    Cfg, FieldStrength, RegionId, Rvalue, ScopeExtent, Stmt, TypeRegistry, VarId,
};

pub fn analyze_regions(
    cfg: &Cfg,
    types: &TypeRegistry,
    config: &CompilerConfig,
    ctx: &mut AnalysisContext,
) {
    let mut next_region = ctx.regions.len() as u32;

    // Outermost scopes first so regions are maximal; a scope nested inside a
    // regioned scope contributes its allocations to the outer region.
    let mut order: Vec<usize> = (0..cfg.scopes.len()).collect();
    order.sort_by_key(|&i| cfg.scopes[i].depth);

    let mut consumed = vec![false; cfg.scopes.len()];
    for &i in &order {
        if consumed[i] {
            continue;
        }
        let scope = &cfg.scopes[i];
        let nested: Vec<usize> = (0..cfg.scopes.len())
            .filter(|&j| j != i && !consumed[j] && contains(scope, &cfg.scopes[j]))
            .collect();

        let mut members: Vec<VarId> = Vec::new();
        let mut eligible = true;
        for &j in std::iter::once(&i).chain(nested.iter()) {
            for &v in &cfg.scopes[j].vars {
                let usage = ctx.usage(v);
                let Some(_) = usage.alloc else {
                    continue;
                };
                // Reuse already reclaims these two; reuse wins over region
                if ctx.reuse_of(v).is_some() || ctx.reuse_into(v).is_some() {
                    continue;
                }
                if usage.region.is_some() {
                    continue;
                }
                let ok = usage.escape.is_local()
                    && matches!(usage.shape, Shape::Tree | Shape::Dag)
                    && usage.thread == ThreadClass::ThreadLocal
                    && usage.transfer_sites.is_empty();
                if !ok {
                    eligible = false;
                }
                members.push(v);
            }
        }

        if !eligible || members.len() < config.region_min_allocs {
            continue;
        }

        // Region teardown is bulk: values consumed into region members must
        // live in the region too, or the scope cannot become one.
        if !absorb_operands(cfg, types, ctx, &mut members) {
            continue;
        }

        let id = RegionId(next_region);
        next_region += 1;
        for &v in &members {
            ctx.usage_mut(v).region = Some(id);
        }
        for j in nested {
            consumed[j] = true;
        }
        consumed[i] = true;
        debug!(region = %id, vars = members.len(), "region inferred");
        ctx.regions.push(RegionInfo {
            id,
            vars: members,
            entry: scope.entry,
            exit: scope.exit,
        });
    }
}

/// Lexical containment, by block creation order
fn contains(outer: &ScopeExtent, inner: &ScopeExtent) -> bool {
    outer.depth < inner.depth && outer.entry.0 <= inner.entry.0 && inner.exit.0 <= outer.exit.0
}

/// Pull every value consumed into a region member into the region.
///
/// Returns `false` when a member stores something the region cannot own
/// (a borrowed alias, a callee-allocated value, or an unsupported tag); the
/// scope then keeps its individual frees.
fn absorb_operands(
    cfg: &Cfg,
    types: &TypeRegistry,
    ctx: &AnalysisContext,
    members: &mut Vec<VarId>,
) -> bool {
    let mut changed = true;
    while changed {
        changed = false;
        for block in &cfg.blocks {
            for stmt in &block.stmts {
                let Stmt::Assign { dst, rv } = stmt else {
                    continue;
                };
                if !members.contains(dst) {
                    continue;
                }
                let owned_operands: Vec<VarId> = match rv {
                    Rvalue::MakeCell(a, b) => vec![*a, *b],
                    Rvalue::MakeRecord { ty, fields } => {
                        let def = types.get(*ty);
                        fields
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| def.fields[*i].strength == FieldStrength::Strong)
                            .map(|(_, f)| *f)
                            .collect()
                    }
                    _ => Vec::new(),
                };
                for op in owned_operands {
                    if members.contains(&op) {
                        continue;
                    }
                    let usage = ctx.usage(op);
                    match usage.alloc {
                        // Nothing allocated (nil and friends): no storage
                        None if usage.ownership == Ownership::Owned => {}
                        None => return false,
                        Some(site) => {
                            let supported = matches!(
                                site.tag,
                                AllocTag::Int
                                    | AllocTag::Float
                                    | AllocTag::Char
                                    | AllocTag::Sym
                                    | AllocTag::Cell
                                    | AllocTag::Record(_)
                            );
                            let ok = supported
                                && usage.ownership == Ownership::Owned
                                && !usage.alloc_is_call
                                && usage.escape.is_local()
                                && usage.thread == ThreadClass::ThreadLocal;
                            if !ok {
                                return false;
                            }
                            members.push(op);
                            changed = true;
                        }
                    }
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::memory_analysis::domain::{AllocSite, AllocTag, EscapeClass, Ownership};
    use crate::shared::models::{
        BasicBlock, BlockId, FnId, Rvalue, Stmt, Terminator,
    };

    /// Two cells bound in one scope, used locally, nothing escapes
    fn scoped_cfg() -> Cfg {
        Cfg {
            fn_id: FnId(0),
            entry: BlockId(0),
            scopes: vec![ScopeExtent {
                vars: vec![VarId(0), VarId(1)],
                entry: BlockId(0),
                exit: BlockId(0),
                depth: 0,
            }],
            blocks: vec![BasicBlock {
                id: BlockId(0),
                stmts: vec![
                    Stmt::Assign {
                        dst: VarId(0),
                        rv: Rvalue::MakeCell(VarId(2), VarId(3)),
                    },
                    Stmt::Assign {
                        dst: VarId(1),
                        rv: Rvalue::MakeCell(VarId(4), VarId(5)),
                    },
                ],
                term: Terminator::Return(None),
            }],
        }
    }

    fn ctx_with_local_cells(cfg: &Cfg) -> AnalysisContext {
        let mut ctx = AnalysisContext::new(FnId(0), 6, cfg.blocks.len());
        for (i, v) in [VarId(0), VarId(1)].into_iter().enumerate() {
            let usage = ctx.usage_mut(v);
            usage.ownership = Ownership::Owned;
            usage.shape = Shape::Tree;
            usage.escape = EscapeClass::Local;
            usage.alloc = Some(AllocSite {
                block: BlockId(0),
                stmt_idx: i,
                tag: AllocTag::Cell,
            });
        }
        ctx
    }

    #[test]
    fn test_local_tree_scope_becomes_region() {
        let cfg = scoped_cfg();
        let mut ctx = ctx_with_local_cells(&cfg);
        analyze_regions(&cfg, &TypeRegistry::new(), &CompilerConfig::default(), &mut ctx);
        assert_eq!(ctx.regions.len(), 1);
        assert_eq!(ctx.regions[0].vars.len(), 2);
        assert!(ctx.usage(VarId(0)).region.is_some());
        assert_eq!(ctx.usage(VarId(0)).region, ctx.usage(VarId(1)).region);
    }

    #[test]
    fn test_escaping_allocation_blocks_the_region() {
        let cfg = scoped_cfg();
        let mut ctx = ctx_with_local_cells(&cfg);
        ctx.usage_mut(VarId(1)).escape = EscapeClass::Returned;
        analyze_regions(&cfg, &TypeRegistry::new(), &CompilerConfig::default(), &mut ctx);
        assert!(ctx.regions.is_empty());
    }

    #[test]
    fn test_single_allocation_is_below_threshold() {
        let mut cfg = scoped_cfg();
        cfg.scopes[0].vars.pop();
        cfg.blocks[0].stmts.pop();
        let mut ctx = ctx_with_local_cells(&cfg);
        analyze_regions(&cfg, &TypeRegistry::new(), &CompilerConfig::default(), &mut ctx);
        assert!(ctx.regions.is_empty());
    }

    #[test]
    fn test_unknown_shape_blocks_the_region() {
        let cfg = scoped_cfg();
        let mut ctx = ctx_with_local_cells(&cfg);
        ctx.usage_mut(VarId(0)).shape = Shape::Unknown;
        analyze_regions(&cfg, &TypeRegistry::new(), &CompilerConfig::default(), &mut ctx);
        assert!(ctx.regions.is_empty());
    }
}
