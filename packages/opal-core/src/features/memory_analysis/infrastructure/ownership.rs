//! Ownership classification
//!
//! Per variable: `Owned` (fresh allocation result or transferred in),
//! `Borrowed` (read-only alias of another owned value), `Transferred`
//! (consumed at a particular use). A variable can be `Owned` at its
//! definition and `Transferred` at one use site; the free-point placer
//! consults both. This pass also records every allocation site.

use crate::features::memory_analysis::domain::{
    AllocSite, AllocTag, AnalysisContext, FnSummary, Ownership, ParamMode, ReturnOwnership,
    SummaryMap,
};
use crate::features::memory_analysis::infrastructure::prims::{prim_param_mode, prim_return};
use crate::shared::models::{
    BlockId, Callee, Cfg, FieldStrength, Rvalue, Stmt, Terminator, TypeRegistry, ValueKind, VarId,
};

pub fn analyze_ownership(
    cfg: &Cfg,
    types: &TypeRegistry,
    summaries: &SummaryMap,
    params: &[VarId],
    own_param_modes: &[ParamMode],
    ctx: &mut AnalysisContext,
) {
    // Parameters: borrowed when our own summary says so, otherwise the
    // caller transferred them to us.
    for (i, p) in params.iter().enumerate() {
        let mode = own_param_modes.get(i).copied().unwrap_or(ParamMode::Consumed);
        ctx.usage_mut(*p).ownership = match mode {
            ParamMode::Borrowed => Ownership::Borrowed,
            _ => Ownership::Owned,
        };
    }

    for block_id in cfg.reverse_postorder() {
        let block = cfg.block(block_id);
        for (stmt_idx, stmt) in block.stmts.iter().enumerate() {
            classify_stmt(block_id, stmt_idx, stmt, types, summaries, ctx);
        }
        if let Terminator::Return(Some(v)) = &block.term {
            // Returning an owned value transfers it to the caller
            if ctx.usage(*v).ownership == Ownership::Owned {
                ctx.usage_mut(*v).transfer_sites.insert(block_id);
            }
        }
    }
}

fn classify_stmt(
    block: BlockId,
    stmt_idx: usize,
    stmt: &Stmt,
    types: &TypeRegistry,
    summaries: &SummaryMap,
    ctx: &mut AnalysisContext,
) {
    match stmt {
        Stmt::Assign { dst, rv } => match rv {
            Rvalue::Const(value) => {
                ctx.usage_mut(*dst).ownership = Ownership::Owned;
                if let Some(tag) = const_tag(&value.kind) {
                    set_alloc(ctx, *dst, block, stmt_idx, tag);
                }
            }
            Rvalue::Use(src) => {
                let src_ownership = ctx.usage(*src).ownership;
                match src_ownership {
                    Ownership::Owned => {
                        // Ownership moves into dst; the alias copies the
                        // allocation record so the strategy follows the value.
                        ctx.usage_mut(*src).transfer_sites.insert(block);
                        let alloc = ctx.usage(*src).alloc;
                        let dst_usage = ctx.usage_mut(*dst);
                        dst_usage.ownership = Ownership::Owned;
                        if dst_usage.alloc.is_none() {
                            dst_usage.alloc = alloc;
                        }
                    }
                    _ => ctx.usage_mut(*dst).ownership = Ownership::Borrowed,
                }
            }
            Rvalue::LoadGlobal(_) | Rvalue::FnAddr(_) | Rvalue::FieldGet { .. } => {
                ctx.usage_mut(*dst).ownership = Ownership::Borrowed;
            }
            Rvalue::MakeCell(head, tail) => {
                ctx.usage_mut(*dst).ownership = Ownership::Owned;
                set_alloc(ctx, *dst, block, stmt_idx, AllocTag::Cell);
                consume(ctx, *head, block);
                consume(ctx, *tail, block);
            }
            Rvalue::MakeRecord { ty, fields } => {
                ctx.usage_mut(*dst).ownership = Ownership::Owned;
                set_alloc(ctx, *dst, block, stmt_idx, AllocTag::Record(*ty));
                let def = types.get(*ty);
                for (i, field_var) in fields.iter().enumerate() {
                    // Weak fields do not take ownership of their target
                    if def.fields[i].strength == FieldStrength::Strong {
                        consume(ctx, *field_var, block);
                    }
                }
            }
            Rvalue::MakeArray(items) => {
                ctx.usage_mut(*dst).ownership = Ownership::Owned;
                set_alloc(ctx, *dst, block, stmt_idx, AllocTag::Array);
                for item in items {
                    consume(ctx, *item, block);
                }
            }
            Rvalue::Call { callee, args } => {
                classify_call(block, stmt_idx, *dst, callee, args, summaries, ctx);
            }
        },
        Stmt::Eval(rv) => {
            if let Rvalue::Call { callee, args } = rv {
                consume_call_args(block, callee, args, summaries, ctx);
            }
        }
        Stmt::FieldSet {
            obj: _,
            ty,
            field,
            value,
        } => {
            let strength = types.get(*ty).fields[*field].strength;
            if strength == FieldStrength::Strong {
                consume(ctx, *value, block);
            }
        }
        Stmt::StoreGlobal { value, .. } => {
            consume(ctx, *value, block);
        }
    }
}

fn classify_call(
    block: BlockId,
    stmt_idx: usize,
    dst: VarId,
    callee: &Callee,
    args: &[VarId],
    summaries: &SummaryMap,
    ctx: &mut AnalysisContext,
) {
    consume_call_args(block, callee, args, summaries, ctx);
    match callee {
        Callee::Prim(op) => {
            let (ret, _, tag) = prim_return(*op);
            match ret {
                ReturnOwnership::Fresh => {
                    ctx.usage_mut(dst).ownership = Ownership::Owned;
                    if let Some(tag) = tag {
                        set_alloc(ctx, dst, block, stmt_idx, tag);
                    }
                }
                ReturnOwnership::Borrowed => {
                    ctx.usage_mut(dst).ownership = Ownership::Borrowed
                }
                _ => ctx.usage_mut(dst).ownership = Ownership::Owned,
            }
        }
        Callee::Fn(f) => {
            let pessimistic = FnSummary::pessimistic(args.len());
            let summary = summaries.get(f).unwrap_or(&pessimistic);
            match summary.ret {
                ReturnOwnership::Fresh => {
                    ctx.usage_mut(dst).ownership = Ownership::Owned;
                    if let Some(tag) = summary.ret_tag {
                        set_alloc(ctx, dst, block, stmt_idx, tag);
                        ctx.usage_mut(dst).alloc_is_call = true;
                    }
                }
                ReturnOwnership::Passthrough(idx) => {
                    let inner = args
                        .get(idx)
                        .map(|a| ctx.usage(*a).ownership)
                        .unwrap_or(Ownership::Owned);
                    ctx.usage_mut(dst).ownership = inner;
                    if inner == Ownership::Owned {
                        if let Some(a) = args.get(idx) {
                            // The same pointer comes back: ownership moves to
                            // the result
                            consume(ctx, *a, block);
                            let alloc = ctx.usage(*a).alloc;
                            if ctx.usage(dst).alloc.is_none() {
                                ctx.usage_mut(dst).alloc = alloc;
                            }
                        }
                    }
                }
                ReturnOwnership::Borrowed => {
                    ctx.usage_mut(dst).ownership = Ownership::Borrowed
                }
                ReturnOwnership::None => ctx.usage_mut(dst).ownership = Ownership::Owned,
            }
        }
        Callee::Dynamic(_) => {
            // Unknown target: the conservative default is a fresh owned
            // value of unknown shape.
            ctx.usage_mut(dst).ownership = Ownership::Owned;
            ctx.fallbacks += 1;
        }
    }
}

fn consume_call_args(
    block: BlockId,
    callee: &Callee,
    args: &[VarId],
    summaries: &SummaryMap,
    ctx: &mut AnalysisContext,
) {
    match callee {
        Callee::Prim(op) => {
            for (i, arg) in args.iter().enumerate() {
                if matches!(
                    prim_param_mode(*op, i),
                    ParamMode::Consumed | ParamMode::Captured
                ) {
                    consume(ctx, *arg, block);
                }
            }
        }
        Callee::Fn(f) => {
            let pessimistic = FnSummary::pessimistic(args.len());
            let summary = summaries.get(f).unwrap_or(&pessimistic);
            for (i, arg) in args.iter().enumerate() {
                if matches!(
                    summary.param_mode(i),
                    ParamMode::Consumed | ParamMode::Captured
                ) {
                    consume(ctx, *arg, block);
                }
            }
        }
        Callee::Dynamic(_) => {
            for arg in args {
                consume(ctx, *arg, block);
            }
        }
    }
}

/// Mark an owned variable as transferred at this block
fn consume(ctx: &mut AnalysisContext, var: VarId, block: BlockId) {
    let usage = ctx.usage_mut(var);
    if usage.ownership == Ownership::Owned {
        usage.transfer_sites.insert(block);
    }
}

fn set_alloc(ctx: &mut AnalysisContext, var: VarId, block: BlockId, stmt_idx: usize, tag: AllocTag) {
    ctx.usage_mut(var).alloc = Some(AllocSite {
        block,
        stmt_idx,
        tag,
    });
}

fn const_tag(kind: &ValueKind) -> Option<AllocTag> {
    match kind {
        ValueKind::Int(_) => Some(AllocTag::Int),
        ValueKind::Float(_) => Some(AllocTag::Float),
        ValueKind::Char(_) => Some(AllocTag::Char),
        ValueKind::Sym(_) => Some(AllocTag::Sym),
        ValueKind::Str(_) => Some(AllocTag::Str),
        ValueKind::Cell(_, _) => Some(AllocTag::Cell),
        ValueKind::Array(_) => Some(AllocTag::Array),
        ValueKind::Nil | ValueKind::Error(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{BasicBlock, FnId, PrimOp, Value};

    fn one_block(stmts: Vec<Stmt>, term: Terminator) -> Cfg {
        Cfg {
            fn_id: FnId(0),
            entry: BlockId(0),
            scopes: Vec::new(),
            blocks: vec![BasicBlock {
                id: BlockId(0),
                stmts,
                term,
            }],
        }
    }

    #[test]
    fn test_fresh_cell_is_owned_with_site() {
        let cfg = one_block(
            vec![Stmt::Assign {
                dst: VarId(0),
                rv: Rvalue::MakeCell(VarId(1), VarId(2)),
            }],
            Terminator::Return(None),
        );
        let mut ctx = AnalysisContext::new(FnId(0), 3, 1);
        analyze_ownership(
            &cfg,
            &TypeRegistry::new(),
            &SummaryMap::default(),
            &[],
            &[],
            &mut ctx,
        );
        assert_eq!(ctx.usage(VarId(0)).ownership, Ownership::Owned);
        assert_eq!(ctx.usage(VarId(0)).alloc.unwrap().tag, AllocTag::Cell);
    }

    #[test]
    fn test_cell_children_are_consumed() {
        let cfg = one_block(
            vec![
                Stmt::Assign {
                    dst: VarId(1),
                    rv: Rvalue::Const(Value::int(1)),
                },
                Stmt::Assign {
                    dst: VarId(0),
                    rv: Rvalue::MakeCell(VarId(1), VarId(2)),
                },
            ],
            Terminator::Return(None),
        );
        let mut ctx = AnalysisContext::new(FnId(0), 3, 1);
        analyze_ownership(
            &cfg,
            &TypeRegistry::new(),
            &SummaryMap::default(),
            &[],
            &[],
            &mut ctx,
        );
        assert!(ctx.usage(VarId(1)).is_transferred_at(BlockId(0)));
    }

    #[test]
    fn test_returned_owned_value_is_transferred() {
        let cfg = one_block(
            vec![Stmt::Assign {
                dst: VarId(0),
                rv: Rvalue::MakeCell(VarId(1), VarId(2)),
            }],
            Terminator::Return(Some(VarId(0))),
        );
        let mut ctx = AnalysisContext::new(FnId(0), 3, 1);
        analyze_ownership(
            &cfg,
            &TypeRegistry::new(),
            &SummaryMap::default(),
            &[],
            &[],
            &mut ctx,
        );
        assert!(ctx.usage(VarId(0)).is_transferred_at(BlockId(0)));
    }

    #[test]
    fn test_field_get_is_borrowed() {
        let mut types = TypeRegistry::new();
        let ty = types
            .declare(crate::shared::models::TypeDef {
                name: "Box".to_string(),
                fields: vec![crate::shared::models::FieldDef {
                    name: "item".to_string(),
                    field_type: crate::shared::models::TypeRef::Any,
                    strength: FieldStrength::Strong,
                    weak_annotated: false,
                }],
                is_recursive: false,
                is_mutated: false,
                span: None,
            })
            .unwrap();
        let cfg = one_block(
            vec![Stmt::Assign {
                dst: VarId(0),
                rv: Rvalue::FieldGet {
                    obj: VarId(1),
                    ty,
                    field: 0,
                },
            }],
            Terminator::Return(None),
        );
        let mut ctx = AnalysisContext::new(FnId(0), 2, 1);
        analyze_ownership(&cfg, &types, &SummaryMap::default(), &[], &[], &mut ctx);
        assert_eq!(ctx.usage(VarId(0)).ownership, Ownership::Borrowed);
    }

    #[test]
    fn test_send_transfers_the_value() {
        let cfg = one_block(
            vec![
                Stmt::Assign {
                    dst: VarId(0),
                    rv: Rvalue::MakeCell(VarId(1), VarId(2)),
                },
                Stmt::Eval(Rvalue::Call {
                    callee: Callee::Prim(PrimOp::ChanSend),
                    args: vec![VarId(3), VarId(0)],
                }),
            ],
            Terminator::Return(None),
        );
        let mut ctx = AnalysisContext::new(FnId(0), 4, 1);
        analyze_ownership(
            &cfg,
            &TypeRegistry::new(),
            &SummaryMap::default(),
            &[],
            &[],
            &mut ctx,
        );
        assert!(ctx.usage(VarId(0)).is_transferred_at(BlockId(0)));
        // The channel itself is only borrowed by the send
        assert!(ctx.usage(VarId(3)).transfer_sites.is_empty());
    }
}
