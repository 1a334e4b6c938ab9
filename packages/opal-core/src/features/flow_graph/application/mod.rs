//! Control-flow graph construction
//!
//! Lowers resolved expressions into basic blocks of three-address
//! statements. `if` branches join at a fresh merge block; `let` bindings
//! evaluate left to right into fresh locals; the tail expression lowers to a
//! `Return` carrying the value register.

use tracing::debug;

use crate::features::resolve::domain::{FunctionDef, RCallee, RExpr, VarInfo};
use crate::shared::models::{
    BasicBlock, BindingKind, BlockId, Callee, Cfg, GlobalId, PrimOp, Rvalue, ScopeExtent, Stmt,
    Terminator, Value,
};
use crate::shared::models::VarId;
use crate::shared::utils::NameGen;

/// Build the CFG for one function body.
///
/// `store_global` is set for zero-argument initializers of top-level
/// bindings: the body's value is stored rather than returned. Temporaries
/// are appended to the function's variable table.
pub fn build_cfg(def: &mut FunctionDef, names: &mut NameGen, store_global: Option<GlobalId>) -> Cfg {
    let body = def.body.clone();
    let mut builder = CfgBuilder {
        def,
        names,
        blocks: Vec::new(),
        current: BlockId(0),
        scopes: Vec::new(),
        depth: 0,
    };
    let entry = builder.new_block();
    builder.current = entry;

    let result = builder.lower(&body);
    match store_global {
        Some(global) => {
            builder.push(Stmt::StoreGlobal {
                global,
                value: result,
            });
            builder.terminate(Terminator::Return(None));
        }
        None => builder.terminate(Terminator::Return(Some(result))),
    }

    debug!(function = %builder.def.name, blocks = builder.blocks.len(), "cfg built");
    Cfg {
        fn_id: builder.def.id,
        blocks: builder.blocks,
        entry,
        scopes: builder.scopes,
    }
}

struct CfgBuilder<'a> {
    def: &'a mut FunctionDef,
    names: &'a mut NameGen,
    blocks: Vec<BasicBlock>,
    current: BlockId,
    scopes: Vec<ScopeExtent>,
    depth: u32,
}

impl<'a> CfgBuilder<'a> {
    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            id,
            stmts: Vec::new(),
            term: Terminator::Unreachable,
        });
        id
    }

    fn push(&mut self, stmt: Stmt) {
        self.blocks[self.current.0 as usize].stmts.push(stmt);
    }

    fn terminate(&mut self, term: Terminator) {
        self.blocks[self.current.0 as usize].term = term;
    }

    fn fresh_temp(&mut self) -> VarId {
        let name = self.names.temp();
        self.def.vars.push(VarInfo {
            c_name: name.clone(),
            name,
            kind: BindingKind::Local,
            span: None,
        })
    }

    /// Lower an expression, returning the variable holding its value
    fn lower(&mut self, expr: &RExpr) -> VarId {
        // Plain references need no copy
        if let RExpr::Ref(v) = expr {
            return *v;
        }
        let dst = self.fresh_temp();
        self.lower_into(expr, dst);
        dst
    }

    /// Lower an expression directly into `dst`
    fn lower_into(&mut self, expr: &RExpr, dst: VarId) {
        match expr {
            RExpr::Lit(value) | RExpr::Quote(value) => {
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::Const(value.clone()),
                });
            }
            RExpr::Ref(v) => {
                // Ownership moves into dst
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::Use(*v),
                });
            }
            RExpr::Global(g) => {
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::LoadGlobal(*g),
                });
            }
            RExpr::FnAddr(f) => {
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::FnAddr(*f),
                });
            }
            RExpr::If(cond, then_arm, else_arm) => {
                let cond_var = self.lower(cond);
                let then_bb = self.new_block();
                let else_bb = self.new_block();
                self.terminate(Terminator::Branch {
                    cond: cond_var,
                    then_bb,
                    else_bb,
                });
                let merge = self.new_block();

                self.current = then_bb;
                self.lower_into(then_arm, dst);
                self.terminate(Terminator::Fallthrough(merge));

                self.current = else_bb;
                self.lower_into(else_arm, dst);
                self.terminate(Terminator::Fallthrough(merge));

                self.current = merge;
            }
            RExpr::Let { bindings, body, .. } => {
                let entry = self.current;
                self.depth += 1;
                let mut scope_vars = Vec::with_capacity(bindings.len());
                for (var, rhs) in bindings {
                    self.lower_into(rhs, *var);
                    scope_vars.push(*var);
                }
                self.lower_into(body, dst);
                self.depth -= 1;
                self.scopes.push(ScopeExtent {
                    vars: scope_vars,
                    entry,
                    exit: self.current,
                    depth: self.depth,
                });
            }
            RExpr::Do(exprs) => match exprs.split_last() {
                Some((last, init)) => {
                    for e in init {
                        self.lower_effect(e);
                    }
                    self.lower_into(last, dst);
                }
                None => self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::Const(Value::nil()),
                }),
            },
            RExpr::Call { callee, args } => {
                let arg_vars: Vec<VarId> = args.iter().map(|a| self.lower(a)).collect();
                let rv = self.lower_callee(callee, arg_vars);
                self.push(Stmt::Assign { dst, rv });
            }
            RExpr::MakeRecord { ty, fields } => {
                let field_vars: Vec<VarId> = fields.iter().map(|f| self.lower(f)).collect();
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::MakeRecord {
                        ty: *ty,
                        fields: field_vars,
                    },
                });
            }
            RExpr::FieldGet { ty, field, obj } => {
                let obj_var = self.lower(obj);
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::FieldGet {
                        obj: obj_var,
                        ty: *ty,
                        field: *field,
                    },
                });
            }
            RExpr::FieldSet {
                ty,
                field,
                obj,
                value,
            } => {
                let obj_var = self.lower(obj);
                let value_var = self.lower(value);
                self.push(Stmt::FieldSet {
                    obj: obj_var,
                    ty: *ty,
                    field: *field,
                    value: value_var,
                });
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::Const(Value::nil()),
                });
            }
            RExpr::Fail(msg) => {
                // Analysis never reaches a failed function; keep the CFG
                // well-formed anyway.
                self.push(Stmt::Assign {
                    dst,
                    rv: Rvalue::Const(Value::error(msg.clone())),
                });
            }
        }
    }

    /// Lower an expression evaluated for effect only
    fn lower_effect(&mut self, expr: &RExpr) {
        match expr {
            RExpr::Call { callee, args } => {
                let arg_vars: Vec<VarId> = args.iter().map(|a| self.lower(a)).collect();
                let rv = self.lower_callee(callee, arg_vars);
                self.push(Stmt::Eval(rv));
            }
            RExpr::FieldSet { .. } | RExpr::If(..) | RExpr::Let { .. } | RExpr::Do(_) => {
                let _ = self.lower(expr);
            }
            // Pure expressions in effect position evaluate to nothing
            _ => {}
        }
    }

    fn lower_callee(&mut self, callee: &RCallee, args: Vec<VarId>) -> Rvalue {
        match callee {
            // cons is the canonical cell allocation
            RCallee::Prim(PrimOp::Cons) => {
                debug_assert_eq!(args.len(), 2);
                Rvalue::MakeCell(args[0], args[1])
            }
            RCallee::Prim(op) => Rvalue::Call {
                callee: Callee::Prim(*op),
                args,
            },
            RCallee::Fn(f) => Rvalue::Call {
                callee: Callee::Fn(*f),
                args,
            },
            RCallee::Expr(e) => {
                let callee_var = self.lower(e);
                Rvalue::Call {
                    callee: Callee::Dynamic(callee_var),
                    args,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Diagnostics;
    use crate::features::reader::parse_program;
    use crate::features::resolve::resolve_program;

    fn cfg_for(src: &str, fn_name: &str) -> (Cfg, crate::features::resolve::Program) {
        let forms = parse_program(src).unwrap();
        let mut diags = Diagnostics::new();
        let mut program = resolve_program(&forms, &mut diags);
        assert!(!diags.has_errors(), "{}", diags.report());
        let fn_id = program
            .functions
            .iter()
            .find(|f| f.name == fn_name)
            .unwrap()
            .id;
        let mut names = NameGen::new();
        let mut def = program.functions[fn_id.0 as usize].clone();
        let cfg = build_cfg(&mut def, &mut names, None);
        program.functions[fn_id.0 as usize] = def;
        (cfg, program)
    }

    #[test]
    fn test_straight_line_body_is_one_block() {
        let (cfg, _) = cfg_for("(define (f x) (+ x 1))", "f");
        assert_eq!(cfg.blocks.len(), 1);
        assert!(matches!(cfg.blocks[0].term, Terminator::Return(Some(_))));
    }

    #[test]
    fn test_if_lowers_to_diamond() {
        let (cfg, _) = cfg_for("(define (f x) (if (> x 0) 1 2))", "f");
        // entry, then, else, merge
        assert_eq!(cfg.blocks.len(), 4);
        assert!(matches!(
            cfg.block(cfg.entry).term,
            Terminator::Branch { .. }
        ));
        let merge_preds = cfg.predecessors()[3].len();
        assert_eq!(merge_preds, 2);
    }

    #[test]
    fn test_branch_arms_assign_same_destination() {
        let (cfg, _) = cfg_for("(define (f x) (if (> x 0) 1 2))", "f");
        let then_dst = cfg.blocks[1].stmts.iter().find_map(|s| s.defs());
        let else_dst = cfg.blocks[2].stmts.iter().find_map(|s| s.defs());
        assert_eq!(then_dst, else_dst);
        assert!(then_dst.is_some());
    }

    #[test]
    fn test_cons_becomes_make_cell() {
        let (cfg, _) = cfg_for("(define (f) (cons 1 2))", "f");
        let has_cell = cfg.blocks[0]
            .stmts
            .iter()
            .any(|s| matches!(s.rvalue(), Some(Rvalue::MakeCell(_, _))));
        assert!(has_cell);
    }

    #[test]
    fn test_let_records_scope_extent() {
        let (cfg, _) = cfg_for("(define (f) (let ((a (cons 1 2))) a))", "f");
        assert_eq!(cfg.scopes.len(), 1);
        assert_eq!(cfg.scopes[0].vars.len(), 1);
        assert_eq!(cfg.scopes[0].entry, cfg.scopes[0].exit);
    }

    #[test]
    fn test_effect_position_call_has_no_destination() {
        let (cfg, _) = cfg_for("(define (f x) (do (display x) x))", "f");
        let has_eval = cfg.blocks[0]
            .stmts
            .iter()
            .any(|s| matches!(s, Stmt::Eval(_)));
        assert!(has_eval);
    }

    #[test]
    fn test_temp_names_are_monotonic() {
        let forms = parse_program("(define (f) (+ 1 2)) (define (g) (+ 3 4))").unwrap();
        let mut diags = Diagnostics::new();
        let mut program = resolve_program(&forms, &mut diags);
        let mut names = NameGen::new();
        let ids: Vec<_> = program.functions.iter().map(|f| f.id).collect();
        let mut all_temps = Vec::new();
        for id in ids {
            let mut def = program.functions[id.0 as usize].clone();
            build_cfg(&mut def, &mut names, None);
            for (_, info) in def.vars.iter() {
                if info.name.starts_with("_t") {
                    all_temps.push(info.name.clone());
                }
            }
            program.functions[id.0 as usize] = def;
        }
        // Counters never reset between functions in one unit
        let mut sorted = all_temps.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), all_temps.len());
    }
}
