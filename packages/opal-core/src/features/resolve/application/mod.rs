//! Symbol resolution
//!
//! Binds every identifier use to a definition, assigns mangled external
//! names, canonicalises special forms and lifts lambdas to top-level
//! functions. An unbound identifier is per-function fatal: the body becomes
//! `RExpr::Fail` and later stages emit a stub.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::errors::{Diagnostic, Diagnostics};
use crate::features::resolve::domain::{
    FunctionDef, GlobalDef, Program, RCallee, RExpr, VarInfo, VarTable,
};
use crate::shared::models::{
    BindingKind, FieldDef, FieldStrength, FnId, GlobalId, PrimOp, Resolution, Span, SymbolTable,
    TypeDef, TypeId, TypeRef, TypeRegistry, Value, ValueKind, VarId,
};
use crate::shared::utils::mangle;

/// Primitive lookup by surface name
static PRIMITIVES: Lazy<FxHashMap<&'static str, PrimOp>> = Lazy::new(|| {
    PrimOp::all().iter().map(|op| (op.name(), *op)).collect()
});

/// Top-level expressions echo their value, REPL style, unless they are
/// already side-effecting
fn wrap_toplevel(expr: RExpr) -> RExpr {
    match &expr {
        RExpr::Call {
            callee:
                RCallee::Prim(
                    PrimOp::Display
                    | PrimOp::Print
                    | PrimOp::Newline
                    | PrimOp::ChanSend
                    | PrimOp::ChanClose
                    | PrimOp::Spawn,
                ),
            ..
        } => expr,
        RExpr::Fail(_) => expr,
        _ => RExpr::Do(vec![
            RExpr::Call {
                callee: RCallee::Prim(PrimOp::Display),
                args: vec![expr],
            },
            RExpr::Call {
                callee: RCallee::Prim(PrimOp::Newline),
                args: vec![],
            },
        ]),
    }
}

/// Resolve a parsed compilation unit
pub fn resolve_program(forms: &[Value], diags: &mut Diagnostics) -> Program {
    let mut resolver = Resolver {
        types: TypeRegistry::new(),
        table: SymbolTable::new(),
        functions: Vec::new(),
        globals: Vec::new(),
        lambda_count: 0,
        diags,
    };
    resolver.seed_primitives();
    resolver.run(forms)
}

struct Resolver<'d> {
    types: TypeRegistry,
    table: SymbolTable,
    functions: Vec<FunctionDef>,
    globals: Vec<GlobalDef>,
    lambda_count: u32,
    diags: &'d mut Diagnostics,
}

/// Per-function resolution state
struct FnScope {
    vars: VarTable,
}

impl FnScope {
    fn new() -> Self {
        Self { vars: VarTable::new() }
    }

    fn fresh(&mut self, name: &str, kind: BindingKind, span: Option<Span>) -> VarId {
        self.vars.push(VarInfo {
            name: name.to_string(),
            c_name: mangle(name),
            kind,
            span,
        })
    }
}

impl<'d> Resolver<'d> {
    fn seed_primitives(&mut self) {
        for (&name, &op) in PRIMITIVES.iter() {
            self.table.bind(name, Resolution::Prim(op));
        }
    }

    fn run(mut self, forms: &[Value]) -> Program {
        // First pass: declare types, functions and globals so forward
        // references resolve.
        let mut toplevel_exprs: Vec<&Value> = Vec::new();
        let mut bodies: Vec<(FnId, &Value)> = Vec::new();
        for form in forms {
            match form.head_sym() {
                Some("deftype") => self.declare_type(form),
                Some("define") => {
                    if let Some((fn_id, form)) = self.declare_define(form) {
                        bodies.push((fn_id, form));
                    }
                }
                _ => toplevel_exprs.push(form),
            }
        }

        // Second pass: resolve bodies.
        for (fn_id, form) in bodies {
            self.resolve_define_body(fn_id, form);
        }

        let toplevel = if toplevel_exprs.is_empty() {
            None
        } else {
            let fn_id = self.reserve_function("toplevel", "o_toplevel".to_string(), false, None);
            let mut scope = FnScope::new();
            self.table.enter_scope();
            let exprs = toplevel_exprs
                .iter()
                .map(|e| {
                    let resolved = self.resolve_expr(e, &mut scope);
                    wrap_toplevel(resolved)
                })
                .collect::<Vec<_>>();
            self.table.exit_scope();
            let body = if exprs.len() == 1 {
                exprs.into_iter().next().unwrap()
            } else {
                RExpr::Do(exprs)
            };
            self.finish_function(fn_id, Vec::new(), scope.vars, body);
            Some(fn_id)
        };

        debug!(
            functions = self.functions.len(),
            globals = self.globals.len(),
            types = self.types.len(),
            "resolution finished"
        );

        Program {
            functions: self.functions,
            globals: self.globals,
            types: self.types,
            toplevel,
        }
    }

    // ── Declarations ────────────────────────────────────────────────────

    fn declare_type(&mut self, form: &Value) {
        let Some(items) = form.list_items() else {
            self.error("malformed deftype", form.span);
            return;
        };
        // (deftype Name (field Type [^weak]) …)
        let Some(name) = items.get(1).and_then(|v| v.as_sym()) else {
            self.error("deftype needs a type name", form.span);
            return;
        };
        let mut fields = Vec::new();
        for field_form in &items[2..] {
            let Some(parts) = field_form.list_items() else {
                self.error("malformed deftype field", field_form.span);
                continue;
            };
            let (Some(field_name), Some(type_name)) = (
                parts.first().and_then(|v| v.as_sym()),
                parts.get(1).and_then(|v| v.as_sym()),
            ) else {
                self.error("deftype field needs a name and a type", field_form.span);
                continue;
            };
            let weak_annotated = parts
                .get(2)
                .and_then(|v| v.as_sym())
                .map(|s| s == "^weak")
                .unwrap_or(false);
            fields.push(FieldDef {
                name: field_name.to_string(),
                field_type: TypeRef::parse(type_name),
                strength: if weak_annotated {
                    FieldStrength::Weak
                } else {
                    FieldStrength::Strong
                },
                weak_annotated,
            });
        }
        let def = TypeDef {
            name: name.to_string(),
            fields,
            is_recursive: false,
            is_mutated: false,
            span: form.span,
        };
        match self.types.declare(def) {
            Some(id) => {
                if !self.table.bind(name, Resolution::Ctor(id.0)) {
                    self.error(format!("`{}` is already bound", name), form.span);
                }
            }
            None => self.error(format!("type `{}` declared twice", name), form.span),
        }
    }

    /// Reserve ids for a `define`; bodies are resolved in the second pass
    fn declare_define<'f>(&mut self, form: &'f Value) -> Option<(FnId, &'f Value)> {
        let items = form.list_items()?;
        match items.get(1).map(|v| &v.kind) {
            // (define (f p…) body…)
            Some(ValueKind::Cell(_, _)) => {
                let header = items[1].list_items()?;
                let name = header.first().and_then(|v| v.as_sym())?;
                let fn_id = self.reserve_function(name, mangle(name), false, form.span);
                if !self.table.bind(name, Resolution::Fn(fn_id)) {
                    self.error(format!("`{}` is already bound", name), form.span);
                }
                Some((fn_id, form))
            }
            // (define name expr)
            Some(ValueKind::Sym(name)) => {
                let name = name.clone();
                let init_id = self.reserve_function(
                    &format!("{}-init", name),
                    format!("{}_init", mangle(&name)),
                    false,
                    form.span,
                );
                let global_id = GlobalId(self.globals.len() as u32);
                self.globals.push(GlobalDef {
                    id: global_id,
                    name: name.clone(),
                    c_name: mangle(&name),
                    init: init_id,
                });
                if !self.table.bind(&name, Resolution::Global(global_id)) {
                    self.error(format!("`{}` is already bound", name), form.span);
                }
                Some((init_id, form))
            }
            _ => {
                self.error("malformed define", form.span);
                None
            }
        }
    }

    fn reserve_function(
        &mut self,
        name: &str,
        c_name: String,
        is_lifted: bool,
        span: Option<Span>,
    ) -> FnId {
        let id = FnId(self.functions.len() as u32);
        self.functions.push(FunctionDef {
            id,
            name: name.to_string(),
            c_name,
            params: Vec::new(),
            vars: VarTable::new(),
            body: RExpr::Fail("unresolved".to_string()),
            span,
            is_lifted,
        });
        id
    }

    fn finish_function(&mut self, id: FnId, params: Vec<VarId>, vars: VarTable, body: RExpr) {
        let def = &mut self.functions[id.0 as usize];
        def.params = params;
        def.vars = vars;
        def.body = body;
    }

    // ── Bodies ──────────────────────────────────────────────────────────

    fn resolve_define_body(&mut self, fn_id: FnId, form: &Value) {
        let items = form.list_items().unwrap_or_default();
        match items.get(1).map(|v| &v.kind) {
            Some(ValueKind::Cell(_, _)) => {
                let header = items[1].list_items().unwrap_or_default();
                let param_names: Vec<&Value> = header[1..].to_vec();
                let body_forms: Vec<&Value> = items[2..].to_vec();
                self.resolve_fn_like(fn_id, &param_names, &body_forms);
            }
            Some(ValueKind::Sym(_)) => {
                // Zero-argument initializer for a top-level binding
                let mut scope = FnScope::new();
                self.table.enter_scope();
                let body = match items.get(2) {
                    Some(expr) => self.resolve_expr(expr, &mut scope),
                    None => RExpr::Lit(Value::nil()),
                };
                self.table.exit_scope();
                self.finish_function(fn_id, Vec::new(), scope.vars, body);
            }
            _ => {}
        }
    }

    fn resolve_fn_like(&mut self, fn_id: FnId, param_names: &[&Value], body_forms: &[&Value]) {
        let mut scope = FnScope::new();
        self.table.enter_scope();
        let mut params = Vec::new();
        for p in param_names {
            match p.as_sym() {
                Some(name) => {
                    let var = scope.fresh(name, BindingKind::Parameter, p.span);
                    if !self.table.bind(name, Resolution::Var(var)) {
                        self.error(format!("duplicate parameter `{}`", name), p.span);
                    }
                    params.push(var);
                }
                None => self.error("parameter must be a symbol", p.span),
            }
        }
        let exprs: Vec<RExpr> = body_forms
            .iter()
            .map(|e| self.resolve_expr(e, &mut scope))
            .collect();
        self.table.exit_scope();
        let body = match exprs.len() {
            0 => RExpr::Lit(Value::nil()),
            1 => exprs.into_iter().next().unwrap(),
            _ => RExpr::Do(exprs),
        };
        self.finish_function(fn_id, params, scope.vars, body);
    }

    // ── Expressions ─────────────────────────────────────────────────────

    fn resolve_expr(&mut self, value: &Value, scope: &mut FnScope) -> RExpr {
        match &value.kind {
            ValueKind::Int(_)
            | ValueKind::Float(_)
            | ValueKind::Char(_)
            | ValueKind::Str(_)
            | ValueKind::Nil
            | ValueKind::Array(_) => RExpr::Lit(value.clone()),
            ValueKind::Error(msg) => {
                self.error(msg.clone(), value.span);
                RExpr::Fail(msg.clone())
            }
            ValueKind::Sym(name) => self.resolve_name(name, value.span),
            ValueKind::Cell(_, _) => self.resolve_form(value, scope),
        }
    }

    fn resolve_name(&mut self, name: &str, span: Option<Span>) -> RExpr {
        match self.table.lookup(name) {
            Some(Resolution::Var(v)) => RExpr::Ref(v),
            Some(Resolution::Fn(f)) => RExpr::FnAddr(f),
            Some(Resolution::Global(g)) => RExpr::Global(g),
            Some(Resolution::Prim(_)) => {
                self.error(format!("primitive `{}` used as a value", name), span);
                RExpr::Fail(format!("primitive `{}` used as a value", name))
            }
            Some(Resolution::Ctor(_)) => {
                self.error(format!("type `{}` used as a value", name), span);
                RExpr::Fail(format!("type `{}` used as a value", name))
            }
            None => {
                self.error(format!("unbound identifier `{}`", name), span);
                RExpr::Fail(format!("unbound identifier `{}`", name))
            }
        }
    }

    fn resolve_form(&mut self, form: &Value, scope: &mut FnScope) -> RExpr {
        let Some(items) = form.list_items() else {
            self.error("improper list in expression position", form.span);
            return RExpr::Fail("improper list".to_string());
        };
        if items.is_empty() {
            return RExpr::Lit(Value::nil());
        }
        match items[0].as_sym() {
            Some("quote") => match items.get(1) {
                Some(datum) => RExpr::Quote((*datum).clone()),
                None => RExpr::Lit(Value::nil()),
            },
            Some("if") => {
                if items.len() < 3 || items.len() > 4 {
                    self.error("if needs a condition and one or two arms", form.span);
                    return RExpr::Fail("malformed if".to_string());
                }
                let cond = self.resolve_expr(items[1], scope);
                let then_arm = self.resolve_expr(items[2], scope);
                let else_arm = match items.get(3) {
                    Some(e) => self.resolve_expr(e, scope),
                    None => RExpr::Lit(Value::nil()),
                };
                RExpr::If(Box::new(cond), Box::new(then_arm), Box::new(else_arm))
            }
            Some(head @ ("let" | "let*")) => self.resolve_let(head == "let*", &items, form, scope),
            Some("lambda" | "fn") => self.resolve_lambda(&items, form, scope),
            Some("do" | "begin") => {
                let exprs = items[1..]
                    .iter()
                    .map(|e| self.resolve_expr(e, scope))
                    .collect();
                RExpr::Do(exprs)
            }
            Some("define") => {
                self.error("define is only allowed at top level", form.span);
                RExpr::Fail("nested define".to_string())
            }
            Some("deftype") => {
                self.error("deftype is only allowed at top level", form.span);
                RExpr::Fail("nested deftype".to_string())
            }
            _ => self.resolve_call(&items, form, scope),
        }
    }

    fn resolve_let(
        &mut self,
        sequential: bool,
        items: &[&Value],
        form: &Value,
        scope: &mut FnScope,
    ) -> RExpr {
        let Some(binding_forms) = items.get(1).and_then(|v| v.list_items()) else {
            self.error("let needs a binding list", form.span);
            return RExpr::Fail("malformed let".to_string());
        };

        self.table.enter_scope();
        let mut bindings = Vec::new();
        if sequential {
            // let*: each binding is visible to the next RHS
            for bf in &binding_forms {
                if let Some((var, rhs)) = self.resolve_binding(bf, scope) {
                    bindings.push((var, rhs));
                }
            }
        } else {
            // let: RHSs are resolved in the outer scope, left to right, then
            // all names become visible together
            let mut pending = Vec::new();
            for bf in &binding_forms {
                let Some(parts) = bf.list_items() else {
                    self.error("malformed let binding", bf.span);
                    continue;
                };
                let (Some(name_v), Some(rhs_v)) = (parts.first(), parts.get(1)) else {
                    self.error("let binding needs a name and a value", bf.span);
                    continue;
                };
                let Some(name) = name_v.as_sym() else {
                    self.error("let binding name must be a symbol", bf.span);
                    continue;
                };
                let rhs = self.resolve_expr(rhs_v, scope);
                pending.push((name.to_string(), name_v.span, rhs));
            }
            for (name, span, rhs) in pending {
                let var = scope.fresh(&name, BindingKind::Local, span);
                if !self.table.bind(&name, Resolution::Var(var)) {
                    self.error(format!("duplicate binding `{}` in let", name), span);
                }
                bindings.push((var, rhs));
            }
        }

        let body_exprs: Vec<RExpr> = items[2..]
            .iter()
            .map(|e| self.resolve_expr(e, scope))
            .collect();
        self.table.exit_scope();

        let body = match body_exprs.len() {
            0 => RExpr::Lit(Value::nil()),
            1 => body_exprs.into_iter().next().unwrap(),
            _ => RExpr::Do(body_exprs),
        };
        RExpr::Let {
            sequential,
            bindings,
            body: Box::new(body),
        }
    }

    fn resolve_binding(&mut self, bf: &Value, scope: &mut FnScope) -> Option<(VarId, RExpr)> {
        let parts = bf.list_items()?;
        let (name_v, rhs_v) = (parts.first()?, parts.get(1)?);
        let name = match name_v.as_sym() {
            Some(n) => n,
            None => {
                self.error("let binding name must be a symbol", bf.span);
                return None;
            }
        };
        let rhs = self.resolve_expr(rhs_v, scope);
        let var = scope.fresh(name, BindingKind::Local, name_v.span);
        if !self.table.bind(name, Resolution::Var(var)) {
            self.error(format!("duplicate binding `{}` in let*", name), name_v.span);
        }
        Some((var, rhs))
    }

    fn resolve_lambda(&mut self, items: &[&Value], form: &Value, _scope: &mut FnScope) -> RExpr {
        let Some(param_forms) = items.get(1).and_then(|v| v.list_items()) else {
            self.error("lambda needs a parameter list", form.span);
            return RExpr::Fail("malformed lambda".to_string());
        };
        // Lifted lambdas are closed over globals only. A reference to an
        // enclosing local would need an environment record, which the
        // baseline representation does not carry.
        let n = self.lambda_count;
        self.lambda_count += 1;
        let fn_id = self.reserve_function(
            &format!("lambda-{}", n),
            format!("o_lam{}", n),
            true,
            form.span,
        );

        // Resolve the lambda body against the top-level scope only: hide all
        // enclosing local scopes so captures surface as unbound identifiers.
        let saved = std::mem::replace(&mut self.table, SymbolTable::new());
        self.seed_primitives();
        self.rebind_toplevel();
        let body_forms: Vec<&Value> = items[2..].to_vec();
        self.resolve_fn_like(fn_id, &param_forms, &body_forms);
        self.table = saved;

        if self.functions[fn_id.0 as usize].failed().is_some() {
            self.error(
                "lambda captures an enclosing local; captured locals must be \
                 passed as parameters",
                form.span,
            );
        }
        RExpr::FnAddr(fn_id)
    }

    /// Re-seed top-level bindings into a fresh table (lambda body scope)
    fn rebind_toplevel(&mut self) {
        let fns: Vec<(String, FnId)> = self
            .functions
            .iter()
            .filter(|f| !f.is_lifted)
            .map(|f| (f.name.clone(), f.id))
            .collect();
        for (name, id) in fns {
            self.table.bind(&name, Resolution::Fn(id));
        }
        let globals: Vec<(String, GlobalId)> =
            self.globals.iter().map(|g| (g.name.clone(), g.id)).collect();
        for (name, id) in globals {
            self.table.bind(&name, Resolution::Global(id));
        }
        let types: Vec<(String, u32)> = self
            .types
            .iter()
            .map(|(id, t)| (t.name.clone(), id.0))
            .collect();
        for (name, raw) in types {
            self.table.bind(&name, Resolution::Ctor(raw));
        }
    }

    fn resolve_call(&mut self, items: &[&Value], form: &Value, scope: &mut FnScope) -> RExpr {
        let head = items[0];
        let args: Vec<RExpr> = items[1..]
            .iter()
            .map(|e| self.resolve_expr(e, scope))
            .collect();

        if let Some(name) = head.as_sym() {
            match self.table.lookup(name) {
                Some(Resolution::Prim(op)) => {
                    let ok = if op.is_variadic() {
                        args.len() >= op.arity()
                    } else {
                        args.len() == op.arity()
                    };
                    if !ok {
                        self.error(
                            format!(
                                "`{}` expects {} argument(s), got {}",
                                name,
                                op.arity(),
                                args.len()
                            ),
                            form.span,
                        );
                        return RExpr::Fail(format!("arity mismatch for `{}`", name));
                    }
                    return RExpr::Call {
                        callee: RCallee::Prim(op),
                        args,
                    };
                }
                Some(Resolution::Fn(f)) => {
                    let expected = self.functions[f.0 as usize].params.len();
                    // Lifted and forward-declared bodies are filled later;
                    // only check arity once params are known.
                    if !self.functions[f.0 as usize].body.is_fail() && args.len() != expected {
                        self.error(
                            format!(
                                "`{}` expects {} argument(s), got {}",
                                name,
                                expected,
                                args.len()
                            ),
                            form.span,
                        );
                    }
                    return RExpr::Call {
                        callee: RCallee::Fn(f),
                        args,
                    };
                }
                Some(Resolution::Ctor(raw)) => {
                    let ty = TypeId(raw);
                    let expected = self.types.get(ty).fields.len();
                    if args.len() != expected {
                        self.error(
                            format!(
                                "constructor `{}` expects {} field(s), got {}",
                                name,
                                expected,
                                args.len()
                            ),
                            form.span,
                        );
                        return RExpr::Fail(format!("arity mismatch for `{}`", name));
                    }
                    return RExpr::MakeRecord { ty, fields: args };
                }
                Some(Resolution::Var(v)) => {
                    return RExpr::Call {
                        callee: RCallee::Expr(Box::new(RExpr::Ref(v))),
                        args,
                    };
                }
                Some(Resolution::Global(g)) => {
                    return RExpr::Call {
                        callee: RCallee::Expr(Box::new(RExpr::Global(g))),
                        args,
                    };
                }
                None => {
                    if let Some(expr) = self.resolve_accessor(name, args.clone(), form.span) {
                        return expr;
                    }
                    self.error(format!("unbound identifier `{}`", name), head.span);
                    return RExpr::Fail(format!("unbound identifier `{}`", name));
                }
            }
        }

        // Call through an arbitrary expression
        let callee = self.resolve_expr(head, scope);
        RExpr::Call {
            callee: RCallee::Expr(Box::new(callee)),
            args,
        }
    }

    /// Resolve `<Type>-<field>` getters and `set-<Type>-<field>!` setters
    fn resolve_accessor(
        &mut self,
        name: &str,
        mut args: Vec<RExpr>,
        span: Option<Span>,
    ) -> Option<RExpr> {
        // Setter: set-Node-next!
        if let Some(rest) = name.strip_prefix("set-").and_then(|r| r.strip_suffix('!')) {
            let (ty, field) = self.split_accessor(rest)?;
            if args.len() != 2 {
                self.error(format!("`{}` expects 2 arguments", name), span);
                return Some(RExpr::Fail(format!("arity mismatch for `{}`", name)));
            }
            self.types.get_mut(ty).is_mutated = true;
            let value = args.pop().unwrap();
            let obj = args.pop().unwrap();
            return Some(RExpr::FieldSet {
                ty,
                field,
                obj: Box::new(obj),
                value: Box::new(value),
            });
        }
        // Getter: Node-next
        let (ty, field) = self.split_accessor(name)?;
        if args.len() != 1 {
            self.error(format!("`{}` expects 1 argument", name), span);
            return Some(RExpr::Fail(format!("arity mismatch for `{}`", name)));
        }
        let obj = args.pop().unwrap();
        Some(RExpr::FieldGet {
            ty,
            field,
            obj: Box::new(obj),
        })
    }

    fn split_accessor(&self, name: &str) -> Option<(TypeId, usize)> {
        for (id, def) in self.types.iter() {
            if let Some(field_name) = name
                .strip_prefix(def.name.as_str())
                .and_then(|r| r.strip_prefix('-'))
            {
                if let Some(idx) = def.field_index(field_name) {
                    return Some((id, idx));
                }
            }
        }
        None
    }

    fn error(&mut self, message: impl Into<String>, span: Option<Span>) {
        self.diags.push(Diagnostic::error(message, span));
    }
}
