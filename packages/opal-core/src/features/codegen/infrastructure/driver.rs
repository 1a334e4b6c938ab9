//! Code generator driver
//!
//! Traverses the annotated CFGs and emits canonical C99 fragments
//! parameterised by the decided strategies. All choices were made by the
//! strategy selector and the free-point placer; the driver never re-decides.
//!
//! Function emission is a state machine:
//! `EnterFn → EmitPrologue → ForEachBlock(EmitStmts → EmitFrees →
//! EmitTerminator) → EmitEpilogue`, terminating in `ReturnEmitted` or
//! `UnreachableEmitted`.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::config::CompilerConfig;
use crate::errors::{Diagnostic, Diagnostics, OpalError, Result};
use crate::features::codegen::domain::{free_call, retain_fn, RuntimeFn, RUNTIME_INCLUDE};
use crate::features::codegen::infrastructure::emitter::{c_string, CWriter};
use crate::features::memory_analysis::domain::{
    AllocTag, AnalysisContext, FnSummary, Ownership, ParamMode, SummaryMap,
};
use crate::features::memory_analysis::infrastructure::prims::prim_param_mode;
use crate::features::resolve::domain::{FunctionDef, Program};
use crate::shared::models::{
    AllocStrategy, BasicBlock, BindingKind, BlockId, Callee, Cfg, FieldStrength, FnId,
    PrimOp, Rvalue, Stmt, Terminator, TypeId, Value, ValueKind, VarId,
};
use crate::shared::utils::NameGen;

/// Everything codegen consumes; produced by the pipeline
pub struct CodegenInput<'a> {
    pub program: &'a Program,
    pub cfgs: &'a FxHashMap<FnId, Cfg>,
    pub analyses: &'a FxHashMap<FnId, AnalysisContext>,
    pub summaries: &'a SummaryMap,
    pub config: &'a CompilerConfig,
}

/// Emit the whole translation unit.
///
/// A codegen error is per-function fatal: the function is replaced by a stub
/// that raises at runtime and a diagnostic is recorded; the rest of the unit
/// still emits.
pub fn emit_unit(
    input: &CodegenInput,
    names: &mut NameGen,
    diags: &mut Diagnostics,
) -> Result<String> {
    let mut w = CWriter::new();
    w.line(RUNTIME_INCLUDE);
    w.blank();

    emit_type_glue(&mut w, input);
    emit_globals(&mut w, input);
    emit_prototypes(&mut w, input);

    for def in &input.program.functions {
        if let Some(msg) = def.failed() {
            emit_stub(&mut w, def, msg);
            continue;
        }
        let cfg = input
            .cfgs
            .get(&def.id)
            .ok_or_else(|| OpalError::codegen(format!("missing CFG for `{}`", def.name)))?;
        let ctx = input
            .analyses
            .get(&def.id)
            .ok_or_else(|| OpalError::codegen(format!("missing analysis for `{}`", def.name)))?;
        let mut body = CWriter::new();
        match emit_function(&mut body, def, cfg, ctx, input, names) {
            Ok(()) => w.append(&body.finish()),
            Err(err) => {
                diags.push(
                    Diagnostic::error(err.to_string(), def.span).in_function(def.name.clone()),
                );
                emit_stub(&mut w, def, &err.to_string());
            }
        }
    }

    if input.config.emit_main {
        emit_main(&mut w, input);
    }
    Ok(w.finish())
}

// ── Unit-level glue ─────────────────────────────────────────────────────────

/// Per-`deftype` constructors, releases and (when reuse selected them)
/// in-place rewrites. `release_<T>` honours the weak split: weak fields are
/// nullified, never traversed.
fn emit_type_glue(w: &mut CWriter, input: &CodegenInput) {
    let mut reused: FxHashSet<TypeId> = FxHashSet::default();
    for ctx in input.analyses.values() {
        for cand in &ctx.reuse {
            if let Some(site) = ctx.usage(cand.alloc_var).alloc {
                if let AllocTag::Record(ty) = site.tag {
                    reused.insert(ty);
                }
            }
        }
    }

    for (id, def) in input.program.types.iter() {
        let params: Vec<String> = def
            .fields
            .iter()
            .map(|f| format!("obj *{}", crate::shared::utils::mangle(&f.name)))
            .collect();

        w.open(format!("static obj *mk_{}({})", def.name, params.join(", ")));
        w.line(format!(
            "obj *v = alloc_record({}, {});",
            def.fields.len(),
            c_string(&def.name)
        ));
        for (i, field) in def.fields.iter().enumerate() {
            let arg = crate::shared::utils::mangle(&field.name);
            w.line(format!("RECORD_FIELD(v, {}) = {};", i, arg));
            if field.strength == FieldStrength::Weak {
                w.line(format!(
                    "{}(&RECORD_FIELD(v, {}), {});",
                    RuntimeFn::WeakRegister.c_name(),
                    i,
                    arg
                ));
            }
        }
        w.line("return v;");
        w.close();
        w.blank();

        w.open(format!("static void release_{}(obj *v)", def.name));
        w.line("if (IS_NIL(v)) return;");
        w.line(format!("{}(v);", RuntimeFn::WeakNullify.c_name()));
        for (i, _) in def.strong_fields() {
            w.line(format!("release(RECORD_FIELD(v, {}));", i));
        }
        w.line(format!("{}(v);", RuntimeFn::FreeObj.c_name()));
        w.close();
        w.blank();

        if reused.contains(&id) {
            w.open(format!(
                "static obj *reuse_as_{}(obj *old, {})",
                def.name,
                params.join(", ")
            ));
            for (i, _) in def.strong_fields() {
                w.line(format!("release(RECORD_FIELD(old, {}));", i));
            }
            w.line(format!("retag_record(old, {}, {});", def.fields.len(), c_string(&def.name)));
            for (i, field) in def.fields.iter().enumerate() {
                let arg = crate::shared::utils::mangle(&field.name);
                w.line(format!("RECORD_FIELD(old, {}) = {};", i, arg));
                if field.strength == FieldStrength::Weak {
                    w.line(format!(
                        "{}(&RECORD_FIELD(old, {}), {});",
                        RuntimeFn::WeakRegister.c_name(),
                        i,
                        arg
                    ));
                }
            }
            w.line("return old;");
            w.close();
            w.blank();
        }
    }
}

fn emit_globals(w: &mut CWriter, input: &CodegenInput) {
    for global in &input.program.globals {
        w.line(format!("static obj *{} = NULL;", global.c_name));
    }
    if !input.program.globals.is_empty() {
        w.blank();
    }
}

fn emit_prototypes(w: &mut CWriter, input: &CodegenInput) {
    for def in &input.program.functions {
        w.line(format!("{};", signature(def)));
    }
    w.blank();
}

fn signature(def: &FunctionDef) -> String {
    if def.params.is_empty() {
        format!("static obj *{}(void)", def.c_name)
    } else {
        let params: Vec<String> = def
            .params
            .iter()
            .map(|p| format!("obj *{}", def.vars.get(*p).c_name))
            .collect();
        format!("static obj *{}({})", def.c_name, params.join(", "))
    }
}

/// Per-function fatal errors leave a stub that raises at runtime
fn emit_stub(w: &mut CWriter, def: &FunctionDef, msg: &str) {
    w.open(signature(def));
    w.line(format!("return runtime_error({});", c_string(msg)));
    w.close();
    w.blank();
}

fn emit_main(w: &mut CWriter, input: &CodegenInput) {
    w.open("int main(void)");
    for global in &input.program.globals {
        let init = input.program.function(global.init);
        w.line(format!("(void){}();", init.c_name));
    }
    if let Some(toplevel) = input.program.toplevel {
        let def = input.program.function(toplevel);
        w.line(format!("(void){}();", def.c_name));
    }
    w.line("return 0;");
    w.close();
}

// ── Function emission state machine ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitState {
    EnterFn,
    EmitPrologue,
    EmitBlock(u32),
    EmitEpilogue,
    Done,
}

struct FnEmitter<'a> {
    def: &'a FunctionDef,
    ctx: &'a AnalysisContext,
    input: &'a CodegenInput<'a>,
    /// Deduplicated C names per variable
    names: Vec<String>,
    labels: FxHashMap<BlockId, String>,
    /// Stack variables assigned in more than one block
    multi_def_stack: FxHashSet<VarId>,
    uses_sym_scope: bool,
}

fn emit_function(
    w: &mut CWriter,
    def: &FunctionDef,
    cfg: &Cfg,
    ctx: &AnalysisContext,
    input: &CodegenInput,
    gen: &mut NameGen,
) -> Result<()> {
    let emitter = FnEmitter::new(def, cfg, ctx, input, gen);
    let mut state = EmitState::EnterFn;
    loop {
        state = match state {
            EmitState::EnterFn => {
                w.open(signature(def));
                EmitState::EmitPrologue
            }
            EmitState::EmitPrologue => {
                emitter.emit_prologue(w);
                EmitState::EmitBlock(0)
            }
            EmitState::EmitBlock(i) => {
                let block = &cfg.blocks[i as usize];
                emitter.emit_block(w, block)?;
                if (i as usize) + 1 < cfg.blocks.len() {
                    EmitState::EmitBlock(i + 1)
                } else {
                    EmitState::EmitEpilogue
                }
            }
            EmitState::EmitEpilogue => {
                w.close();
                w.blank();
                EmitState::Done
            }
            EmitState::Done => break,
        };
    }
    debug!(function = %def.name, "emitted");
    Ok(())
}

impl<'a> FnEmitter<'a> {
    fn new(
        def: &'a FunctionDef,
        cfg: &'a Cfg,
        ctx: &'a AnalysisContext,
        input: &'a CodegenInput,
        gen: &mut NameGen,
    ) -> Self {
        // Shadowed bindings share a surface name, and a local must not hide
        // an emitted global or function; deduplicate the C names.
        let mut taken: FxHashSet<String> = FxHashSet::default();
        for global in &input.program.globals {
            taken.insert(global.c_name.clone());
        }
        for f in &input.program.functions {
            taken.insert(f.c_name.clone());
        }
        let mut names = Vec::with_capacity(def.vars.len());
        for (v, info) in def.vars.iter() {
            // Parameters already own their name in the signature
            if def.params.contains(&v) {
                taken.insert(info.c_name.clone());
                names.push(info.c_name.clone());
                continue;
            }
            let mut candidate = info.c_name.clone();
            let mut n = 1;
            while !taken.insert(candidate.clone()) {
                n += 1;
                candidate = format!("{}_{}", info.c_name, n);
            }
            names.push(candidate);
        }

        let mut labels = FxHashMap::default();
        for block in &cfg.blocks {
            labels.insert(block.id, gen.label());
        }

        // Stack variables written in more than one block (branch results)
        // cannot be declared at their assignment site.
        let mut def_blocks: FxHashMap<VarId, FxHashSet<BlockId>> = FxHashMap::default();
        for block in &cfg.blocks {
            for stmt in &block.stmts {
                if let Some(d) = stmt.defs() {
                    def_blocks.entry(d).or_default().insert(block.id);
                }
            }
        }
        let multi_def_stack = def_blocks
            .into_iter()
            .filter(|(v, blocks)| {
                blocks.len() > 1
                    && ctx.usage(*v).alloc_strategy == Some(AllocStrategy::Stack)
            })
            .map(|(v, _)| v)
            .collect();

        let uses_sym_scope = ctx
            .vars
            .iter()
            .any(|u| u.free_strategy == crate::shared::models::FreeStrategy::SymmetricRc);

        Self {
            def,
            ctx,
            input,
            names,
            labels,
            multi_def_stack,
            uses_sym_scope,
        }
    }

    fn name(&self, v: VarId) -> &str {
        &self.names[v.0 as usize]
    }

    fn is_stack(&self, v: VarId) -> bool {
        self.ctx.usage(v).alloc_strategy == Some(AllocStrategy::Stack)
    }

    fn emit_prologue(&self, w: &mut CWriter) {
        for (v, info) in self.def.vars.iter() {
            if info.kind == BindingKind::Parameter {
                continue;
            }
            if self.is_stack(v) {
                if self.multi_def_stack.contains(&v) {
                    w.line(format!("{}({}, 0);", RuntimeFn::StackInt.c_name(), self.name(v)));
                }
                continue;
            }
            w.line(format!("obj *{} = NIL;", self.name(v)));
        }
        if self.uses_sym_scope {
            w.line("obj *_sym_scope = sym_scope_new();");
        }
        for region in &self.ctx.regions {
            w.line(format!("region_t *_{} = NULL;", region.id));
        }
    }

    fn emit_block(&self, w: &mut CWriter, block: &BasicBlock) -> Result<()> {
        w.raw(format!("{}:;", self.labels[&block.id]));

        for region in &self.ctx.regions {
            if region.entry == block.id {
                w.line(format!(
                    "_{} = {}(NULL);",
                    region.id,
                    RuntimeFn::RegionNew.c_name()
                ));
                w.line(format!("{}(_{});", RuntimeFn::RegionEnter.c_name(), region.id));
            }
        }

        for (i, stmt) in block.stmts.iter().enumerate() {
            self.emit_stmt(w, block, i, stmt)?;
        }

        self.emit_frees(w, block.id);

        for region in &self.ctx.regions {
            if region.exit == block.id {
                w.line(format!("{}(_{});", RuntimeFn::RegionExit.c_name(), region.id));
            }
        }

        self.emit_terminator(w, block);
        Ok(())
    }

    // ── Statements ──────────────────────────────────────────────────────

    fn emit_stmt(&self, w: &mut CWriter, block: &BasicBlock, idx: usize, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { dst, rv } => self.emit_assign(w, block, idx, *dst, rv),
            Stmt::Eval(rv) => {
                if let Rvalue::Call { callee, args } = rv {
                    self.emit_retains(w, block, idx, callee, args);
                    if let Some(line) = self.call_expr(callee, args, None)? {
                        w.line(line);
                    }
                }
                Ok(())
            }
            Stmt::FieldSet {
                obj,
                ty,
                field,
                value,
            } => {
                let def = self.input.program.types.get(*ty);
                let slot = format!("RECORD_FIELD({}, {})", self.name(*obj), field);
                if def.fields[*field].strength == FieldStrength::Strong {
                    self.emit_store_retains(w, block, idx, &[*value]);
                    w.line(format!("release({});", slot));
                    w.line(format!("{} = {};", slot, self.name(*value)));
                } else {
                    w.line(format!("{} = {};", slot, self.name(*value)));
                    w.line(format!(
                        "{}(&{}, {});",
                        RuntimeFn::WeakRegister.c_name(),
                        slot,
                        self.name(*value)
                    ));
                }
                Ok(())
            }
            Stmt::StoreGlobal { global, value } => {
                let g = &self.input.program.globals[global.0 as usize];
                w.line(format!("{} = {};", g.c_name, self.name(*value)));
                Ok(())
            }
        }
    }

    fn emit_assign(
        &self,
        w: &mut CWriter,
        block: &BasicBlock,
        idx: usize,
        dst: VarId,
        rv: &Rvalue,
    ) -> Result<()> {
        let usage = self.ctx.usage(dst);
        match rv {
            Rvalue::Const(value) => self.emit_const(w, dst, value),
            Rvalue::Use(src) => {
                w.line(format!("{} = {};", self.name(dst), self.name(*src)));
                Ok(())
            }
            Rvalue::LoadGlobal(g) => {
                let global = &self.input.program.globals[g.0 as usize];
                w.line(format!("{} = {};", self.name(dst), global.c_name));
                Ok(())
            }
            Rvalue::FnAddr(f) => {
                let callee = self.input.program.function(*f);
                w.line(format!(
                    "{} = mk_fnptr((obj *(*)(void)){});",
                    self.name(dst),
                    callee.c_name
                ));
                Ok(())
            }
            Rvalue::FieldGet { obj, field, .. } => {
                w.line(format!(
                    "{} = RECORD_FIELD({}, {});",
                    self.name(dst),
                    self.name(*obj),
                    field
                ));
                Ok(())
            }
            Rvalue::MakeCell(head, tail) => {
                self.emit_store_retains(w, block, idx, &[*head, *tail]);
                let args = format!("{}, {}", self.name(*head), self.name(*tail));
                match usage.alloc_strategy {
                    Some(AllocStrategy::ReuseOf(old)) => w.line(format!(
                        "{} = reuse_as_cell({}, {});",
                        self.name(dst),
                        self.name(old),
                        args
                    )),
                    Some(AllocStrategy::Region(r)) => {
                        w.line(format!(
                            "{} = {}(_{}, OBJ_SIZE_CELL, TAG_CELL);",
                            self.name(dst),
                            RuntimeFn::RegionAlloc.c_name(),
                            r
                        ));
                        w.line(format!("CELL_HEAD({}) = {};", self.name(dst), self.name(*head)));
                        w.line(format!("CELL_TAIL({}) = {};", self.name(dst), self.name(*tail)));
                    }
                    _ => w.line(format!(
                        "{} = {}({});",
                        self.name(dst),
                        RuntimeFn::MkCell.c_name(),
                        args
                    )),
                }
                self.emit_sym_adopt(w, dst);
                Ok(())
            }
            Rvalue::MakeRecord { ty, fields } => {
                let def = self.input.program.types.get(*ty);
                let strong: Vec<VarId> = fields
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| def.fields[*i].strength == FieldStrength::Strong)
                    .map(|(_, f)| *f)
                    .collect();
                self.emit_store_retains(w, block, idx, &strong);
                let args: Vec<&str> = fields.iter().map(|f| self.name(*f)).collect();
                match usage.alloc_strategy {
                    Some(AllocStrategy::ReuseOf(old)) => w.line(format!(
                        "{} = reuse_as_{}({}, {});",
                        self.name(dst),
                        def.name,
                        self.name(old),
                        args.join(", ")
                    )),
                    Some(AllocStrategy::Region(r)) => {
                        w.line(format!(
                            "{} = {}(_{}, OBJ_SIZE_RECORD({}), TAG_RECORD);",
                            self.name(dst),
                            RuntimeFn::RegionAlloc.c_name(),
                            r,
                            def.fields.len()
                        ));
                        for (i, field_var) in fields.iter().enumerate() {
                            w.line(format!(
                                "RECORD_FIELD({}, {}) = {};",
                                self.name(dst),
                                i,
                                self.name(*field_var)
                            ));
                        }
                    }
                    _ => w.line(format!(
                        "{} = mk_{}({});",
                        self.name(dst),
                        def.name,
                        args.join(", ")
                    )),
                }
                self.emit_sym_adopt(w, dst);
                Ok(())
            }
            Rvalue::MakeArray(items) => {
                self.emit_store_retains(w, block, idx, items);
                let args: Vec<&str> = items.iter().map(|v| self.name(*v)).collect();
                w.line(format!(
                    "{} = mk_array({}{}{});",
                    self.name(dst),
                    items.len(),
                    if args.is_empty() { "" } else { ", " },
                    args.join(", ")
                ));
                self.emit_sym_adopt(w, dst);
                Ok(())
            }
            Rvalue::Call { callee, args } => {
                self.emit_retains(w, block, idx, callee, args);
                match self.call_expr(callee, args, Some(dst))? {
                    Some(expr) => w.line(expr),
                    None => {}
                }
                self.emit_sym_adopt(w, dst);
                Ok(())
            }
        }
    }

    /// inc_ref operands a construction takes ownership of while the emitting
    /// scope still needs them: borrowed values, values used again later, and
    /// repeated operands of the same store
    fn emit_store_retains(&self, w: &mut CWriter, block: &BasicBlock, idx: usize, vars: &[VarId]) {
        for (i, var) in vars.iter().enumerate() {
            let usage = self.ctx.usage(*var);
            let borrowed = usage.ownership == Ownership::Borrowed;
            let stored_again = vars[i + 1..].contains(var);
            if borrowed || stored_again || self.used_after(block, idx, *var) {
                w.line(format!(
                    "{}({});",
                    retain_fn(usage.thread).c_name(),
                    self.name(*var)
                ));
            }
        }
    }

    /// Symmetric-RC values are owned by the function's scope object
    fn emit_sym_adopt(&self, w: &mut CWriter, dst: VarId) {
        if self.ctx.usage(dst).free_strategy == crate::shared::models::FreeStrategy::SymmetricRc
            && self.uses_sym_scope
        {
            w.line(format!("sym_adopt(_sym_scope, {});", self.name(dst)));
        }
    }

    fn emit_const(&self, w: &mut CWriter, dst: VarId, value: &Value) -> Result<()> {
        let name = self.name(dst);
        if self.is_stack(dst) {
            let assign = self.multi_def_stack.contains(&dst);
            let (macro_new, macro_set, payload) = match &value.kind {
                ValueKind::Int(v) => ("STACK_INT", "SET_INT", v.to_string()),
                ValueKind::Float(v) => ("STACK_FLOAT", "SET_FLOAT", format!("{:?}", v)),
                ValueKind::Char(c) => ("STACK_CHAR", "SET_CHAR", c.to_string()),
                ValueKind::Sym(s) => ("STACK_SYM", "SET_SYM", c_string(s)),
                _ => {
                    return Err(OpalError::codegen(format!(
                        "stack allocation chosen for non-scalar constant `{}`",
                        value
                    )))
                }
            };
            if assign {
                w.line(format!("{}({}, {});", macro_set, name, payload));
            } else {
                w.line(format!("{}({}, {});", macro_new, name, payload));
            }
            return Ok(());
        }
        match &value.kind {
            ValueKind::Error(msg) => {
                // CodegenError: an Error node survived analysis
                Err(OpalError::codegen(format!(
                    "error node reached emission: {}",
                    msg
                )))
            }
            _ => {
                let strategy = self.ctx.usage(dst).alloc_strategy;
                if let Some(AllocStrategy::Region(r)) = strategy {
                    let scalar = match &value.kind {
                        ValueKind::Int(v) => Some(("TAG_INT", "SET_INT", v.to_string())),
                        ValueKind::Float(v) => {
                            Some(("TAG_FLOAT", "SET_FLOAT", format!("{:?}", v)))
                        }
                        ValueKind::Char(c) => Some(("TAG_CHAR", "SET_CHAR", c.to_string())),
                        ValueKind::Sym(s) => Some(("TAG_SYM", "SET_SYM", c_string(s))),
                        _ => None,
                    };
                    if let Some((tag, set, payload)) = scalar {
                        w.line(format!(
                            "{} = {}(_{}, OBJ_SIZE_SCALAR, {});",
                            name,
                            RuntimeFn::RegionAlloc.c_name(),
                            r,
                            tag
                        ));
                        w.line(format!("{}({}, {});", set, name, payload));
                        return Ok(());
                    }
                }
                w.line(format!("{} = {};", name, const_expr(value)));
                Ok(())
            }
        }
    }

    /// inc_ref around arguments a consuming callee would take from us while
    /// we still need them (or never owned them)
    fn emit_retains(
        &self,
        w: &mut CWriter,
        block: &BasicBlock,
        idx: usize,
        callee: &Callee,
        args: &[VarId],
    ) {
        for (i, arg) in args.iter().enumerate() {
            let mode = self.callee_param_mode(callee, args.len(), i);
            if !matches!(mode, ParamMode::Consumed | ParamMode::Captured) {
                continue;
            }
            let usage = self.ctx.usage(*arg);
            let borrowed = usage.ownership == Ownership::Borrowed;
            let needed_later = self.used_after(block, idx, *arg);
            let repeated = args[i + 1..].contains(arg);
            if borrowed || needed_later || repeated {
                w.line(format!(
                    "{}({});",
                    retain_fn(usage.thread).c_name(),
                    self.name(*arg)
                ));
            }
            if self.input.config.debug_assertions {
                w.line(format!(
                    "{}({});",
                    RuntimeFn::AssertOwned.c_name(),
                    self.name(*arg)
                ));
            }
        }
    }

    fn callee_param_mode(&self, callee: &Callee, argc: usize, idx: usize) -> ParamMode {
        match callee {
            Callee::Prim(op) => prim_param_mode(*op, idx),
            Callee::Fn(f) => {
                let pessimistic = FnSummary::pessimistic(argc);
                self.input
                    .summaries
                    .get(f)
                    .unwrap_or(&pessimistic)
                    .param_mode(idx)
            }
            Callee::Dynamic(_) => ParamMode::Consumed,
        }
    }

    fn used_after(&self, block: &BasicBlock, idx: usize, var: VarId) -> bool {
        if self.ctx.live_out[block.id.0 as usize].contains(&var) {
            return true;
        }
        if block.term.uses().contains(&var) {
            return true;
        }
        block.stmts[idx + 1..]
            .iter()
            .any(|s| s.uses().contains(&var))
    }

    /// Render a call. `dst` of `None` means evaluation for effect. Returns
    /// `None` when nothing needs emitting (pure no-result forms).
    fn call_expr(
        &self,
        callee: &Callee,
        args: &[VarId],
        dst: Option<VarId>,
    ) -> Result<Option<String>> {
        let assign = |expr: String| match dst {
            Some(d) => format!("{} = {};", self.name(d), expr),
            None => format!("{};", expr),
        };
        match callee {
            Callee::Prim(op) => self.prim_expr(*op, args, dst),
            Callee::Fn(f) => {
                let def = self.input.program.function(*f);
                let rendered: Vec<&str> = args.iter().map(|a| self.name(*a)).collect();
                Ok(Some(assign(format!(
                    "{}({})",
                    def.c_name,
                    rendered.join(", ")
                ))))
            }
            Callee::Dynamic(fv) => {
                let params: Vec<&str> = args.iter().map(|_| "obj *").collect();
                let rendered: Vec<&str> = args.iter().map(|a| self.name(*a)).collect();
                Ok(Some(assign(format!(
                    "((obj *(*)({}))FNPTR({}))({})",
                    if params.is_empty() {
                        "void".to_string()
                    } else {
                        params.join(", ")
                    },
                    self.name(*fv),
                    rendered.join(", ")
                ))))
            }
        }
    }

    fn prim_expr(&self, op: PrimOp, args: &[VarId], dst: Option<VarId>) -> Result<Option<String>> {
        let a = |i: usize| self.name(args[i]);
        let scalar = |expr: String| -> Option<String> {
            match dst {
                Some(d) if self.is_stack(d) => {
                    if self.multi_def_stack.contains(&d) {
                        Some(format!("SET_INT({}, {});", self.name(d), expr))
                    } else {
                        Some(format!(
                            "{}({}, {});",
                            RuntimeFn::StackInt.c_name(),
                            self.name(d),
                            expr
                        ))
                    }
                }
                Some(d) => Some(format!(
                    "{} = {}({});",
                    self.name(d),
                    RuntimeFn::MkInt.c_name(),
                    expr
                )),
                None => None,
            }
        };
        let side_effect = |call: String| -> Option<String> {
            match dst {
                // A side-effecting primitive in value position yields nil
                Some(d) => Some(format!("{};\n    {} = NIL;", call, self.name(d))),
                None => Some(format!("{};", call)),
            }
        };

        let rendered = match op {
            PrimOp::Add => scalar(format!("INT_OF({}) + INT_OF({})", a(0), a(1))),
            PrimOp::Sub => scalar(format!("INT_OF({}) - INT_OF({})", a(0), a(1))),
            PrimOp::Mul => scalar(format!("INT_OF({}) * INT_OF({})", a(0), a(1))),
            PrimOp::Div => scalar(format!("INT_OF({}) / INT_OF({})", a(0), a(1))),
            PrimOp::NumEq => scalar(format!("INT_OF({}) == INT_OF({})", a(0), a(1))),
            PrimOp::Lt => scalar(format!("INT_OF({}) < INT_OF({})", a(0), a(1))),
            PrimOp::Gt => scalar(format!("INT_OF({}) > INT_OF({})", a(0), a(1))),
            PrimOp::IsNull => scalar(format!("IS_NIL({})", a(0))),
            PrimOp::Car => dst.map(|d| format!("{} = CELL_HEAD({});", self.name(d), a(0))),
            PrimOp::Cdr => dst.map(|d| format!("{} = CELL_TAIL({});", self.name(d), a(0))),
            PrimOp::Cons => {
                // Normally lowered to MakeCell; a dynamic path still works
                dst.map(|d| {
                    format!(
                        "{} = {}({}, {});",
                        self.name(d),
                        RuntimeFn::MkCell.c_name(),
                        a(0),
                        a(1)
                    )
                })
            }
            PrimOp::Display => side_effect(format!("o_display({})", a(0))),
            PrimOp::Print => side_effect(format!("o_print({})", a(0))),
            PrimOp::Newline => side_effect("o_newline()".to_string()),
            PrimOp::ChanNew => dst.map(|d| {
                format!(
                    "{} = {}(INT_OF({}));",
                    self.name(d),
                    RuntimeFn::ChannelNew.c_name(),
                    a(0)
                )
            }),
            PrimOp::ChanSend => side_effect(format!(
                "{}({}, {})",
                RuntimeFn::ChannelSend.c_name(),
                a(0),
                a(1)
            )),
            PrimOp::ChanRecv => dst.map(|d| {
                format!(
                    "{} = {}({});",
                    self.name(d),
                    RuntimeFn::ChannelRecv.c_name(),
                    a(0)
                )
            }),
            PrimOp::ChanClose => {
                side_effect(format!("{}({})", RuntimeFn::ChannelClose.c_name(), a(0)))
            }
            PrimOp::Spawn => {
                let rest: Vec<&str> = args[1..].iter().map(|v| self.name(*v)).collect();
                side_effect(format!(
                    "thread_spawn(FNPTR({}), {}{}{})",
                    a(0),
                    args.len() - 1,
                    if rest.is_empty() { "" } else { ", " },
                    rest.join(", ")
                ))
            }
        };
        Ok(rendered)
    }

    // ── Frees and terminators ───────────────────────────────────────────

    fn emit_frees(&self, w: &mut CWriter, block: BlockId) {
        let Some(frees) = self.ctx.frees_at.get(&block) else {
            return;
        };
        for var in frees {
            let usage = self.ctx.usage(*var);
            let is_channel = usage.alloc.map(|s| s.tag == AllocTag::Chan).unwrap_or(false);
            if let Some(helper) = free_call(usage.free_strategy, usage.thread, is_channel) {
                w.line(format!("{}({});", helper.c_name(), self.name(*var)));
            }
        }
    }

    fn emit_terminator(&self, w: &mut CWriter, block: &BasicBlock) {
        match &block.term {
            Terminator::Fallthrough(next) => {
                w.line(format!("goto {};", self.labels[next]));
            }
            Terminator::Branch {
                cond,
                then_bb,
                else_bb,
            } => {
                w.line(format!(
                    "if (TRUTHY({})) goto {}; else goto {};",
                    self.name(*cond),
                    self.labels[then_bb],
                    self.labels[else_bb]
                ));
            }
            Terminator::Return(value) => {
                if self.uses_sym_scope {
                    w.line(format!("{}(_sym_scope);", RuntimeFn::SymExitScope.c_name()));
                }
                match value {
                    Some(v) => w.line(format!("return {};", self.name(*v))),
                    None => w.line("return NIL;"),
                }
            }
            Terminator::Unreachable => {
                w.line("UNREACHABLE();");
            }
        }
    }
}

/// Heap construction expression for a literal or quoted datum
fn const_expr(value: &Value) -> String {
    match &value.kind {
        ValueKind::Int(v) => format!("mk_int({})", v),
        ValueKind::Float(v) => format!("mk_float({:?})", v),
        ValueKind::Char(c) => format!("mk_char({})", c),
        ValueKind::Sym(s) => format!("mk_sym({})", c_string(s)),
        ValueKind::Str(s) => format!("mk_str({})", c_string(s)),
        ValueKind::Nil => "NIL".to_string(),
        ValueKind::Cell(head, tail) => {
            format!("mk_cell({}, {})", const_expr(head), const_expr(tail))
        }
        ValueKind::Array(items) => {
            let rendered: Vec<String> = items.iter().map(const_expr).collect();
            format!(
                "mk_array({}{}{})",
                items.len(),
                if rendered.is_empty() { "" } else { ", " },
                rendered.join(", ")
            )
        }
        ValueKind::Error(msg) => format!("runtime_error({})", c_string(msg)),
    }
}
