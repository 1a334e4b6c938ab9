//! Compilation pipeline
//!
//! Single-threaded, sequential: parse → resolve → type shapes → CFGs →
//! summary fixed point → per-function analyses → strategy selection → free
//! placement → codegen. Parse and analysis errors accumulate; a failed
//! function is stubbed rather than aborting the unit.

use rustc_hash::FxHashMap;
use tracing::{debug, info, info_span};

use crate::config::CompilerConfig;
use crate::errors::{Diagnostic, Diagnostics, OpalError, Result};
use crate::features::codegen::{emit_unit, CodegenInput};
use crate::features::flow_graph::build_cfg;
use crate::features::free_placement::place_frees;
use crate::features::memory_analysis::{
    analyze_concurrency, analyze_escape, analyze_liveness, analyze_ownership, analyze_regions,
    analyze_reuse, analyze_type_shapes, compute_summaries, refine_var_shapes,
    weak_split_is_acyclic, AnalysisContext, ParamMode, SummaryMap,
};
use crate::features::reader::parse_program;
use crate::features::resolve::{resolve_program, Program};
use crate::features::strategy::select_strategies;
use crate::shared::models::{Cfg, FnId};
use crate::shared::utils::NameGen;

/// Everything one compilation produces
#[derive(Debug)]
pub struct CompileOutput {
    pub c_source: String,
    pub diagnostics: Diagnostics,
    pub program: Program,
    pub cfgs: FxHashMap<FnId, Cfg>,
    pub analyses: FxHashMap<FnId, AnalysisContext>,
    pub summaries: SummaryMap,
}

/// Compile one source unit to C
pub fn compile_source(src: &str, config: &CompilerConfig) -> Result<CompileOutput> {
    let span = info_span!("compile");
    let _guard = span.enter();

    // Syntax errors stop compilation outright
    let forms = parse_program(src)?;

    let mut diags = Diagnostics::new();
    let mut program = resolve_program(&forms, &mut diags);

    let type_shapes = analyze_type_shapes(&mut program.types, config);
    if !weak_split_is_acyclic(&program.types) {
        diags.push(Diagnostic::warning(
            "strong ownership cycle not broken by weak edges; cyclic strategies apply",
            None,
        ));
    }

    // CFG construction; name counters are shared across the unit
    let mut names = NameGen::new();
    let mut cfgs: FxHashMap<FnId, Cfg> = FxHashMap::default();
    let fn_ids: Vec<FnId> = program.functions.iter().map(|f| f.id).collect();
    for id in fn_ids {
        if program.functions[id.0 as usize].failed().is_some() {
            continue;
        }
        let store_global = program
            .globals
            .iter()
            .find(|g| g.init == id)
            .map(|g| g.id);
        let mut def = program.functions[id.0 as usize].clone();
        let cfg = build_cfg(&mut def, &mut names, store_global);
        program.functions[id.0 as usize] = def;
        cfgs.insert(id, cfg);
    }

    let summaries = compute_summaries(&program, &cfgs, &type_shapes);

    // Final per-function analyses against the fixed summaries
    let mut analyses: FxHashMap<FnId, AnalysisContext> = FxHashMap::default();
    for def in &program.functions {
        if def.failed().is_some() {
            continue;
        }
        let cfg = &cfgs[&def.id];
        let mut ctx = AnalysisContext::new(def.id, def.vars.len(), cfg.blocks.len());
        let own_modes: Vec<ParamMode> = summaries
            .get(&def.id)
            .map(|s| s.params.iter().map(|p| p.mode).collect())
            .unwrap_or_default();

        analyze_liveness(cfg, &def.params, &mut ctx);
        analyze_escape(cfg, &summaries, &mut ctx);
        analyze_ownership(cfg, &program.types, &summaries, &def.params, &own_modes, &mut ctx);
        refine_var_shapes(cfg, &type_shapes, &summaries, &mut ctx);
        analyze_concurrency(cfg, &mut ctx);
        analyze_reuse(cfg, &program.types, &mut ctx);
        analyze_regions(cfg, &program.types, config, &mut ctx);
        select_strategies(config, &mut ctx);
        place_frees(cfg, &mut ctx);

        if ctx.fallbacks > 0 {
            debug!(function = %def.name, fallbacks = ctx.fallbacks, "conservative defaults taken");
        }
        analyses.insert(def.id, ctx);
    }

    let c_source = emit_unit(
        &CodegenInput {
            program: &program,
            cfgs: &cfgs,
            analyses: &analyses,
            summaries: &summaries,
            config,
        },
        &mut names,
        &mut diags,
    )?;

    info!(
        functions = program.functions.len(),
        errors = diags.error_count(),
        "compilation finished"
    );
    Ok(CompileOutput {
        c_source,
        diagnostics: diags,
        program,
        cfgs,
        analyses,
        summaries,
    })
}

/// Convenience wrapper returning only the C text; any accumulated error is
/// promoted to `Err`
pub fn compile_to_c(src: &str, config: &CompilerConfig) -> Result<String> {
    let output = compile_source(src, config)?;
    if output.diagnostics.has_errors() {
        return Err(OpalError::analysis(output.diagnostics.report()));
    }
    Ok(output.c_source)
}
