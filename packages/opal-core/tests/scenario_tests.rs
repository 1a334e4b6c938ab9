//! End-to-end scenarios: compile literal source and inspect both the
//! analysis records and the emitted C text.

use opal_core::features::memory_analysis::{AllocTag, Ownership, Shape};
use opal_core::shared::models::{AllocStrategy, FreeStrategy, VarId};
use opal_core::{compile_source, CompileOutput, CompilerConfig};

fn compile(src: &str) -> CompileOutput {
    let out = compile_source(src, &CompilerConfig::default()).expect("compilation failed");
    assert!(
        !out.diagnostics.has_errors(),
        "unexpected diagnostics:\n{}",
        out.diagnostics.report()
    );
    out
}

fn fn_id(out: &CompileOutput, name: &str) -> opal_core::shared::models::FnId {
    out.program
        .functions
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("no function `{}`", name))
        .id
}

fn var_named(out: &CompileOutput, func: &str, var: &str) -> (opal_core::shared::models::FnId, VarId) {
    let id = fn_id(out, func);
    let def = out.program.function(id);
    let v = def
        .vars
        .iter()
        .find(|(_, info)| info.name == var)
        .unwrap_or_else(|| panic!("no variable `{}` in `{}`", var, func))
        .0;
    (id, v)
}

// ── Scalar arithmetic stays on the stack ────────────────────────────────────

#[test]
fn scalar_arithmetic_emits_no_frees_and_stack_temporaries() {
    let out = compile("(+ 1 2)");
    // Every allocated temporary is stack-initialised
    for ctx in out.analyses.values() {
        for usage in &ctx.vars {
            if usage.alloc.is_some() {
                assert_eq!(
                    usage.alloc_strategy,
                    Some(AllocStrategy::Stack),
                    "non-stack temporary in scalar-only program"
                );
            }
        }
        assert!(ctx.frees_at.is_empty());
    }
    assert!(out.c_source.contains("STACK_INT"));
    assert!(!out.c_source.contains("free_unique"));
    assert!(!out.c_source.contains("free_obj"));
    assert!(!out.c_source.contains("dec_ref"));
    assert!(!out.c_source.contains("mk_int"));
}

// ── Unique list construction ────────────────────────────────────────────────

#[test]
fn unique_list_frees_once_at_the_head() {
    let out = compile(
        "(define (mk) (cons 1 (cons 2 (cons 3 ()))))\n\
         (display (mk))",
    );

    // Inside mk: every cell is a tree, and the inner cells are consumed by
    // their parents, so mk itself frees nothing.
    let mk = fn_id(&out, "mk");
    let ctx = &out.analyses[&mk];
    assert!(ctx.frees_at.is_empty(), "mk must not free what it returns");
    for usage in &ctx.vars {
        if let Some(site) = usage.alloc {
            if site.tag == AllocTag::Cell {
                assert_eq!(usage.shape, Shape::Tree);
                assert_eq!(usage.ownership, Ownership::Owned);
            }
        }
    }

    // The caller owns the fresh list and frees it exactly once
    let occurrences = out.c_source.matches("free_unique(").count();
    assert_eq!(occurrences, 1, "exactly one free of the list head:\n{}", out.c_source);
}

// ── Doubly-linked node: weak prev, release skips it ─────────────────────────

#[test]
fn doubly_linked_node_release_skips_weak_prev() {
    let out = compile(
        "(deftype Node (value int) (next Node) (prev Node))\n\
         (define (mk-node v n p) (Node v n p))",
    );

    let ty = out.program.types.resolve("Node").unwrap();
    let def = out.program.types.get(ty);
    assert_eq!(def.fields[1].name, "next");
    assert!(matches!(
        def.fields[1].strength,
        opal_core::shared::models::FieldStrength::Strong
    ));
    assert_eq!(def.fields[2].name, "prev");
    assert!(matches!(
        def.fields[2].strength,
        opal_core::shared::models::FieldStrength::Weak
    ));

    // release_Node: nullifies weak references, releases value and next,
    // never recurses into prev (field 2)
    let release = out
        .c_source
        .split("static void release_Node")
        .nth(1)
        .expect("release_Node emitted");
    let body = release.split('}').next().unwrap();
    assert!(body.contains("weak_nullify(v);"));
    assert!(body.contains("release(RECORD_FIELD(v, 0));"));
    assert!(body.contains("release(RECORD_FIELD(v, 1));"));
    assert!(!body.contains("release(RECORD_FIELD(v, 2));"));
}

// ── Branching last use: frees land in the branches, not the merge ──────────

#[test]
fn branch_local_death_frees_in_each_branch() {
    let out = compile(
        "(define (f c)\n\
           (let ((x (cons 1 2)))\n\
             (if (> c 0) (display x) (display 0))))",
    );
    let (f, x) = var_named(&out, "f", "x");
    let ctx = &out.analyses[&f];
    let cfg = &out.cfgs[&f];

    assert_eq!(ctx.usage(x).free_strategy, FreeStrategy::Unique);

    // x must be freed in both branch blocks and nowhere else; in particular
    // not at the merge block.
    let free_blocks: Vec<_> = ctx
        .frees_at
        .iter()
        .filter(|(_, vars)| vars.contains(&x))
        .map(|(b, _)| *b)
        .collect();
    assert_eq!(free_blocks.len(), 2, "one free per branch: {:?}", free_blocks);
    let branch_targets = match &cfg.block(cfg.entry).term {
        opal_core::shared::models::Terminator::Branch {
            then_bb, else_bb, ..
        } => vec![*then_bb, *else_bb],
        other => panic!("expected a branch terminator, got {:?}", other),
    };
    for b in &free_blocks {
        assert!(branch_targets.contains(b), "free placed outside the branches");
    }
}

// ── Reuse: free-then-alloc of the same tier rewrites in place ──────────────

#[test]
fn dead_cell_storage_is_reused_by_the_next_cell() {
    let out = compile(
        "(define (g)\n\
           (let ((old (cons 1 2)))\n\
             (let ((new (cons 3 4)))\n\
               new)))",
    );
    let (g, old) = var_named(&out, "g", "old");
    let (_, new) = var_named(&out, "g", "new");
    let ctx = &out.analyses[&g];

    assert_eq!(ctx.reuse.len(), 1);
    assert_eq!(ctx.reuse[0].freed, old);
    assert_eq!(ctx.reuse[0].alloc_var, new);

    assert_eq!(ctx.usage(new).alloc_strategy, Some(AllocStrategy::ReuseOf(old)));
    assert_eq!(ctx.usage(old).free_strategy, FreeStrategy::None);

    assert!(out.c_source.contains("reuse_as_cell("));
    // No separate free of the rewritten storage
    for vars in ctx.frees_at.values() {
        assert!(!vars.contains(&old));
    }
}

// ── Channel transfer ────────────────────────────────────────────────────────

#[test]
fn sent_value_is_transferred_and_not_freed_by_the_sender() {
    let out = compile(
        "(define (worker c) (display (recv c)))\n\
         (define (run)\n\
           (let ((c (chan 1))\n\
                 (xs (cons 1 (cons 2 ()))))\n\
             (do (spawn worker c)\n\
                 (send c xs)\n\
                 (close c))))",
    );
    let (run, xs) = var_named(&out, "run", "xs");
    let ctx = &out.analyses[&run];

    // The send consumes the list: ownership leaves the sender
    assert!(!ctx.usage(xs).transfer_sites.is_empty());
    assert_eq!(ctx.usage(xs).free_strategy, FreeStrategy::None);
    for vars in ctx.frees_at.values() {
        assert!(!vars.contains(&xs), "sender must not free a sent value");
    }

    // The receiver owns what it pulls off the channel
    let worker = fn_id(&out, "worker");
    let worker_ctx = &out.analyses[&worker];
    let received_owned = worker_ctx
        .vars
        .iter()
        .any(|u| u.ownership == Ownership::Owned && u.shape == Shape::Unknown);
    assert!(received_owned, "received value must be treated as owned");

    assert!(out.c_source.contains("channel_send("));
    assert!(out.c_source.contains("channel_recv("));
}

// ── Parameters that are only read are borrowed, hence never freed ──────────

#[test]
fn read_only_parameter_is_borrowed_and_never_freed() {
    let out = compile("(define (f x) (if (> x 0) (display x) (display 0)))");
    let (f, x) = var_named(&out, "f", "x");
    let ctx = &out.analyses[&f];
    assert_eq!(ctx.usage(x).ownership, Ownership::Borrowed);
    assert_eq!(ctx.usage(x).free_strategy, FreeStrategy::None);
    for vars in ctx.frees_at.values() {
        assert!(!vars.contains(&x));
    }
}

// ── Global definitions get initializers and main wires them up ─────────────

#[test]
fn globals_initialise_before_toplevel() {
    let out = compile("(define answer 41)\n(display (+ answer 1))");
    assert!(out.c_source.contains("static obj *o_answer = NULL;"));
    let main_at = out.c_source.find("int main(void)").unwrap();
    let init_at = out.c_source[main_at..].find("o_answer_init();").unwrap();
    let top_at = out.c_source[main_at..].find("o_toplevel();").unwrap();
    assert!(init_at < top_at, "initializers must run before the top level");
}
