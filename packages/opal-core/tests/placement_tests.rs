//! Free-placement invariants checked across a corpus of small programs:
//! liveness soundness, uniqueness per path, borrowed-never-freed and
//! transfer-never-doubled.

use opal_core::features::memory_analysis::Ownership;
use opal_core::shared::models::{BlockId, Terminator, VarId};
use opal_core::{compile_source, CompileOutput, CompilerConfig};

const CORPUS: &[&str] = &[
    "(display (+ 1 2))",
    "(define (mk) (cons 1 (cons 2 (cons 3 ()))))\n(display (mk))",
    "(define (f c) (let ((x (cons 1 2))) (if (> c 0) (display x) (display 0))))\n(f 1)",
    "(define (g) (let ((old (cons 1 2))) (let ((new (cons 3 4))) new)))\n(display (g))",
    "(define (len xs) (if (null? xs) 0 (+ 1 (len (cdr xs)))))\n(display (len (cons 1 ())))",
    "(deftype Node (value int) (next Node) (prev Node))\n\
     (define (n) (Node 7 () ()))\n(display (n))",
    "(define (worker c) (display (recv c)))\n\
     (define (run) (let ((c (chan 1)) (xs (cons 1 ()))) \
        (do (spawn worker c) (send c xs) (close c))))\n(run)",
];

fn compiled() -> Vec<CompileOutput> {
    CORPUS
        .iter()
        .map(|src| {
            let out = compile_source(src, &CompilerConfig::default()).expect("compile");
            assert!(
                !out.diagnostics.has_errors(),
                "diagnostics for {:?}:\n{}",
                src,
                out.diagnostics.report()
            );
            out
        })
        .collect()
}

/// Enumerate all acyclic entry→exit block paths of a function
fn paths(out: &CompileOutput, id: opal_core::shared::models::FnId) -> Vec<Vec<BlockId>> {
    let cfg = &out.cfgs[&id];
    let mut done = Vec::new();
    let mut work = vec![vec![cfg.entry]];
    while let Some(path) = work.pop() {
        let last = *path.last().unwrap();
        let succs = cfg.successors(last);
        if succs.is_empty() {
            done.push(path);
            continue;
        }
        for s in succs {
            if !path.contains(&s) {
                let mut next = path.clone();
                next.push(s);
                work.push(next);
            }
        }
    }
    done
}

#[test]
fn frees_never_target_live_variables() {
    for out in compiled() {
        for (id, ctx) in &out.analyses {
            let _ = id;
            for (block, vars) in &ctx.frees_at {
                for v in vars {
                    assert!(
                        !ctx.live_out[block.0 as usize].contains(v),
                        "{} freed in {} while still live",
                        v,
                        block
                    );
                }
            }
        }
    }
}

#[test]
fn at_most_one_free_per_variable_per_path() {
    for out in compiled() {
        for (id, ctx) in &out.analyses {
            for path in paths(&out, *id) {
                let mut counts: std::collections::HashMap<VarId, usize> = Default::default();
                for block in &path {
                    if let Some(vars) = ctx.frees_at.get(block) {
                        for v in vars {
                            *counts.entry(*v).or_default() += 1;
                        }
                    }
                }
                for (v, count) in counts {
                    assert!(
                        count <= 1,
                        "{} freed {} times on path {:?}",
                        v,
                        count,
                        path
                    );
                }
            }
        }
    }
}

#[test]
fn borrowed_variables_never_appear_in_free_sets() {
    for out in compiled() {
        for ctx in out.analyses.values() {
            for (idx, usage) in ctx.vars.iter().enumerate() {
                if usage.ownership == Ownership::Borrowed {
                    let v = VarId(idx as u32);
                    for vars in ctx.frees_at.values() {
                        assert!(!vars.contains(&v), "borrowed {} freed", v);
                    }
                }
            }
        }
    }
}

#[test]
fn transferred_variables_are_not_freed_after_the_transfer() {
    for out in compiled() {
        for (id, ctx) in &out.analyses {
            let cfg = &out.cfgs[id];
            for (idx, usage) in ctx.vars.iter().enumerate() {
                let v = VarId(idx as u32);
                for &site in &usage.transfer_sites {
                    // No free of v in the transfer block or any block
                    // reachable from it.
                    let mut reachable = vec![site];
                    let mut seen = std::collections::HashSet::new();
                    while let Some(b) = reachable.pop() {
                        if !seen.insert(b) {
                            continue;
                        }
                        if let Some(vars) = ctx.frees_at.get(&b) {
                            assert!(
                                !vars.contains(&v),
                                "{} freed in {} after transfer at {}",
                                v,
                                b,
                                site
                            );
                        }
                        reachable.extend(cfg.successors(b));
                    }
                }
            }
        }
    }
}

#[test]
fn every_function_path_terminates_in_return_or_unreachable() {
    for out in compiled() {
        for (id, _) in &out.analyses {
            let cfg = &out.cfgs[id];
            for path in paths(&out, *id) {
                let last = cfg.block(*path.last().unwrap());
                assert!(matches!(
                    last.term,
                    Terminator::Return(_) | Terminator::Unreachable
                ));
            }
        }
    }
}
