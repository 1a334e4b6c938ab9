//! Round-trip and coverage properties.

use proptest::prelude::*;

use opal_core::features::reader::{parse_one, parse_program, unparse, unparse_program};
use opal_core::shared::models::{FreeStrategy, Value};
use opal_core::{compile_source, CompilerConfig};

// ── Parse/unparse round trip ────────────────────────────────────────────────

fn sym_strategy() -> impl Strategy<Value = String> {
    // Symbols may carry punctuation; they must not start like a number
    "[a-z+*/<>=?!.^_-][a-z0-9+*/<>=?!.^_-]{0,8}".prop_filter("not a number", |s| {
        s.parse::<i64>().is_err() && s.parse::<f64>().is_err()
    })
}

fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::int),
        (-1.0e9f64..1.0e9).prop_map(Value::float),
        (32u32..127).prop_map(Value::ch),
        sym_strategy().prop_map(Value::sym),
        // Printable ASCII without `"` and `\`
        "[ !#-\\[\\]-~]{0,12}".prop_map(Value::str),
        Just(Value::nil()),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(4, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::list),
            prop::collection::vec(inner, 0..4).prop_map(Value::array),
        ]
    })
}

proptest! {
    /// Parsing, un-parsing and re-parsing is the identity on the tree
    #[test]
    fn round_trip_is_identity(value in value_strategy()) {
        let text = unparse(&value);
        let reparsed = parse_one(&text)
            .unwrap_or_else(|e| panic!("reparse of {:?} failed: {}", text, e));
        prop_assert_eq!(&reparsed, &value);
        // And once more for stability
        let again = parse_one(&unparse(&reparsed)).unwrap();
        prop_assert_eq!(&again, &value);
    }

    #[test]
    fn program_round_trip(values in prop::collection::vec(value_strategy(), 1..5)) {
        let text = unparse_program(&values);
        let reparsed = parse_program(&text).unwrap();
        prop_assert_eq!(reparsed, values);
    }
}

// ── Strategy table coverage ─────────────────────────────────────────────────

fn strategies_of(src: &str) -> Vec<FreeStrategy> {
    let out = compile_source(src, &CompilerConfig::default()).expect("compile");
    assert!(
        !out.diagnostics.has_errors(),
        "diagnostics:\n{}",
        out.diagnostics.report()
    );
    out.analyses
        .values()
        .flat_map(|ctx| ctx.vars.iter().map(|u| u.free_strategy))
        .collect()
}

#[test]
fn every_free_strategy_row_is_reachable() {
    // Unique: a fresh tree freed by its only owner
    assert!(strategies_of("(display (cons 1 2))").contains(&FreeStrategy::Unique));

    // RC: value-level sharing makes a DAG
    assert!(strategies_of(
        "(define (d) (let ((shared (cons 1 ()))) (cons shared (cons shared ()))))\n\
         (display (d))"
    )
    .contains(&FreeStrategy::Rc));

    // RC: a cycle broken by an inferred weak back edge
    assert!(strategies_of(
        "(deftype Node (value int) (next Node) (prev Node))\n\
         (define (n) (Node 1 () ()))\n\
         (display (n))"
    )
    .contains(&FreeStrategy::Rc));

    // SCC-RC: an unbroken frozen cross-type cycle
    assert!(strategies_of(
        "(deftype A (to B)) (deftype B (from A))\n\
         (define (a) (A ()))\n\
         (display (a))"
    )
    .contains(&FreeStrategy::SccRc));

    // Symmetric RC: an unbroken mutable cycle (a setter for M exists, so a
    // runtime cycle can close after construction)
    assert!(strategies_of(
        "(deftype M (value int) (succ M))\n\
         (define (tie a b) (set-M-succ! a b))\n\
         (define (m) (let ((x (M 1 ()))) (do (display (M-value x)) 0)))\n\
         (display (m))"
    )
    .contains(&FreeStrategy::SymmetricRc));

    // Region: several local tree allocations sharing one teardown
    assert!(strategies_of(
        "(define (r)\n\
           (let ((a (cons 1 2)) (b (cons 3 4)))\n\
             (do (display b) (display a) 0)))\n\
         (display (r))"
    )
    .contains(&FreeStrategy::RegionExit));

    // None: borrowed and transferred values are never freed
    assert!(strategies_of("(display (+ 1 2))").contains(&FreeStrategy::None));
}

#[test]
fn region_emits_single_teardown() {
    let out = compile_source(
        "(define (r)\n\
           (let ((a (cons 1 2)) (b (cons 3 4)))\n\
             (do (display b) (display a) 0)))\n\
         (display (r))",
        &CompilerConfig::default(),
    )
    .unwrap();
    assert!(out.c_source.contains("region_new("));
    assert_eq!(out.c_source.matches("region_exit(").count(), 1);
    assert!(out.c_source.contains("region_alloc("));
}
