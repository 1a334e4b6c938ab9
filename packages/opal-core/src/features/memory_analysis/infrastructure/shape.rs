//! Shape analysis
//!
//! Classifies every allocation as Tree, DAG, Cyclic or Unknown. For record
//! types the classification is type-level: back-edge heuristics mark fields
//! `Weak`, and cycles in the remaining strong ownership graph decide the
//! cycle status. A single strong self-referential field is linear recursion
//! (a unique spine such as a list), not a cycle. If the type is mutated,
//! setters can close a runtime cycle and the cyclic strategies apply.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::CompilerConfig;
use crate::features::memory_analysis::domain::{
    AllocTag, AnalysisContext, Shape, SummaryMap,
};
use crate::features::memory_analysis::infrastructure::prims::prim_return;
use crate::shared::models::{
    Callee, Cfg, FieldStrength, OwnershipEdge, Rvalue, Stmt, TypeId, TypeRegistry, VarId,
};

/// Type-level classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeShape {
    pub shape: Shape,
    /// For `Shape::Cyclic`: every cycle includes a weak edge
    pub cycle_broken: bool,
    /// A setter for this type appears in the unit
    pub mutable: bool,
}

/// Apply the back-edge heuristics and classify every declared type.
///
/// Weak marking, in order:
/// (a) field name matches the configured back-edge set,
/// (b) second self-pointer in declaration order,
/// (c) user `^weak` annotation (already applied at parse time).
pub fn analyze_type_shapes(
    types: &mut TypeRegistry,
    config: &CompilerConfig,
) -> FxHashMap<TypeId, TypeShape> {
    apply_weak_heuristics(types, config);

    // Ownership graph over types; one edge per record-typed field
    let mut graph: DiGraph<TypeId, FieldStrength> = DiGraph::new();
    let mut nodes: FxHashMap<TypeId, NodeIndex> = FxHashMap::default();
    for (id, _) in types.iter() {
        nodes.insert(id, graph.add_node(id));
    }
    let mut edges = Vec::new();
    for (id, def) in types.iter() {
        for (field_idx, field) in def.fields.iter().enumerate() {
            if let Some(target_name) = field.field_type.named() {
                if let Some(target) = types.resolve(target_name) {
                    graph.add_edge(nodes[&id], nodes[&target], field.strength);
                    edges.push(OwnershipEdge {
                        from: id,
                        field_index: field_idx,
                        to: target,
                        is_back_edge: field.strength == FieldStrength::Weak,
                    });
                }
            }
        }
    }
    types.ownership_edges = edges;

    // Strong-only subgraph for cycle status
    let strong = graph.filter_map(
        |_, ty| Some(*ty),
        |_, strength| {
            if *strength == FieldStrength::Strong {
                Some(())
            } else {
                None
            }
        },
    );
    let mut in_strong_scc: FxHashMap<TypeId, bool> = FxHashMap::default();
    for scc in tarjan_scc(&strong) {
        let cyclic = scc.len() > 1;
        for node in scc {
            in_strong_scc.insert(strong[node], cyclic);
        }
    }

    let mut result = FxHashMap::default();
    for (id, def) in types.iter() {
        let recursive = type_is_recursive(&graph, &nodes, id);
        let strong_self_edges = def
            .fields
            .iter()
            .filter(|f| {
                f.strength == FieldStrength::Strong && f.field_type.named() == Some(&def.name)
            })
            .count();
        let strong_cyclic = in_strong_scc.get(&id).copied().unwrap_or(false)
            || strong_self_edges > 1;

        let shape = if !recursive {
            TypeShape {
                shape: Shape::Tree,
                cycle_broken: false,
                mutable: def.is_mutated,
            }
        } else if strong_cyclic {
            TypeShape {
                shape: Shape::Cyclic,
                cycle_broken: false,
                mutable: def.is_mutated,
            }
        } else if def.is_mutated {
            // A mutable recursive type can close a cycle at runtime
            TypeShape {
                shape: Shape::Cyclic,
                cycle_broken: false,
                mutable: true,
            }
        } else if def.has_weak_fields() {
            // Back references exist but every cycle crosses a weak edge
            TypeShape {
                shape: Shape::Cyclic,
                cycle_broken: true,
                mutable: false,
            }
        } else {
            // Linear recursion along a unique strong spine
            TypeShape {
                shape: Shape::Tree,
                cycle_broken: false,
                mutable: false,
            }
        };
        debug!(ty = %def.name, shape = %shape.shape, broken = shape.cycle_broken, "type classified");
        result.insert(id, shape);
    }

    // Record recursion flags
    let recursive_ids: Vec<TypeId> = types
        .iter()
        .map(|(id, _)| id)
        .filter(|id| type_is_recursive(&graph, &nodes, *id))
        .collect();
    for id in recursive_ids {
        types.get_mut(id).is_recursive = true;
    }

    result
}

fn apply_weak_heuristics(types: &mut TypeRegistry, config: &CompilerConfig) {
    let ids: Vec<TypeId> = types.iter().map(|(id, _)| id).collect();
    for id in ids {
        let own_name = types.get(id).name.clone();
        let def = types.get_mut(id);
        let mut seen_self_pointer = false;
        for field in &mut def.fields {
            let is_record = field.field_type.named().is_some();
            let is_self = field.field_type.named() == Some(own_name.as_str());
            if field.strength == FieldStrength::Weak {
                // User annotation; still counts toward declaration order
                if is_self {
                    seen_self_pointer = true;
                }
                continue;
            }
            if is_record && config.is_back_edge_name(&field.name) {
                field.strength = FieldStrength::Weak;
            } else if is_self && seen_self_pointer {
                // Second self-pointer is weak
                field.strength = FieldStrength::Weak;
            }
            if is_self && field.strength == FieldStrength::Strong {
                seen_self_pointer = true;
            }
        }
    }
}

fn type_is_recursive(
    graph: &DiGraph<TypeId, FieldStrength>,
    nodes: &FxHashMap<TypeId, NodeIndex>,
    id: TypeId,
) -> bool {
    let start = nodes[&id];
    // DFS back to the start node over edges of any strength
    let mut stack: Vec<NodeIndex> = graph.neighbors(start).collect();
    let mut visited = rustc_hash::FxHashSet::default();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if visited.insert(node) {
            stack.extend(graph.neighbors(node));
        }
    }
    false
}

/// Test hook for the shape invariant: after heuristics, the ownership graph
/// without its weak edges has no cycle through two or more types and at most
/// one strong self-pointer per type.
pub fn weak_split_is_acyclic(types: &TypeRegistry) -> bool {
    let mut graph: DiGraph<TypeId, ()> = DiGraph::new();
    let mut nodes: FxHashMap<TypeId, NodeIndex> = FxHashMap::default();
    for (id, _) in types.iter() {
        nodes.insert(id, graph.add_node(id));
    }
    for (id, def) in types.iter() {
        let mut strong_self = 0usize;
        for field in &def.fields {
            if field.strength != FieldStrength::Strong {
                continue;
            }
            if let Some(target_name) = field.field_type.named() {
                if target_name == def.name {
                    strong_self += 1;
                    if strong_self > 1 {
                        return false;
                    }
                    continue;
                }
                if let Some(target) = types.resolve(target_name) {
                    graph.add_edge(nodes[&id], nodes[&target], ());
                }
            }
        }
    }
    tarjan_scc(&graph).into_iter().all(|scc| scc.len() == 1)
}

/// Per-function refinement: propagate shapes to variables, demoting to DAG
/// where value-level sharing is observed.
pub fn refine_var_shapes(
    cfg: &Cfg,
    type_shapes: &FxHashMap<TypeId, TypeShape>,
    summaries: &SummaryMap,
    ctx: &mut AnalysisContext,
) {
    // A variable stored into two or more parents has multiple owners
    let mut store_uses: FxHashMap<VarId, usize> = FxHashMap::default();
    for block in &cfg.blocks {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Assign { rv, .. } => match rv {
                    Rvalue::MakeCell(a, b) => {
                        *store_uses.entry(*a).or_default() += 1;
                        *store_uses.entry(*b).or_default() += 1;
                    }
                    Rvalue::MakeRecord { fields, .. } | Rvalue::MakeArray(fields) => {
                        for f in fields {
                            *store_uses.entry(*f).or_default() += 1;
                        }
                    }
                    _ => {}
                },
                Stmt::FieldSet { value, .. } => {
                    *store_uses.entry(*value).or_default() += 1;
                }
                _ => {}
            }
        }
    }

    for block_id in cfg.reverse_postorder() {
        let block = cfg.block(block_id);
        for stmt in &block.stmts {
            let Stmt::Assign { dst, rv } = stmt else {
                continue;
            };
            let shape = match rv {
                Rvalue::Const(_) => (Shape::Tree, false, false),
                Rvalue::Use(src) => {
                    let s = ctx.usage(*src);
                    (s.shape, s.cycle_broken, s.cycle_mutable)
                }
                Rvalue::MakeCell(a, b) => {
                    let worst = worst_child(ctx, &[*a, *b]);
                    (worst.max_shape(Shape::Tree), worst.broken, worst.mutable)
                }
                Rvalue::MakeRecord { ty, fields } => {
                    let own = type_shapes
                        .get(ty)
                        .copied()
                        .unwrap_or(TypeShape {
                            shape: Shape::Unknown,
                            cycle_broken: false,
                            mutable: true,
                        });
                    let worst = worst_child(ctx, fields);
                    (
                        worst.max_shape(own.shape),
                        own.cycle_broken || worst.broken,
                        own.mutable || worst.mutable,
                    )
                }
                Rvalue::MakeArray(items) => {
                    let worst = worst_child(ctx, items);
                    (worst.max_shape(Shape::Dag), worst.broken, worst.mutable)
                }
                Rvalue::Call { callee, .. } => match callee {
                    Callee::Prim(op) => (prim_return(*op).1, false, false),
                    Callee::Fn(f) => match summaries.get(f) {
                        // Record returns keep their type-level cycle status
                        Some(s) => match s.ret_tag {
                            Some(AllocTag::Record(ty)) => {
                                let ts = type_shapes.get(&ty).copied().unwrap_or(TypeShape {
                                    shape: Shape::Unknown,
                                    cycle_broken: false,
                                    mutable: true,
                                });
                                (ts.shape, ts.cycle_broken, ts.mutable)
                            }
                            _ => (s.ret_shape, false, false),
                        },
                        None => (Shape::Unknown, false, false),
                    },
                    Callee::Dynamic(_) => (Shape::Unknown, false, false),
                },
                Rvalue::FieldGet { .. } | Rvalue::LoadGlobal(_) => {
                    (Shape::Unknown, false, false)
                }
                Rvalue::FnAddr(_) => (Shape::Tree, false, false),
            };
            // Sharing demotes Tree to DAG before parents read this shape
            let shared = store_uses.get(dst).copied().unwrap_or(0) >= 2;
            let usage = ctx.usage_mut(*dst);
            usage.shape = if shared && shape.0 == Shape::Tree {
                Shape::Dag
            } else {
                shape.0
            };
            usage.cycle_broken = shape.1;
            usage.cycle_mutable = shape.2;
        }
    }
}

struct WorstChild {
    shape: Shape,
    broken: bool,
    mutable: bool,
}

impl WorstChild {
    fn max_shape(&self, own: Shape) -> Shape {
        fn rank(s: Shape) -> u8 {
            match s {
                Shape::Tree => 0,
                Shape::Dag => 1,
                Shape::Cyclic => 2,
                Shape::Unknown => 3,
            }
        }
        if rank(self.shape) >= rank(own) {
            self.shape
        } else {
            own
        }
    }
}

fn worst_child(ctx: &AnalysisContext, children: &[VarId]) -> WorstChild {
    let mut worst = WorstChild {
        shape: Shape::Tree,
        broken: false,
        mutable: false,
    };
    for child in children {
        let usage = ctx.usage(*child);
        worst.shape = worst.max_shape(usage.shape);
        worst.broken |= usage.cycle_broken;
        worst.mutable |= usage.cycle_mutable;
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Diagnostics;
    use crate::features::reader::parse_program;
    use crate::features::resolve::resolve_program;
    use crate::shared::models::FieldStrength;

    fn types_for(src: &str) -> TypeRegistry {
        let forms = parse_program(src).unwrap();
        let mut diags = Diagnostics::new();
        let program = resolve_program(&forms, &mut diags);
        assert!(!diags.has_errors(), "{}", diags.report());
        program.types
    }

    #[test]
    fn test_doubly_linked_node_prev_is_weak() {
        let mut types = types_for("(deftype Node (value int) (next Node) (prev Node))");
        let shapes = analyze_type_shapes(&mut types, &CompilerConfig::default());
        let id = types.resolve("Node").unwrap();
        let def = types.get(id);
        assert_eq!(def.fields[1].strength, FieldStrength::Strong); // next
        assert_eq!(def.fields[2].strength, FieldStrength::Weak); // prev
        let shape = shapes[&id];
        assert_eq!(shape.shape, Shape::Cyclic);
        assert!(shape.cycle_broken);
    }

    #[test]
    fn test_second_self_pointer_is_weak() {
        // Field names avoid the configured back-edge set; only declaration
        // order triggers the weak marking.
        let mut types = types_for("(deftype T (a T) (b T))");
        analyze_type_shapes(&mut types, &CompilerConfig::default());
        let id = types.resolve("T").unwrap();
        let def = types.get(id);
        assert_eq!(def.fields[0].strength, FieldStrength::Strong);
        assert_eq!(def.fields[1].strength, FieldStrength::Weak);
        assert!(weak_split_is_acyclic(&types));
    }

    #[test]
    fn test_user_annotation_respected() {
        let mut types = types_for("(deftype T (child T ^weak))");
        let shapes = analyze_type_shapes(&mut types, &CompilerConfig::default());
        let id = types.resolve("T").unwrap();
        assert_eq!(types.get(id).fields[0].strength, FieldStrength::Weak);
        assert!(shapes[&id].cycle_broken);
    }

    #[test]
    fn test_list_like_type_is_tree() {
        let mut types = types_for("(deftype ListNode (value int) (rest ListNode))");
        let shapes = analyze_type_shapes(&mut types, &CompilerConfig::default());
        let id = types.resolve("ListNode").unwrap();
        assert_eq!(shapes[&id].shape, Shape::Tree);
        assert!(types.get(id).is_recursive);
    }

    #[test]
    fn test_cross_type_strong_cycle_is_unbroken() {
        let mut types = types_for("(deftype A (to B)) (deftype B (from A))");
        let shapes = analyze_type_shapes(&mut types, &CompilerConfig::default());
        let a = types.resolve("A").unwrap();
        let shape = shapes[&a];
        assert_eq!(shape.shape, Shape::Cyclic);
        assert!(!shape.cycle_broken);
        assert!(!weak_split_is_acyclic(&types));
    }

    #[test]
    fn test_non_recursive_type_is_tree() {
        let mut types = types_for("(deftype Point (x int) (y int))");
        let shapes = analyze_type_shapes(&mut types, &CompilerConfig::default());
        let id = types.resolve("Point").unwrap();
        assert_eq!(shapes[&id].shape, Shape::Tree);
        assert!(!types.get(id).is_recursive);
    }

    #[test]
    fn test_ownership_edges_label_back_edges() {
        let mut types = types_for("(deftype Node (value int) (next Node) (prev Node))");
        analyze_type_shapes(&mut types, &CompilerConfig::default());
        let back: Vec<_> = types
            .ownership_edges
            .iter()
            .filter(|e| e.is_back_edge)
            .collect();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].field_index, 2);
    }
}
