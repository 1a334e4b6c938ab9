//! Memory analysis domain model
//!
//! Value objects (escape lattice, ownership modes, shapes) and the
//! per-function `AnalysisContext` every pass reads and writes. Lattice
//! operations live here; the passes themselves are infrastructure.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::shared::models::{
    AllocStrategy, BlockId, FnId, FreeStrategy, RegionId, TypeId, VarId,
};

// ═══════════════════════════════════════════════════════════════════════════
// Value Objects
// ═══════════════════════════════════════════════════════════════════════════

/// Where a value's references can be observed after the current scope ends.
///
/// Lattice: `Local < Returned < Captured < Global`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EscapeClass {
    /// Never observable outside the defining scope
    Local,
    /// Flows to the function's return value
    Returned,
    /// Stored into a heap object that itself is not Local
    Captured,
    /// Assigned to a top-level binding
    Global,
}

impl EscapeClass {
    /// Least upper bound; the derived `Ord` follows lattice order
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EscapeClass::Local)
    }
}

impl Default for EscapeClass {
    fn default() -> Self {
        EscapeClass::Local
    }
}

impl fmt::Display for EscapeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscapeClass::Local => write!(f, "local"),
            EscapeClass::Returned => write!(f, "returned"),
            EscapeClass::Captured => write!(f, "captured"),
            EscapeClass::Global => write!(f, "global"),
        }
    }
}

/// Caller/callee contract for a value at its definition site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ownership {
    /// Fresh allocation result, or a value the caller transferred to us
    Owned,
    /// Read-only alias of another owned value
    Borrowed,
    /// Consumed by a call or returned directly
    Transferred,
}

impl Default for Ownership {
    fn default() -> Self {
        Ownership::Owned
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::Owned => write!(f, "owned"),
            Ownership::Borrowed => write!(f, "borrowed"),
            Ownership::Transferred => write!(f, "transferred"),
        }
    }
}

/// Conservative classification of the value graph reachable from an
/// allocation site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// Single-parent, acyclic; unique-ownership spine
    Tree,
    /// Multiple parents possible, no cycle
    Dag,
    /// A type-level cycle exists
    Cyclic,
    Unknown,
}

impl Default for Shape {
    fn default() -> Self {
        Shape::Unknown
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Tree => write!(f, "tree"),
            Shape::Dag => write!(f, "dag"),
            Shape::Cyclic => write!(f, "cyclic"),
            Shape::Unknown => write!(f, "unknown"),
        }
    }
}

/// Thread visibility of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadClass {
    ThreadLocal,
    /// Uses the atomic reference counter
    ThreadShared,
}

impl Default for ThreadClass {
    fn default() -> Self {
        ThreadClass::ThreadLocal
    }
}

/// Tag shape of an allocation site; reuse pairs must match size tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocTag {
    Int,
    Float,
    Char,
    Sym,
    Str,
    Cell,
    Array,
    Record(TypeId),
    /// Channel object; reclaimed with `channel_free`
    Chan,
}

impl AllocTag {
    /// Payload slots; two sites can share storage only with equal tiers
    pub fn size_tier(&self, record_fields: impl Fn(TypeId) -> usize) -> usize {
        match self {
            AllocTag::Int | AllocTag::Float | AllocTag::Char | AllocTag::Sym | AllocTag::Str => 1,
            AllocTag::Cell => 2,
            AllocTag::Array => 2,
            AllocTag::Record(ty) => record_fields(*ty),
            AllocTag::Chan => 2,
        }
    }

    /// Scalar tags have statically bounded size and may live on the stack
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            AllocTag::Int | AllocTag::Float | AllocTag::Char | AllocTag::Sym
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Interprocedural summaries
// ═══════════════════════════════════════════════════════════════════════════

/// How a callee treats one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamMode {
    /// Read only; caller keeps ownership
    Borrowed,
    /// Callee takes ownership; caller must not free
    Consumed,
    /// Returned to the caller unchanged
    Passthrough,
    /// Stored beyond the call (heap or spawned thread)
    Captured,
}

/// Ownership of a function's return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnOwnership {
    /// Caller owns a fresh value
    Fresh,
    /// Returns parameter `idx` unchanged
    Passthrough(usize),
    /// Caller must not free
    Borrowed,
    /// No meaningful value
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSummary {
    pub mode: ParamMode,
    pub escapes: EscapeClass,
}

/// Per-function summary consulted at call sites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnSummary {
    pub params: Vec<ParamSummary>,
    pub ret: ReturnOwnership,
    /// Shape of a `Fresh` return, for the caller's strategy selection
    pub ret_shape: Shape,
    pub ret_tag: Option<AllocTag>,
    pub allocates: bool,
    pub may_throw: bool,
    pub may_spawn: bool,
}

impl FnSummary {
    /// Initial summary for recursive call cycles: all parameters consumed,
    /// return fresh. Always sound, only less efficient.
    pub fn pessimistic(param_count: usize) -> Self {
        Self {
            params: vec![
                ParamSummary {
                    mode: ParamMode::Consumed,
                    escapes: EscapeClass::Captured,
                };
                param_count
            ],
            ret: ReturnOwnership::Fresh,
            ret_shape: Shape::Unknown,
            ret_tag: None,
            allocates: true,
            may_throw: true,
            may_spawn: false,
        }
    }

    pub fn param_mode(&self, idx: usize) -> ParamMode {
        self.params
            .get(idx)
            .map(|p| p.mode)
            .unwrap_or(ParamMode::Consumed)
    }
}

/// Summaries for every function in the unit
pub type SummaryMap = FxHashMap<FnId, FnSummary>;

// ═══════════════════════════════════════════════════════════════════════════
// Analysis records
// ═══════════════════════════════════════════════════════════════════════════

/// Allocation site owned by a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSite {
    pub block: BlockId,
    pub stmt_idx: usize,
    pub tag: AllocTag,
}

/// Free-then-alloc pair eligible for in-place reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReuseCandidate {
    /// The variable whose storage is rewritten
    pub freed: VarId,
    /// The allocation receiving the storage
    pub alloc_var: VarId,
    pub block: BlockId,
    pub stmt_idx: usize,
}

/// One inferred region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInfo {
    pub id: RegionId,
    pub vars: Vec<VarId>,
    pub entry: BlockId,
    /// Single teardown point
    pub exit: BlockId,
}

/// Everything the pipeline knows about one variable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VarUsage {
    pub first_def: Option<BlockId>,
    pub use_blocks: FxHashSet<BlockId>,
    /// Last-use block per CFG path from the definition
    pub last_use_blocks: Vec<BlockId>,
    pub escape: EscapeClass,
    pub ownership: Ownership,
    /// Use sites at which ownership leaves this variable
    pub transfer_sites: FxHashSet<BlockId>,
    pub shape: Shape,
    /// For `Shape::Cyclic`: every cycle is broken by weak edges
    pub cycle_broken: bool,
    /// The cycle's type is mutated somewhere in the unit
    pub cycle_mutable: bool,
    pub is_captured: bool,
    pub thread: ThreadClass,
    pub region: Option<RegionId>,
    pub alloc: Option<AllocSite>,
    /// The allocation happened inside a callee; the value is already on the
    /// heap and can never be stack-initialised here
    pub alloc_is_call: bool,
    pub free_strategy: FreeStrategy,
    pub alloc_strategy: Option<AllocStrategy>,
}

impl VarUsage {
    pub fn is_transferred_at(&self, block: BlockId) -> bool {
        self.transfer_sites.contains(&block)
    }
}

/// Shared per-function analysis state, keyed by variable id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub fn_id: FnId,
    pub vars: Vec<VarUsage>,
    /// Indexed by block
    pub live_in: Vec<FxHashSet<VarId>>,
    pub live_out: Vec<FxHashSet<VarId>>,
    pub reuse: Vec<ReuseCandidate>,
    pub regions: Vec<RegionInfo>,
    /// Ordered frees per block, reverse definition order
    pub frees_at: FxHashMap<BlockId, Vec<VarId>>,
    /// Conservative defaults taken (AnalysisFallback events)
    pub fallbacks: u32,
}

impl AnalysisContext {
    pub fn new(fn_id: FnId, var_count: usize, block_count: usize) -> Self {
        Self {
            fn_id,
            vars: vec![VarUsage::default(); var_count],
            live_in: vec![FxHashSet::default(); block_count],
            live_out: vec![FxHashSet::default(); block_count],
            reuse: Vec::new(),
            regions: Vec::new(),
            frees_at: FxHashMap::default(),
            fallbacks: 0,
        }
    }

    pub fn usage(&self, var: VarId) -> &VarUsage {
        &self.vars[var.0 as usize]
    }

    pub fn usage_mut(&mut self, var: VarId) -> &mut VarUsage {
        &mut self.vars[var.0 as usize]
    }

    /// The reuse candidate rewriting `freed`, if any
    pub fn reuse_of(&self, freed: VarId) -> Option<&ReuseCandidate> {
        self.reuse.iter().find(|c| c.freed == freed)
    }

    /// The candidate whose allocation is `alloc_var`, if any
    pub fn reuse_into(&self, alloc_var: VarId) -> Option<&ReuseCandidate> {
        self.reuse.iter().find(|c| c.alloc_var == alloc_var)
    }
}
