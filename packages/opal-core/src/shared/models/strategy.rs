//! Reclamation strategy value objects
//!
//! The strategy selector assigns exactly one `AllocStrategy` per allocation
//! site and one `FreeStrategy` per variable per path. Shared here because
//! the selector, the free-point placer and codegen all consume them.

use serde::{Deserialize, Serialize};

use crate::shared::models::VarId;

/// Index of an inferred region within one function
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RegionId(pub u32);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// How a variable's value is reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FreeStrategy {
    /// Borrowed or transferred at last use; nothing to emit
    None,
    /// Refcount provably 1: `free_unique` / `free_tree`, no re-check
    Unique,
    /// Reference counted: `dec_ref` / `free_obj`
    Rc,
    /// Frozen cycle released as a strongly connected component
    SccRc,
    /// Mutable cycle owned by a scope object
    SymmetricRc,
    /// Reclaimed by region teardown at scope exit, never listed in frees
    RegionExit,
}

impl FreeStrategy {
    /// Whether the free-point placer lists this variable in `frees_at`
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            FreeStrategy::Unique | FreeStrategy::Rc | FreeStrategy::SccRc | FreeStrategy::SymmetricRc
        )
    }

    /// Tie-break rank: none > region-exit > unique > RC > SCC/symmetric
    pub fn rank(&self) -> u8 {
        match self {
            FreeStrategy::None => 0,
            FreeStrategy::RegionExit => 1,
            FreeStrategy::Unique => 2,
            FreeStrategy::Rc => 3,
            FreeStrategy::SccRc => 4,
            FreeStrategy::SymmetricRc => 5,
        }
    }
}

impl Default for FreeStrategy {
    fn default() -> Self {
        FreeStrategy::None
    }
}

impl std::fmt::Display for FreeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FreeStrategy::None => "none",
            FreeStrategy::Unique => "unique",
            FreeStrategy::Rc => "rc",
            FreeStrategy::SccRc => "scc-rc",
            FreeStrategy::SymmetricRc => "symmetric-rc",
            FreeStrategy::RegionExit => "region-exit",
        };
        write!(f, "{}", name)
    }
}

/// How an allocation site obtains its storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocStrategy {
    Heap,
    /// Non-escaping, statically bounded: `STACK_*` initialisation
    Stack,
    Region(RegionId),
    /// In-place rewrite of a soon-to-be-freed value of the same size class
    ReuseOf(VarId),
}

impl AllocStrategy {
    /// Tie-break rank: reuse > region > stack > heap
    pub fn rank(&self) -> u8 {
        match self {
            AllocStrategy::ReuseOf(_) => 0,
            AllocStrategy::Region(_) => 1,
            AllocStrategy::Stack => 2,
            AllocStrategy::Heap => 3,
        }
    }
}

impl std::fmt::Display for AllocStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocStrategy::Heap => write!(f, "heap"),
            AllocStrategy::Stack => write!(f, "stack"),
            AllocStrategy::Region(r) => write!(f, "region({})", r),
            AllocStrategy::ReuseOf(v) => write!(f, "reuse({})", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_tie_break_order() {
        assert!(FreeStrategy::None.rank() < FreeStrategy::RegionExit.rank());
        assert!(FreeStrategy::RegionExit.rank() < FreeStrategy::Unique.rank());
        assert!(FreeStrategy::Unique.rank() < FreeStrategy::Rc.rank());
        assert!(FreeStrategy::Rc.rank() < FreeStrategy::SccRc.rank());
    }

    #[test]
    fn test_alloc_tie_break_order() {
        assert!(AllocStrategy::ReuseOf(VarId(0)).rank() < AllocStrategy::Region(RegionId(0)).rank());
        assert!(AllocStrategy::Region(RegionId(0)).rank() < AllocStrategy::Stack.rank());
        assert!(AllocStrategy::Stack.rank() < AllocStrategy::Heap.rank());
    }

    #[test]
    fn test_inline_strategies() {
        assert!(FreeStrategy::Unique.is_inline());
        assert!(!FreeStrategy::None.is_inline());
        assert!(!FreeStrategy::RegionExit.is_inline());
    }
}
