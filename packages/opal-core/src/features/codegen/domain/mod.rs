//! Runtime contract
//!
//! The logical helpers the emitted C calls. The runtime library implements
//! each signature; every helper is idempotent on `NIL`/null input. The
//! driver selects among these names, it never invents others.

use serde::{Deserialize, Serialize};

use crate::features::memory_analysis::domain::ThreadClass;
use crate::shared::models::FreeStrategy;

/// Header pulled into every emitted translation unit
pub const RUNTIME_INCLUDE: &str = "#include \"opal_rt.h\"";

/// Named helpers of the runtime contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeFn {
    MkInt,
    MkFloat,
    MkChar,
    MkSym,
    MkStr,
    MkCell,
    StackInt,
    StackCell,
    IncRef,
    DecRef,
    AtomicIncRef,
    AtomicDecRef,
    FreeUnique,
    FreeTree,
    FreeObj,
    SccRelease,
    SymExitScope,
    WeakRegister,
    WeakNullify,
    RegionNew,
    RegionEnter,
    RegionExit,
    RegionAlloc,
    ChannelNew,
    ChannelSend,
    ChannelRecv,
    ChannelClose,
    ChannelFree,
    AssertOwned,
}

impl RuntimeFn {
    pub fn c_name(&self) -> &'static str {
        match self {
            RuntimeFn::MkInt => "mk_int",
            RuntimeFn::MkFloat => "mk_float",
            RuntimeFn::MkChar => "mk_char",
            RuntimeFn::MkSym => "mk_sym",
            RuntimeFn::MkStr => "mk_str",
            RuntimeFn::MkCell => "mk_cell",
            RuntimeFn::StackInt => "STACK_INT",
            RuntimeFn::StackCell => "STACK_CELL",
            RuntimeFn::IncRef => "inc_ref",
            RuntimeFn::DecRef => "dec_ref",
            RuntimeFn::AtomicIncRef => "atomic_inc_ref",
            RuntimeFn::AtomicDecRef => "atomic_dec_ref",
            RuntimeFn::FreeUnique => "free_unique",
            RuntimeFn::FreeTree => "free_tree",
            RuntimeFn::FreeObj => "free_obj",
            RuntimeFn::SccRelease => "scc_release",
            RuntimeFn::SymExitScope => "sym_exit_scope",
            RuntimeFn::WeakRegister => "weak_register",
            RuntimeFn::WeakNullify => "weak_nullify",
            RuntimeFn::RegionNew => "region_new",
            RuntimeFn::RegionEnter => "region_enter",
            RuntimeFn::RegionExit => "region_exit",
            RuntimeFn::RegionAlloc => "region_alloc",
            RuntimeFn::ChannelNew => "channel_new",
            RuntimeFn::ChannelSend => "channel_send",
            RuntimeFn::ChannelRecv => "channel_recv",
            RuntimeFn::ChannelClose => "channel_close",
            RuntimeFn::ChannelFree => "channel_free",
            RuntimeFn::AssertOwned => "ASSERT_OWNED",
        }
    }
}

/// The reference-count increment matching a value's thread class
pub fn retain_fn(thread: ThreadClass) -> RuntimeFn {
    match thread {
        ThreadClass::ThreadLocal => RuntimeFn::IncRef,
        ThreadClass::ThreadShared => RuntimeFn::AtomicIncRef,
    }
}

/// The reference-count decrement matching a value's thread class
pub fn release_fn(thread: ThreadClass) -> RuntimeFn {
    match thread {
        ThreadClass::ThreadLocal => RuntimeFn::DecRef,
        ThreadClass::ThreadShared => RuntimeFn::AtomicDecRef,
    }
}

/// The reclamation helper emitted for one inline free.
///
/// Returns `None` for strategies that never appear in `frees_at`.
pub fn free_call(strategy: FreeStrategy, thread: ThreadClass, is_channel: bool) -> Option<RuntimeFn> {
    match strategy {
        FreeStrategy::None | FreeStrategy::RegionExit => None,
        FreeStrategy::Unique if is_channel => Some(RuntimeFn::ChannelFree),
        FreeStrategy::Unique => Some(RuntimeFn::FreeUnique),
        FreeStrategy::Rc => Some(release_fn(thread)),
        FreeStrategy::SccRc => Some(RuntimeFn::SccRelease),
        // Symmetric RC: the scope object owns the cycle; a death point only
        // drops the variable's own reference
        FreeStrategy::SymmetricRc => Some(release_fn(thread)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_maps_to_free_unique() {
        assert_eq!(
            free_call(FreeStrategy::Unique, ThreadClass::ThreadLocal, false),
            Some(RuntimeFn::FreeUnique)
        );
    }

    #[test]
    fn test_rc_respects_thread_class() {
        assert_eq!(
            free_call(FreeStrategy::Rc, ThreadClass::ThreadLocal, false),
            Some(RuntimeFn::DecRef)
        );
        assert_eq!(
            free_call(FreeStrategy::Rc, ThreadClass::ThreadShared, false),
            Some(RuntimeFn::AtomicDecRef)
        );
    }

    #[test]
    fn test_region_and_none_emit_nothing() {
        assert_eq!(
            free_call(FreeStrategy::None, ThreadClass::ThreadLocal, false),
            None
        );
        assert_eq!(
            free_call(FreeStrategy::RegionExit, ThreadClass::ThreadLocal, false),
            None
        );
    }

    #[test]
    fn test_channels_free_through_channel_free() {
        assert_eq!(
            free_call(FreeStrategy::Unique, ThreadClass::ThreadLocal, true),
            Some(RuntimeFn::ChannelFree)
        );
    }
}
