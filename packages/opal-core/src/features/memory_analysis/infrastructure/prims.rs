//! Fixed summaries for primitive operations
//!
//! Primitives are not analysed; their parameter modes and return ownership
//! are part of the runtime contract.

use crate::features::memory_analysis::domain::{
    AllocTag, ParamMode, ReturnOwnership, Shape,
};
use crate::shared::models::PrimOp;

/// How a primitive treats its `idx`-th argument
pub fn prim_param_mode(op: PrimOp, idx: usize) -> ParamMode {
    match op {
        // Channel send transfers the value to the receiver
        PrimOp::ChanSend if idx == 1 => ParamMode::Captured,
        // Spawn captures everything after the function by transfer
        PrimOp::Spawn if idx > 0 => ParamMode::Captured,
        // cons owns its children; it is normally lowered to MakeCell and
        // only reaches here through a dynamic call
        PrimOp::Cons => ParamMode::Consumed,
        _ => ParamMode::Borrowed,
    }
}

/// Return ownership, shape and tag of a primitive's result
pub fn prim_return(op: PrimOp) -> (ReturnOwnership, Shape, Option<AllocTag>) {
    match op {
        PrimOp::Add
        | PrimOp::Sub
        | PrimOp::Mul
        | PrimOp::Div
        | PrimOp::NumEq
        | PrimOp::Lt
        | PrimOp::Gt
        | PrimOp::IsNull => (ReturnOwnership::Fresh, Shape::Tree, Some(AllocTag::Int)),
        PrimOp::Cons => (ReturnOwnership::Fresh, Shape::Tree, Some(AllocTag::Cell)),
        // Borrowed views into an existing structure
        PrimOp::Car | PrimOp::Cdr => (ReturnOwnership::Borrowed, Shape::Unknown, None),
        PrimOp::Display | PrimOp::Print | PrimOp::Newline => {
            (ReturnOwnership::None, Shape::Tree, None)
        }
        PrimOp::ChanNew => (ReturnOwnership::Fresh, Shape::Tree, Some(AllocTag::Chan)),
        // The received value arrives with transfer semantics but unknown
        // structure; the conservative strategy applies
        PrimOp::ChanRecv => (ReturnOwnership::Fresh, Shape::Unknown, None),
        PrimOp::ChanSend | PrimOp::ChanClose | PrimOp::Spawn => {
            (ReturnOwnership::None, Shape::Tree, None)
        }
    }
}
