//! ASAP free placement over the CFG

pub mod application;

pub use application::place_frees;
