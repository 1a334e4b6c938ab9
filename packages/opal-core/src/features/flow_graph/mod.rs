//! CFG construction from resolved expressions

pub mod application;

pub use application::build_cfg;
