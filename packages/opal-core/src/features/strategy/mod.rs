//! Strategy selection: analysis results → one decision per variable/site

pub mod application;

pub use application::select_strategies;
