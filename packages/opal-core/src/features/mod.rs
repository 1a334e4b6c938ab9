//! Feature modules, one vertical slice per pipeline stage

pub mod codegen;
pub mod flow_graph;
pub mod free_placement;
pub mod memory_analysis;
pub mod reader;
pub mod resolve;
pub mod strategy;
