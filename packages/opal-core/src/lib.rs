/*
 * opal-core - ahead-of-time S-expression compiler core
 *
 * Feature-first architecture:
 * - shared/    : common models (Value, Span, Cfg, strategies)
 * - features/  : vertical slices (reader → resolve → flow_graph →
 *                memory_analysis → strategy → free_placement → codegen)
 * - pipeline/  : orchestration
 *
 * The compiler decides, per allocation site and per variable use, which
 * reclamation mechanism the emitted C calls and exactly where: unique
 * frees, reference counts, SCC/symmetric RC for cycles, regions and
 * in-place reuse.
 */

#![allow(clippy::too_many_arguments)] // Analysis passes thread explicit context
#![allow(clippy::upper_case_acronyms)] // CFG, RC naming
#![allow(clippy::result_large_err)]

/// Shared models and utilities
pub mod shared;

/// Feature modules (pipeline stages)
pub mod features;

/// Pipeline orchestration
pub mod pipeline;

/// Compiler configuration
pub mod config;

/// Error types
pub mod errors;

pub use config::CompilerConfig;
pub use errors::{Diagnostic, Diagnostics, OpalError, Result, Severity};
pub use pipeline::{compile_source, compile_to_c, CompileOutput};
