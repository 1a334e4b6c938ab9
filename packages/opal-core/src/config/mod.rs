//! Compiler configuration
//!
//! Everything the analyses consult that is not derived from the source text.

use serde::{Deserialize, Serialize};

/// Configuration for one compilation unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Field names treated as back edges by the shape heuristic
    pub back_edge_names: Vec<String>,

    /// Emit `ASSERT_OWNED` checks and tag diagnostics
    pub debug_assertions: bool,

    /// Log `AnalysisFallback` events at warn level instead of debug
    pub verbose: bool,

    /// Minimum allocation count for a scope to become a region
    pub region_min_allocs: usize,

    /// Emit a C `main` wrapper running top-level forms
    pub emit_main: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            back_edge_names: vec![
                "prev".to_string(),
                "parent".to_string(),
                "owner".to_string(),
                "up".to_string(),
                "back".to_string(),
            ],
            debug_assertions: false,
            verbose: false,
            region_min_allocs: 2,
            emit_main: true,
        }
    }
}

impl CompilerConfig {
    pub fn is_back_edge_name(&self, field: &str) -> bool {
        self.back_edge_names.iter().any(|n| n == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_back_edge_names() {
        let config = CompilerConfig::default();
        assert!(config.is_back_edge_name("prev"));
        assert!(config.is_back_edge_name("parent"));
        assert!(!config.is_back_edge_name("next"));
    }
}
