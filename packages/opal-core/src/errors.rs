//! Error types for opal-core
//!
//! Parse and analysis errors accumulate in a `Diagnostics` sink and are
//! reported together; codegen errors are per-function fatal and stub the
//! offending function. No panics escape the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shared::models::Span;

/// Main error type for opal-core operations
#[derive(Debug, Error)]
pub enum OpalError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed surface syntax; compilation stops
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Unbound identifier; per-function fatal, the function is stubbed
    #[error("name error: {0}")]
    Name(String),

    /// Analysis could not establish a precondition
    #[error("analysis error: {0}")]
    Analysis(String),

    /// An impossible AST shape reached the code generator
    #[error("codegen error: {0}")]
    Codegen(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl OpalError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        OpalError::Syntax(msg.into())
    }

    pub fn name(msg: impl Into<String>) -> Self {
        OpalError::Name(msg.into())
    }

    pub fn analysis(msg: impl Into<String>) -> Self {
        OpalError::Analysis(msg.into())
    }

    pub fn codegen(msg: impl Into<String>) -> Self {
        OpalError::Codegen(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        OpalError::Config(msg.into())
    }
}

/// Result type alias for opal operations
pub type Result<T> = std::result::Result<T, OpalError>;

/// Severity of an accumulated diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Conservative default chosen; logged when verbose
    Note,
    Warning,
    Error,
}

/// One accumulated diagnostic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Option<Span>,
    /// Function the diagnostic belongs to, when known
    pub function: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            span,
            function: None,
        }
    }

    pub fn warning(message: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            span,
            function: None,
        }
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Note,
            message: message.into(),
            span: None,
            function: None,
        }
    }

    pub fn in_function(mut self, name: impl Into<String>) -> Self {
        self.function = Some(name.into());
        self
    }
}

/// Accumulator for parse/analysis diagnostics.
///
/// Errors do not abort the unit; they are collected and reported together
/// once the pipeline finishes.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.entries.push(diag);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render all entries, one per line
    pub fn report(&self) -> String {
        let mut out = String::new();
        for diag in &self.entries {
            let severity = match diag.severity {
                Severity::Note => "note",
                Severity::Warning => "warning",
                Severity::Error => "error",
            };
            match (&diag.function, &diag.span) {
                (Some(func), Some(span)) => {
                    out.push_str(&format!("{}: [{} @ {}] {}\n", severity, func, span, diag.message))
                }
                (Some(func), None) => {
                    out.push_str(&format!("{}: [{}] {}\n", severity, func, diag.message))
                }
                (None, Some(span)) => {
                    out.push_str(&format!("{}: [{}] {}\n", severity, span, diag.message))
                }
                (None, None) => out.push_str(&format!("{}: {}\n", severity, diag.message)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_accumulate() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning("shadowed binding", None));
        diags.push(Diagnostic::error("unbound identifier `foo`", None).in_function("f"));
        assert!(diags.has_errors());
        assert_eq!(diags.error_count(), 1);
        assert!(diags.report().contains("[f] unbound identifier"));
    }

    #[test]
    fn test_notes_are_not_errors() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::note("fallback to symmetric-rc"));
        assert!(!diags.has_errors());
    }
}
