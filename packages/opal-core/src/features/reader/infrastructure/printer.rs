//! Un-parser
//!
//! Renders values back to surface text. Parsing the output of `unparse`
//! yields a structurally identical tree.

use crate::shared::models::Value;

/// Render one value
pub fn unparse(value: &Value) -> String {
    value.to_string()
}

/// Render a whole program, one form per line
pub fn unparse_program(forms: &[Value]) -> String {
    forms
        .iter()
        .map(unparse)
        .collect::<Vec<_>>()
        .join("\n")
}
