//! Reader: lexer, parser and un-parser for the S-expression surface

pub mod domain;
pub mod infrastructure;

pub use infrastructure::parser::{parse_one, parse_program};
pub use infrastructure::printer::{unparse, unparse_program};
