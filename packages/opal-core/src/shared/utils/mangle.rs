//! Name mangling for emitted C identifiers
//!
//! The emitted identifier for user name `N` is `o_` followed by `N`'s bytes
//! with non-alphanumerics replaced by a fixed table. The mapping is total and
//! deterministic; distinct surface names may collide only through the
//! catch-all underscore, and codegen suffixes emitted names to keep them
//! unique.

/// Mangle a surface identifier into its emitted C name
pub fn mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push_str("o_");
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else {
            out.push_str(replacement(ch));
        }
    }
    out
}

fn replacement(ch: char) -> &'static str {
    match ch {
        '+' => "_add",
        '-' => "_sub",
        '*' => "_mul",
        '/' => "_div",
        '=' => "_eq",
        '<' => "_lt",
        '>' => "_gt",
        '?' => "_p",
        '!' => "_b",
        '.' => "_d",
        '_' => "__",
        _ => "_",
    }
}
