//! AST value model
//!
//! The canonical tagged tree produced by the reader. Identity is structural:
//! two values with the same variant and payload compare equal regardless of
//! their source spans. Values are immutable after symbol resolution.

use serde::{Deserialize, Serialize};

use crate::shared::models::Span;

/// A node of the surface syntax tree.
///
/// Wraps the tagged payload together with an optional source span. The span
/// is carried for diagnostics only and is ignored by `PartialEq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub kind: ValueKind,
    pub span: Option<Span>,
}

/// Tagged payload of an AST node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Int(i64),
    Float(f64),
    Char(u32),
    Sym(String),
    Str(String),
    Nil,
    /// The canonical cons pair
    Cell(Box<Value>, Box<Value>),
    Array(Vec<Value>),
    /// Parse/analysis error carrier
    Error(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Value {
    pub fn new(kind: ValueKind, span: Option<Span>) -> Self {
        Self { kind, span }
    }

    pub fn int(v: i64) -> Self {
        Self::new(ValueKind::Int(v), None)
    }

    pub fn float(v: f64) -> Self {
        Self::new(ValueKind::Float(v), None)
    }

    pub fn ch(v: u32) -> Self {
        Self::new(ValueKind::Char(v), None)
    }

    pub fn sym(name: impl Into<String>) -> Self {
        Self::new(ValueKind::Sym(name.into()), None)
    }

    pub fn str(text: impl Into<String>) -> Self {
        Self::new(ValueKind::Str(text.into()), None)
    }

    pub fn nil() -> Self {
        Self::new(ValueKind::Nil, None)
    }

    pub fn cell(head: Value, tail: Value) -> Self {
        Self::new(ValueKind::Cell(Box::new(head), Box::new(tail)), None)
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self::new(ValueKind::Array(items), None)
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::new(ValueKind::Error(msg.into()), None)
    }

    /// Build a proper list (cons chain terminated by Nil)
    pub fn list(items: Vec<Value>) -> Self {
        let mut tail = Value::nil();
        for item in items.into_iter().rev() {
            tail = Value::cell(item, tail);
        }
        tail
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.kind, ValueKind::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ValueKind::Error(_))
    }

    /// Symbol text, if this node is a symbol
    pub fn as_sym(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Sym(s) => Some(s),
            _ => None,
        }
    }

    /// Flatten a proper list into its elements.
    ///
    /// Returns `None` for improper lists (dotted tails) and non-cells.
    /// `Nil` flattens to the empty slice.
    pub fn list_items(&self) -> Option<Vec<&Value>> {
        let mut items = Vec::new();
        let mut cursor = self;
        loop {
            match &cursor.kind {
                ValueKind::Nil => return Some(items),
                ValueKind::Cell(head, tail) => {
                    items.push(head.as_ref());
                    cursor = tail.as_ref();
                }
                _ => return None,
            }
        }
    }

    /// Head symbol of a list form, e.g. `if` for `(if c t e)`
    pub fn head_sym(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Cell(head, _) => head.as_sym(),
            _ => None,
        }
    }

    /// Walk the whole tree, calling `f` on every node
    pub fn walk(&self, f: &mut impl FnMut(&Value)) {
        f(self);
        match &self.kind {
            ValueKind::Cell(head, tail) => {
                head.walk(f);
                tail.walk(f);
            }
            ValueKind::Array(items) => {
                for item in items {
                    item.walk(f);
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Display for Value {
    /// Canonical textual rendering; `parse(format!(v)) == v` for error-free
    /// trees.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ValueKind::Int(v) => write!(f, "{}", v),
            ValueKind::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            ValueKind::Char(c) => match char::from_u32(*c) {
                Some(ch) => write!(f, "#\\{}", ch),
                None => write!(f, "#\\x{:x}", c),
            },
            ValueKind::Sym(s) => write!(f, "{}", s),
            ValueKind::Str(s) => write!(f, "{:?}", s),
            ValueKind::Nil => write!(f, "()"),
            ValueKind::Cell(_, _) => {
                write!(f, "(")?;
                let mut cursor = self;
                let mut first = true;
                loop {
                    match &cursor.kind {
                        ValueKind::Cell(head, tail) => {
                            if !first {
                                write!(f, " ")?;
                            }
                            write!(f, "{}", head)?;
                            first = false;
                            cursor = tail.as_ref();
                        }
                        ValueKind::Nil => break,
                        // Dotted tail
                        _ => {
                            write!(f, " . {}", cursor)?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            ValueKind::Array(items) => {
                write!(f, "#(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            ValueKind::Error(msg) => write!(f, "#<error {:?}>", msg),
        }
    }
}
