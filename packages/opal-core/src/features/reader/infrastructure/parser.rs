//! S-expression parser
//!
//! Turns the token stream into the canonical `Value` tree. Lists become
//! cons chains terminated by `Nil`; `'x` expands to `(quote x)`.

use crate::errors::{OpalError, Result};
use crate::features::reader::domain::{Token, TokenKind};
use crate::features::reader::infrastructure::lexer::Lexer;
use crate::shared::models::{Span, Value};

/// Parse a whole compilation unit into its top-level forms
pub fn parse_program(src: &str) -> Result<Vec<Value>> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut forms = Vec::new();
    while !parser.at_end() {
        forms.push(parser.parse_value()?);
    }
    Ok(forms)
}

/// Parse exactly one form; trailing input is an error
pub fn parse_one(src: &str) -> Result<Value> {
    let mut forms = parse_program(src)?;
    match forms.len() {
        1 => Ok(forms.remove(0)),
        0 => Err(OpalError::syntax("empty input")),
        _ => Err(OpalError::syntax("expected a single form")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_value(&mut self) -> Result<Value> {
        let Some(token) = self.bump() else {
            return Err(OpalError::syntax("unexpected end of input"));
        };
        let span = token.span;
        match token.kind {
            TokenKind::Int(v) => Ok(Value::int(v).with_span(span)),
            TokenKind::Float(v) => Ok(Value::float(v).with_span(span)),
            TokenKind::Char(c) => Ok(Value::ch(c).with_span(span)),
            TokenKind::Str(s) => Ok(Value::str(s).with_span(span)),
            TokenKind::Sym(s) => Ok(Value::sym(s).with_span(span)),
            TokenKind::Quote => {
                let quoted = self.parse_value()?;
                let full = span.merge(quoted.span.as_ref().unwrap_or(&span));
                Ok(Value::list(vec![Value::sym("quote"), quoted]).with_span(full))
            }
            TokenKind::LParen => self.parse_list(span),
            TokenKind::HashParen => self.parse_array(span),
            TokenKind::RParen => Err(OpalError::syntax(format!(
                "unbalanced `)` at {}",
                span
            ))),
        }
    }

    fn parse_list(&mut self, open: Span) -> Result<Value> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(OpalError::syntax(format!(
                        "unterminated list opened at {}",
                        open
                    )))
                }
                Some(token) if token.kind == TokenKind::RParen => {
                    let close = token.span;
                    self.bump();
                    return Ok(Value::list(items).with_span(open.merge(&close)));
                }
                Some(_) => items.push(self.parse_value()?),
            }
        }
    }

    fn parse_array(&mut self, open: Span) -> Result<Value> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(OpalError::syntax(format!(
                        "unterminated array opened at {}",
                        open
                    )))
                }
                Some(token) if token.kind == TokenKind::RParen => {
                    let close = token.span;
                    self.bump();
                    return Ok(Value::array(items).with_span(open.merge(&close)));
                }
                Some(_) => items.push(self.parse_value()?),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::ValueKind;

    #[test]
    fn test_parse_flat_list() {
        let v = parse_one("(+ 1 2)").unwrap();
        let items = v.list_items().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_sym(), Some("+"));
    }

    #[test]
    fn test_parse_nested() {
        let v = parse_one("(if (> x 0) x 0)").unwrap();
        let items = v.list_items().unwrap();
        assert_eq!(items.len(), 4);
        assert!(items[1].list_items().is_some());
    }

    #[test]
    fn test_quote_shorthand() {
        let v = parse_one("'(1 2)").unwrap();
        assert_eq!(v.head_sym(), Some("quote"));
    }

    #[test]
    fn test_empty_list_is_nil() {
        let v = parse_one("()").unwrap();
        assert!(matches!(v.kind, ValueKind::Nil));
    }

    #[test]
    fn test_array_literal() {
        let v = parse_one("#(1 2 3)").unwrap();
        assert!(matches!(v.kind, ValueKind::Array(ref items) if items.len() == 3));
    }

    #[test]
    fn test_unbalanced_paren_errors() {
        assert!(parse_one("(1 2").is_err());
        assert!(parse_one(")").is_err());
    }

    #[test]
    fn test_program_returns_all_forms() {
        let forms = parse_program("(define x 1) (display x)").unwrap();
        assert_eq!(forms.len(), 2);
    }

    #[test]
    fn test_spans_attached() {
        let v = parse_one("(foo)").unwrap();
        let span = v.span.unwrap();
        assert_eq!(span.start_line, 1);
    }
}
