//! S-expression lexer
//!
//! Atoms are integers, floats, strings, characters and symbols; punctuation
//! is permitted inside symbols. `;` comments run to end of line.

use crate::errors::{OpalError, Result};
use crate::features::reader::domain::{Token, TokenKind};
use crate::shared::models::Span;

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

/// Characters that terminate a symbol
fn is_delimiter(ch: u8) -> bool {
    ch.is_ascii_whitespace() || matches!(ch, b'(' | b')' | b'"' | b';' | b'\'')
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn here(&self) -> (u32, u32) {
        (self.line, self.col)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(ch) if ch.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b';') => {
                    while let Some(ch) = self.peek() {
                        if ch == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_trivia();
        let (start_line, start_col) = self.here();
        let span_to_here = |lexer: &Self| {
            let (end_line, end_col) = lexer.here();
            Span::new(start_line, start_col, end_line, end_col)
        };

        let Some(ch) = self.peek() else {
            return Ok(None);
        };

        match ch {
            b'(' => {
                self.bump();
                Ok(Some(Token::new(TokenKind::LParen, span_to_here(self))))
            }
            b')' => {
                self.bump();
                Ok(Some(Token::new(TokenKind::RParen, span_to_here(self))))
            }
            b'\'' => {
                self.bump();
                Ok(Some(Token::new(TokenKind::Quote, span_to_here(self))))
            }
            b'"' => {
                self.bump();
                let text = self.lex_string(start_line, start_col)?;
                Ok(Some(Token::new(TokenKind::Str(text), span_to_here(self))))
            }
            b'#' => match self.peek_at(1) {
                Some(b'(') => {
                    self.bump();
                    self.bump();
                    Ok(Some(Token::new(TokenKind::HashParen, span_to_here(self))))
                }
                Some(b'\\') => {
                    self.bump();
                    self.bump();
                    let ch = self.bump().ok_or_else(|| {
                        OpalError::syntax(format!(
                            "unterminated character literal at {}:{}",
                            start_line, start_col
                        ))
                    })?;
                    Ok(Some(Token::new(
                        TokenKind::Char(ch as u32),
                        span_to_here(self),
                    )))
                }
                _ => Err(OpalError::syntax(format!(
                    "unexpected `#` at {}:{}",
                    start_line, start_col
                ))),
            },
            _ => {
                let text = self.lex_atom();
                let (end_line, end_col) = self.here();
                let span = Span::new(start_line, start_col, end_line, end_col);
                Ok(Some(Token::new(classify_atom(&text), span)))
            }
        }
    }

    fn lex_string(&mut self, start_line: u32, start_col: u32) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(text),
                Some(b'\\') => {
                    let esc = self.bump().ok_or_else(|| {
                        OpalError::syntax(format!(
                            "unterminated string at {}:{}",
                            start_line, start_col
                        ))
                    })?;
                    match esc {
                        b'n' => text.push('\n'),
                        b't' => text.push('\t'),
                        b'\\' => text.push('\\'),
                        b'"' => text.push('"'),
                        other => text.push(other as char),
                    }
                }
                Some(ch) => text.push(ch as char),
                None => {
                    return Err(OpalError::syntax(format!(
                        "unterminated string at {}:{}",
                        start_line, start_col
                    )))
                }
            }
        }
    }

    fn lex_atom(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if is_delimiter(ch) {
                break;
            }
            self.bump();
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }
}

/// Decide whether an atom spells a number or a symbol
fn classify_atom(text: &str) -> TokenKind {
    if let Ok(v) = text.parse::<i64>() {
        // Bare `+`/`-` parse as symbols, not numbers
        if text != "+" && text != "-" {
            return TokenKind::Int(v);
        }
    }
    if text.contains('.') || text.contains('e') || text.contains('E') {
        if let Ok(v) = text.parse::<f64>() {
            return TokenKind::Float(v);
        }
    }
    TokenKind::Sym(text.to_string())
}
