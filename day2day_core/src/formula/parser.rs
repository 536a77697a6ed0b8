//! Tokenizer and recursive-descent parser for right-hand-side expressions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! expr    := mul (('+' | '-') mul)*
//! mul     := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := atom ('^' unary)?
//! atom    := NUMBER | STRING | IDENT | IDENT '(' args? ')' | '(' expr ')'
//! args    := arg (',' arg)*
//! arg     := (IDENT '=')? expr
//! ```
//!
//! `^` binds tighter than unary minus and is right-associative, so
//! `-2^2` is `-(2^2)` and `2^3^2` is `2^(3^2)`.

use super::{Arg, BinOp, Expr};
use crate::error::{Result, SimError};

// ── Tokenizer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Assign,
}

/// A token and the 1-based column it starts at.
#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    col: usize,
}

fn parse_err(src: &str, col: usize, msg: impl std::fmt::Display) -> SimError {
    SimError::Parse(format!("col {col} in '{src}': {msg}"))
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn tokenize(src: &str) -> Result<Vec<Spanned>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let col = i + 1;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '^' => Some(Token::Caret),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '=' => Some(Token::Assign),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(Spanned { token, col });
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '+' || chars[i] == '-')
                        && i > start
                        && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value: f64 = text
                .parse()
                .map_err(|_| parse_err(src, col, format!("invalid number '{text}'")))?;
            tokens.push(Spanned {
                token: Token::Num(value),
                col,
            });
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i == chars.len() {
                return Err(parse_err(src, col, "unterminated string literal"));
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Spanned {
                token: Token::Str(text),
                col,
            });
            i += 1;
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            tokens.push(Spanned {
                token: Token::Ident(chars[start..i].iter().collect()),
                col,
            });
            continue;
        }

        return Err(parse_err(src, col, format!("unexpected character '{c}'")));
    }

    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────

/// Maximum nesting of parentheses, calls and unary operators.
pub(crate) const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, tokens: Vec<Spanned>) -> Self {
        Self {
            src,
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    /// Column of the current token, or one past the end of input.
    fn col(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.src.chars().count() + 1, |s| s.col)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        let col = self.col();
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(parse_err(self.src, col, format!("expected {what}, got {t:?}"))),
            None => Err(parse_err(self.src, col, format!("expected {what}, got end of input"))),
        }
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // Every recursive path of the grammar passes through here.
    fn parse_unary(&mut self) -> Result<Expr> {
        if self.depth >= MAX_DEPTH {
            let col = self.col();
            return Err(parse_err(
                self.src,
                col,
                format!("expression nested deeper than {MAX_DEPTH} levels"),
            ));
        }
        self.depth += 1;
        let expr = self.parse_unary_inner();
        self.depth -= 1;
        expr
    }

    fn parse_unary_inner(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let e = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(e)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_atom()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        let col = self.col();
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Text(s)),
            Some(Token::LParen) => {
                let e = self.parse_add()?;
                self.expect(Token::RParen, "')'")?;
                Ok(e)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(t) => Err(parse_err(
                self.src,
                col,
                format!("expected number, name, string or '(', got {t:?}"),
            )),
            None => Err(parse_err(self.src, col, "unexpected end of input")),
        }
    }

    /// Parses call arguments after the opening parenthesis, through `)`.
    fn parse_args(&mut self) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.advance();
            return Ok(args);
        }
        loop {
            let name = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Ident(label)), Some(Token::Assign)) => {
                    let label = label.clone();
                    self.pos += 2;
                    Some(label)
                }
                _ => None,
            };
            let value = self.parse_add()?;
            args.push(Arg { name, value });

            let col = self.col();
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                Some(t) => {
                    return Err(parse_err(self.src, col, format!("expected ',' or ')', got {t:?}")))
                }
                None => return Err(parse_err(self.src, col, "unclosed argument list")),
            }
        }
        Ok(args)
    }
}

/// Parses one expression; the whole input must be consumed.
pub(crate) fn parse_expr(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(parse_err(src, 1, "empty expression"));
    }
    let mut parser = Parser::new(src, tokens);
    let expr = parser.parse_add()?;
    if parser.pos < parser.tokens.len() {
        let col = parser.col();
        return Err(parse_err(src, col, "unexpected trailing input"));
    }
    Ok(expr)
}
