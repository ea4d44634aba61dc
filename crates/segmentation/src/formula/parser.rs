//! Recursive-descent parser for the formula language.
//!
//! ```text
//! expr       := comparison
//! comparison := additive (cmp_op additive)?
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/") unary)*
//! unary      := "-" unary | primary
//! primary    := NUMBER | DURATION | STRING | true | false | null
//!             | IDENT "(" args? ")" | IDENT | "(" expr ")"
//! ```
//!
//! Arithmetic is only accepted inside `MATH(...)` or `DATE(...)`.

use logos::Logos;
use std::ops::Range;

use super::ast::{BinaryOp, Expr, Function};
use super::lexer::Token;
use super::ParseError;

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse(source: &str) -> ParseResult<Expr> {
    let mut tokens = Vec::new();
    for (token, span) in Token::lexer(source).spanned() {
        match token {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                return Err(ParseError::new(
                    span.start,
                    format!("invalid token '{}'", &source[span.clone()]),
                ))
            }
        }
    }
    if tokens.is_empty() {
        return Err(ParseError::new(0, "formula is empty"));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        arithmetic_depth: 0,
        end: source.len(),
    };
    let expr = parser.expr()?;
    if let Some((token, span)) = parser.peek_spanned() {
        let message = if *token == Token::RParen {
            "unbalanced ')'".to_string()
        } else {
            format!("unexpected {token} after end of expression")
        };
        return Err(ParseError::new(span.start, message));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(Token, Range<usize>)>,
    pos: usize,
    /// Number of enclosing MATH/DATE calls.
    arithmetic_depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_spanned(&self) -> Option<(&Token, &Range<usize>)> {
        self.tokens.get(self.pos).map(|(t, s)| (t, s))
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.start)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> ParseResult<()> {
        match self.peek() {
            Some(t) if *t == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(t) => Err(ParseError::new(
                self.position(),
                format!("expected {what}, found {t}"),
            )),
            None => Err(ParseError::new(
                self.end,
                format!("expected {what}, found end of formula"),
            )),
        }
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::NotEq,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.require_arithmetic_context()?;
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.require_arithmetic_context()?;
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.peek() == Some(&Token::Minus) {
            // Negative literals are fine anywhere; negating anything else is arithmetic.
            match self.tokens.get(self.pos + 1).map(|(t, _)| t) {
                Some(Token::Number(n)) => {
                    let n = *n;
                    self.pos += 2;
                    return Ok(Expr::Number(-n));
                }
                Some(Token::Duration(d)) => {
                    let d = *d;
                    self.pos += 2;
                    return Ok(Expr::Duration(-d));
                }
                _ => {}
            }
            self.require_arithmetic_context()?;
            self.pos += 1;
            let inner = self.unary()?;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let position = self.position();
        let Some(token) = self.advance() else {
            return Err(ParseError::new(self.end, "unexpected end of formula"));
        };
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Duration(d) => Ok(Expr::Duration(d)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "')' to close '('")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    return self.call(&name, position);
                }
                Ok(match name.as_str() {
                    "true" | "TRUE" => Expr::Bool(true),
                    "false" | "FALSE" => Expr::Bool(false),
                    "null" | "NULL" => Expr::Null,
                    _ => Expr::Ident(name),
                })
            }
            Token::RParen => Err(ParseError::new(position, "unbalanced ')'")),
            other => Err(ParseError::new(
                position,
                format!("unexpected {other}"),
            )),
        }
    }

    fn call(&mut self, name: &str, position: usize) -> ParseResult<Expr> {
        let func = Function::lookup(name)
            .ok_or_else(|| ParseError::new(position, format!("unknown function '{name}'")))?;
        self.expect(Token::LParen, "'('")?;

        let enters_arithmetic = matches!(func, Function::Math | Function::Date);
        if enters_arithmetic {
            self.arithmetic_depth += 1;
        }
        let args = self.arguments();
        if enters_arithmetic {
            self.arithmetic_depth -= 1;
        }
        let args = args?;

        let (min, max) = func.arity();
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            let wanted = match max {
                Some(m) if m == min => format!("{min}"),
                Some(m) => format!("{min} to {m}"),
                None => format!("at least {min}"),
            };
            return Err(ParseError::new(
                position,
                format!(
                    "{} expects {wanted} argument(s), got {}",
                    func.name(),
                    args.len()
                ),
            ));
        }
        Ok(Expr::Call { func, args })
    }

    fn arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                Some(Token::RParen) => {
                    self.pos += 1;
                    return Ok(args);
                }
                Some(other) => {
                    return Err(ParseError::new(
                        self.position(),
                        format!("expected ',' or ')', found {other}"),
                    ))
                }
                None => {
                    return Err(ParseError::new(
                        self.end,
                        "unbalanced '(': missing ')'",
                    ))
                }
            }
        }
    }

    fn require_arithmetic_context(&self) -> ParseResult<()> {
        if self.arithmetic_depth > 0 {
            return Ok(());
        }
        Err(ParseError::new(
            self.position(),
            "arithmetic is only allowed inside MATH() or DATE()",
        ))
    }
}
