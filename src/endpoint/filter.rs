//! WHERE clause evaluation for the in-memory endpoint
//!
//! Supports the subset of the filter language the pipeline emits plus what
//! scripts commonly use: comparisons, `[NOT] IN`, `LIKE`, `INCLUDES`,
//! `EXCLUDES`, `AND`, `OR`, `NOT` and parentheses. Values compare numerically
//! when both sides are numbers and case-insensitively as text otherwise.

use std::cmp::Ordering;

use regex::Regex;

use crate::error::{Result, TransportError};
use crate::query::lexer::{FilterLexer, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Parsed filter expression
#[derive(Debug, Clone)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Compare {
        field: String,
        op: CompareOp,
        value: Option<String>,
    },
    In {
        field: String,
        values: Vec<Option<String>>,
        negated: bool,
    },
    Like {
        field: String,
        pattern: Regex,
    },
    Includes {
        field: String,
        values: Vec<String>,
        negated: bool,
    },
}

/// Parse a WHERE clause (without the keyword).
pub fn parse_filter(filter: &str) -> Result<FilterExpr> {
    let mut parser = FilterParser {
        tokens: FilterLexer::tokenize(filter),
        pos: 0,
        input: filter,
    };
    let expr = parser.parse_or()?;
    if !matches!(parser.peek(), TokenKind::EOF) {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

fn compare_text(left: &str, right: &str) -> Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.to_lowercase().cmp(&right.to_lowercase()),
    }
}

fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("(?is)^");
    for ch in pattern.chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| TransportError::QueryFailed(format!("invalid LIKE pattern: {e}")).into())
}

impl FilterExpr {
    /// Evaluate against a record. `value_of` returns the field's text, or
    /// `None` when it is null or empty.
    pub fn matches<F>(&self, value_of: &F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            FilterExpr::And(l, r) => l.matches(value_of) && r.matches(value_of),
            FilterExpr::Or(l, r) => l.matches(value_of) || r.matches(value_of),
            FilterExpr::Not(inner) => !inner.matches(value_of),
            FilterExpr::Compare { field, op, value } => {
                let actual = value_of(field);
                match (op, &actual, value) {
                    (CompareOp::Eq, None, None) => true,
                    (CompareOp::Ne, None, None) => false,
                    (CompareOp::Eq, _, None) | (CompareOp::Eq, None, _) => false,
                    (CompareOp::Ne, _, None) | (CompareOp::Ne, None, _) => true,
                    (_, Some(a), Some(v)) => {
                        let ordering = compare_text(a, v);
                        match op {
                            CompareOp::Eq => ordering == Ordering::Equal,
                            CompareOp::Ne => ordering != Ordering::Equal,
                            CompareOp::Gt => ordering == Ordering::Greater,
                            CompareOp::Lt => ordering == Ordering::Less,
                            CompareOp::Ge => ordering != Ordering::Less,
                            CompareOp::Le => ordering != Ordering::Greater,
                        }
                    }
                    _ => false,
                }
            }
            FilterExpr::In {
                field,
                values,
                negated,
            } => {
                let actual = value_of(field);
                let found = values.iter().any(|v| match (&actual, v) {
                    (None, None) => true,
                    (Some(a), Some(v)) => compare_text(a, v) == Ordering::Equal,
                    _ => false,
                });
                found != *negated
            }
            FilterExpr::Like { field, pattern } => {
                value_of(field).is_some_and(|v| pattern.is_match(&v))
            }
            FilterExpr::Includes {
                field,
                values,
                negated,
            } => {
                let actual = value_of(field).unwrap_or_default();
                let found = actual
                    .split(';')
                    .any(|item| values.iter().any(|v| v.eq_ignore_ascii_case(item.trim())));
                found != *negated
            }
        }
    }
}

struct FilterParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    input: &'a str,
}

impl FilterParser<'_> {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::EOF)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: &str) -> crate::error::DataMoveError {
        let at = self.tokens.get(self.pos).map(|t| t.span.start).unwrap_or(0);
        TransportError::QueryFailed(format!(
            "malformed filter `{}`: {message} at position {at}",
            self.input
        ))
        .into()
    }

    fn expect(&mut self, expected: TokenKind) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {expected:?}")))
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), TokenKind::And) {
            self.advance();
            let right = self.parse_not()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<FilterExpr> {
        if matches!(self.peek(), TokenKind::Not) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterExpr> {
        if matches!(self.peek(), TokenKind::LParen) {
            self.advance();
            let expr = self.parse_or()?;
            self.expect(TokenKind::RParen)?;
            return Ok(expr);
        }

        let field = match self.advance() {
            TokenKind::Ident(name) => name,
            _ => return Err(self.error("expected a field name")),
        };

        match self.advance() {
            TokenKind::Eq => self.comparison(field, CompareOp::Eq),
            TokenKind::Ne => self.comparison(field, CompareOp::Ne),
            TokenKind::Gt => self.comparison(field, CompareOp::Gt),
            TokenKind::Lt => self.comparison(field, CompareOp::Lt),
            TokenKind::Ge => self.comparison(field, CompareOp::Ge),
            TokenKind::Le => self.comparison(field, CompareOp::Le),
            TokenKind::In => Ok(FilterExpr::In {
                field,
                values: self.value_list()?,
                negated: false,
            }),
            TokenKind::Not => {
                self.expect(TokenKind::In)?;
                Ok(FilterExpr::In {
                    field,
                    values: self.value_list()?,
                    negated: true,
                })
            }
            TokenKind::Like => {
                let pattern = self.value()?.unwrap_or_default();
                Ok(FilterExpr::Like {
                    field,
                    pattern: like_to_regex(&pattern)?,
                })
            }
            kind @ (TokenKind::Includes | TokenKind::Excludes) => Ok(FilterExpr::Includes {
                field,
                values: self.value_list()?.into_iter().flatten().collect(),
                negated: kind == TokenKind::Excludes,
            }),
            _ => Err(self.error("expected an operator")),
        }
    }

    fn comparison(&mut self, field: String, op: CompareOp) -> Result<FilterExpr> {
        Ok(FilterExpr::Compare {
            field,
            op,
            value: self.value()?,
        })
    }

    fn value_list(&mut self) -> Result<Vec<Option<String>>> {
        self.expect(TokenKind::LParen)?;
        let mut values = Vec::new();
        if matches!(self.peek(), TokenKind::RParen) {
            self.advance();
            return Ok(values);
        }
        loop {
            values.push(self.value()?);
            match self.advance() {
                TokenKind::Comma => continue,
                TokenKind::RParen => break,
                _ => return Err(self.error("expected `,` or `)`")),
            }
        }
        Ok(values)
    }

    fn value(&mut self) -> Result<Option<String>> {
        match self.advance() {
            TokenKind::String(s) => Ok(Some(s)),
            TokenKind::Number(n) => Ok(Some(n)),
            TokenKind::DateTime(d) => Ok(Some(d)),
            TokenKind::True => Ok(Some("true".to_string())),
            TokenKind::False => Ok(Some("false".to_string())),
            TokenKind::Null => Ok(None),
            TokenKind::Minus => match self.advance() {
                TokenKind::Number(n) => Ok(Some(format!("-{n}"))),
                _ => Err(self.error("expected a number")),
            },
            TokenKind::DateLiteral(name) => {
                // LAST_N_DAYS:30
                if matches!(self.peek(), TokenKind::Colon) {
                    self.advance();
                    self.advance();
                }
                Ok(Some(name))
            }
            _ => Err(self.error("expected a value")),
        }
    }
}
