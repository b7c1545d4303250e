//! Length-bounded filter clause generation
//!
//! Values and sub-clauses are packed greedily: a new clause starts exactly
//! when appending the next item would push the clause past the configured
//! maximum filter length, or the composed query past the maximum query
//! length. An item that is too large on its own is still emitted, alone.

use chrono::{DateTime, Utc};
use serde_json::Value;

const WHERE_KEYWORD: &str = " WHERE ";

/// A value serialized into a filter literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ClauseValue {
    Text(String),
    DateTime(DateTime<Utc>),
    Bool(bool),
    Null,
    /// Anything else; emitted quoted
    Other(String),
}

impl From<&str> for ClauseValue {
    fn from(value: &str) -> Self {
        ClauseValue::Text(value.to_string())
    }
}

impl From<String> for ClauseValue {
    fn from(value: String) -> Self {
        ClauseValue::Text(value)
    }
}

impl From<bool> for ClauseValue {
    fn from(value: bool) -> Self {
        ClauseValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for ClauseValue {
    fn from(value: DateTime<Utc>) -> Self {
        ClauseValue::DateTime(value)
    }
}

impl From<&Value> for ClauseValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => ClauseValue::Null,
            Value::Bool(b) => ClauseValue::Bool(*b),
            Value::String(s) => ClauseValue::Text(s.clone()),
            Value::Number(n) => ClauseValue::Other(n.to_string()),
            other => ClauseValue::Other(other.to_string()),
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Serialize a value as a filter literal.
pub fn format_literal(value: &ClauseValue) -> String {
    match value {
        ClauseValue::Text(s) | ClauseValue::Other(s) => format!("'{}'", escape(s)),
        ClauseValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        ClauseValue::Bool(b) => b.to_string(),
        ClauseValue::Null => "null".to_string(),
    }
}

/// `A = 'x' AND B = 'y'` for matching one record on several fields.
pub fn equality_clause(pairs: &[(String, ClauseValue)]) -> String {
    pairs
        .iter()
        .map(|(field, value)| format!("{field} = {}", format_literal(value)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Boolean operator used to combine sub-clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOperator {
    And,
    Or,
}

impl BoolOperator {
    fn separator(&self) -> &'static str {
        match self {
            BoolOperator::And => " AND ",
            BoolOperator::Or => " OR ",
        }
    }
}

/// Clause length bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClauseLimits {
    pub max_clause_length: usize,
    pub max_query_length: usize,
}

impl Default for ClauseLimits {
    fn default() -> Self {
        Self {
            max_clause_length: 4000,
            max_query_length: 100_000,
        }
    }
}

/// Builds filter clauses bounded by [`ClauseLimits`]
#[derive(Debug, Clone)]
pub struct ClauseBuilder {
    limits: ClauseLimits,
    query_base_length: usize,
}

impl ClauseBuilder {
    pub fn new(limits: ClauseLimits) -> Self {
        Self {
            limits,
            query_base_length: 0,
        }
    }

    /// Account for the `SELECT … FROM …` text the clauses will be appended to.
    pub fn with_query_base_length(mut self, length: usize) -> Self {
        self.query_base_length = length;
        self
    }

    /// Split `field IN (...)` over `values`, each clause combined with
    /// `base_filter` when it is non-empty.
    pub fn build_in_clause(&self, field: &str, values: &[ClauseValue], base_filter: &str) -> Vec<String> {
        let items: Vec<String> = values.iter().map(format_literal).collect();
        let (prefix, suffix) = if base_filter.trim().is_empty() {
            (format!("{field} IN ("), ")".to_string())
        } else {
            (format!("({base_filter}) AND ({field} IN ("), "))".to_string())
        };
        self.pack(&items, &prefix, ",", &suffix)
    }

    /// Combine sub-clauses with `operator`, splitting into as few clauses as
    /// the limits allow, each combined with `base_filter` when non-empty.
    pub fn build_or_and_clause(
        &self,
        operator: BoolOperator,
        clauses: &[String],
        base_filter: &str,
    ) -> Vec<String> {
        let items: Vec<String> = clauses.iter().map(|c| format!("({c})")).collect();
        let (prefix, suffix) = if base_filter.trim().is_empty() {
            (String::new(), String::new())
        } else {
            (format!("({base_filter}) AND ("), ")".to_string())
        };
        self.pack(&items, &prefix, operator.separator(), &suffix)
    }

    fn fits(&self, clause_length: usize) -> bool {
        clause_length <= self.limits.max_clause_length
            && self.query_base_length + WHERE_KEYWORD.len() + clause_length
                <= self.limits.max_query_length
    }

    fn pack(&self, items: &[String], prefix: &str, separator: &str, suffix: &str) -> Vec<String> {
        let fixed = prefix.len() + suffix.len();
        let mut clauses = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut body_length = 0usize;

        for item in items {
            let mut added = if current.is_empty() {
                item.len()
            } else {
                separator.len() + item.len()
            };

            if !current.is_empty() && !self.fits(fixed + body_length + added) {
                clauses.push(format!("{prefix}{}{suffix}", current.join(separator)));
                current.clear();
                body_length = 0;
                added = item.len();
            }

            current.push(item);
            body_length += added;
        }

        if !current.is_empty() {
            clauses.push(format!("{prefix}{}{suffix}", current.join(separator)));
        }

        clauses
    }
}
