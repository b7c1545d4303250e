//! Query and clause building
//!
//! This module provides:
//! - Lenient parsing of `SELECT … FROM … [WHERE …] [ORDER BY …] [LIMIT n] [OFFSET n]`
//! - Recomposition with optional source→target renaming
//! - Direct/relationship field spelling conversions and field mapping
//! - Length-bounded splitting of `IN (...)` and `OR`/`AND` filter clauses
//!
//! Parsing never fails: malformed input yields empty components and
//! validation happens downstream against the endpoint schema.

pub mod clause;
pub mod fields;
pub mod lexer;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use clause::{
    BoolOperator, ClauseBuilder, ClauseLimits, ClauseValue, equality_clause, format_literal,
};
pub use fields::{
    FieldMapper, is_relationship_field, lookup_field_of_path, to_direct_field,
    to_relationship_field,
};

/// Marker separating a polymorphic lookup field from its chosen target entity.
pub const POLYMORPHIC_MARKER: char = '%';

static QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*SELECT\s+(?P<fields>.+?)\s+FROM\s+(?P<entity>[A-Za-z_][A-Za-z0-9_]*)(?:\s+WHERE\s+(?P<filter>.+?))?(?:\s+ORDER\s+BY\s+(?P<order>.+?))?(?:\s+LIMIT\s+(?P<limit>\d+))?(?:\s+OFFSET\s+(?P<offset>\d+))?\s*$",
    )
    .expect("valid query regex")
});

/// Components of a parsed query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedQuery {
    /// Selected fields, polymorphic markers removed
    pub fields: Vec<String>,

    /// Entity the query selects from
    pub entity_name: String,

    /// WHERE clause without the keyword
    pub filter: String,

    /// ORDER BY clause without the keywords
    pub order_by: String,

    pub limit: Option<u64>,

    pub offset: Option<u64>,

    /// Lookup field → entity chosen with the `field%Entity` marker
    pub polymorphic_fields: BTreeMap<String, String>,
}

impl ParsedQuery {
    /// Parse a query string.
    ///
    /// # Arguments
    /// * `query` - Query text, keywords matched case-insensitively
    ///
    /// # Returns
    /// * `ParsedQuery` - Parsed components (empty on malformed input)
    pub fn parse(query: &str) -> Self {
        let Some(caps) = QUERY_RE.captures(query) else {
            return Self::default();
        };

        let mut parsed = ParsedQuery {
            entity_name: caps["entity"].to_string(),
            filter: caps
                .name("filter")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
            order_by: caps
                .name("order")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
            limit: caps.name("limit").and_then(|m| m.as_str().parse().ok()),
            offset: caps.name("offset").and_then(|m| m.as_str().parse().ok()),
            ..Default::default()
        };

        for raw in split_top_level(&caps["fields"]) {
            match raw.split_once(POLYMORPHIC_MARKER) {
                Some((field, entity)) if !field.is_empty() && !entity.is_empty() => {
                    parsed
                        .polymorphic_fields
                        .insert(field.to_string(), entity.to_string());
                    parsed.fields.push(field.to_string());
                }
                _ => parsed.fields.push(raw),
            }
        }

        parsed
    }

    /// Whether parsing found an entity to select from.
    pub fn is_empty(&self) -> bool {
        self.entity_name.is_empty()
    }

    /// Recompose the query with its own names.
    pub fn compose(&self) -> String {
        self.compose_with(None, None, false)
    }

    /// Recompose the query.
    ///
    /// # Arguments
    /// * `mapper` - When set, the entity, every field and the filter are
    ///   renamed to their target spelling
    /// * `fields_override` - Replaces the field list (e.g. `COUNT(Id)`)
    /// * `drop_limits` - Removes LIMIT/OFFSET
    pub fn compose_with(
        &self,
        mapper: Option<&FieldMapper>,
        fields_override: Option<&[String]>,
        drop_limits: bool,
    ) -> String {
        let fields: Vec<String> = match (fields_override, mapper) {
            (Some(fields), _) => fields.to_vec(),
            (None, Some(mapper)) => self.fields.iter().map(|f| mapper.map_field(f)).collect(),
            (None, None) => self.fields.clone(),
        };
        let entity = mapper
            .map(|m| m.target_entity().to_string())
            .unwrap_or_else(|| self.entity_name.clone());

        let mut query = format!("SELECT {} FROM {}", fields.join(", "), entity);

        if !self.filter.is_empty() {
            let filter = match mapper {
                Some(mapper) => mapper.map_where_clause(&self.filter),
                None => self.filter.clone(),
            };
            query.push_str(" WHERE ");
            query.push_str(&filter);
        }

        if !self.order_by.is_empty() {
            let order_by = match mapper {
                Some(mapper) => mapper.map_where_clause(&self.order_by),
                None => self.order_by.clone(),
            };
            query.push_str(" ORDER BY ");
            query.push_str(&order_by);
        }

        if !drop_limits {
            if let Some(limit) = self.limit {
                query.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = self.offset {
                query.push_str(&format!(" OFFSET {offset}"));
            }
        }

        query
    }

    /// A copy selecting the given fields with a replaced filter and no limits,
    /// used when re-querying by identifier sets.
    pub fn with_filter(&self, filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            limit: None,
            offset: None,
            ..self.clone()
        }
    }

    /// Length of `SELECT … FROM …` alone; the budget left for a WHERE clause
    /// is measured against it.
    pub fn select_from_length(&self, mapper: Option<&FieldMapper>) -> usize {
        Self {
            filter: String::new(),
            order_by: String::new(),
            ..self.clone()
        }
        .compose_with(mapper, None, true)
        .len()
    }

    /// The `COUNT(Id)` form of this query.
    pub fn count_query(&self, mapper: Option<&FieldMapper>) -> String {
        let fields = ["COUNT(Id)".to_string()];
        Self {
            order_by: String::new(),
            ..self.clone()
        }
        .compose_with(mapper, Some(&fields), true)
    }
}

/// Split a field list on commas outside parentheses, trimming entries.
fn split_top_level(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    for ch in list.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_string());
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_query() {
        let parsed = ParsedQuery::parse("SELECT Id, Name FROM Account WHERE Name = 'A' LIMIT 10 OFFSET 5");
        assert_eq!(parsed.fields, vec!["Id", "Name"]);
        assert_eq!(parsed.entity_name, "Account");
        assert_eq!(parsed.filter, "Name = 'A'");
        assert_eq!(parsed.limit, Some(10));
        assert_eq!(parsed.offset, Some(5));
    }

    #[test]
    fn test_parse_case_insensitive_with_order_by() {
        let parsed = ParsedQuery::parse("select id, name from Contact where LastName != null order by Name desc limit 3");
        assert_eq!(parsed.entity_name, "Contact");
        assert_eq!(parsed.filter, "LastName != null");
        assert_eq!(parsed.order_by, "Name desc");
        assert_eq!(parsed.limit, Some(3));
        assert_eq!(parsed.offset, None);
    }

    #[test]
    fn test_parse_polymorphic_marker() {
        let parsed = ParsedQuery::parse("SELECT Id, WhatId%Account, Subject FROM Task");
        assert_eq!(parsed.fields, vec!["Id", "WhatId", "Subject"]);
        assert_eq!(parsed.polymorphic_fields.get("WhatId").map(String::as_str), Some("Account"));
    }

    #[test]
    fn test_parse_malformed_is_lenient() {
        let parsed = ParsedQuery::parse("SELEC Id FORM Account");
        assert!(parsed.is_empty());
        assert!(parsed.fields.is_empty());
        assert!(ParsedQuery::parse("").is_empty());
    }

    #[test]
    fn test_parse_keeps_functions_whole() {
        let parsed = ParsedQuery::parse("SELECT COUNT(Id), Name FROM Account");
        assert_eq!(parsed.fields, vec!["COUNT(Id)", "Name"]);
    }

    #[test]
    fn test_compose_parse_idempotent() {
        for query in [
            "SELECT Id, Name FROM Account WHERE Name = 'A' LIMIT 10 OFFSET 5",
            "SELECT Id FROM Contact",
            "SELECT Id, Account.Name FROM Contact WHERE (A = 1 OR B = 2) AND C IN ('x','y') ORDER BY Name LIMIT 1",
        ] {
            let parsed = ParsedQuery::parse(query);
            let reparsed = ParsedQuery::parse(&parsed.compose());
            assert_eq!(parsed, reparsed, "{query}");
        }
    }

    #[test]
    fn test_compose_with_target_names_and_drop_limits() {
        let parsed = ParsedQuery::parse("SELECT Id, Name FROM Account WHERE Name = 'A' LIMIT 10");
        let mapper = FieldMapper::new(
            "Account",
            "Customer__c",
            [("Name".to_string(), "Title__c".to_string())],
        );
        assert_eq!(
            parsed.compose_with(Some(&mapper), None, true),
            "SELECT Id, Title__c FROM Customer__c WHERE Title__c = 'A'"
        );
    }

    #[test]
    fn test_count_query() {
        let parsed = ParsedQuery::parse("SELECT Id, Name FROM Account WHERE Name = 'A' ORDER BY Name LIMIT 10");
        assert_eq!(parsed.count_query(None), "SELECT COUNT(Id) FROM Account WHERE Name = 'A'");
    }

    #[test]
    fn test_select_from_length() {
        let parsed = ParsedQuery::parse("SELECT Id FROM Account WHERE Name = 'A'");
        assert_eq!(parsed.select_from_length(None), "SELECT Id FROM Account".len());
    }
}
