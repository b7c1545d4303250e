//! Field spelling conversions and source→target field mapping
//!
//! A lookup field has two spellings: the "direct" one holding the referenced
//! record's identifier (`AccountId`, `Parent__c`, `Person__pc`) and the
//! "relationship" one used to traverse into the parent (`Account`,
//! `Parent__r`, `Person__pr`). Conversions only touch the first dotted
//! segment of a path.

use std::collections::HashMap;

use super::lexer::rewrite_identifiers;

const CUSTOM_SUFFIX: &str = "__c";
const CUSTOM_REL_SUFFIX: &str = "__r";
const PERSON_SUFFIX: &str = "__pc";
const PERSON_REL_SUFFIX: &str = "__pr";
const ID_SUFFIX: &str = "Id";

fn split_first_segment(field: &str) -> (&str, Option<&str>) {
    match field.split_once('.') {
        Some((first, rest)) => (first, Some(rest)),
        None => (field, None),
    }
}

fn join_segments(first: String, rest: Option<&str>) -> String {
    match rest {
        Some(rest) => format!("{first}.{rest}"),
        None => first,
    }
}

/// Whether the field is written in relationship form (dotted path or `__r`/`__pr`).
pub fn is_relationship_field(field: &str) -> bool {
    field.contains('.') || field.ends_with(CUSTOM_REL_SUFFIX) || field.ends_with(PERSON_REL_SUFFIX)
}

/// Convert a direct field spelling to its relationship spelling.
///
/// `AccountId` → `Account`, `Parent__c` → `Parent__r`, `Person__pc` → `Person__pr`.
/// Fields without a lookup suffix are returned unchanged.
pub fn to_relationship_field(field: &str) -> String {
    let (first, rest) = split_first_segment(field);

    let converted = if let Some(base) = first.strip_suffix(PERSON_SUFFIX) {
        format!("{base}{PERSON_REL_SUFFIX}")
    } else if let Some(base) = first.strip_suffix(CUSTOM_SUFFIX) {
        format!("{base}{CUSTOM_REL_SUFFIX}")
    } else if let Some(base) = first.strip_suffix(ID_SUFFIX).filter(|b| !b.is_empty()) {
        base.to_string()
    } else {
        first.to_string()
    };

    join_segments(converted, rest)
}

/// Convert a relationship field spelling to its direct spelling.
///
/// `Account` → `AccountId`, `Parent__r` → `Parent__c`, `Person__pr` → `Person__pc`.
pub fn to_direct_field(field: &str) -> String {
    let (first, rest) = split_first_segment(field);

    let converted = if let Some(base) = first.strip_suffix(PERSON_REL_SUFFIX) {
        format!("{base}{PERSON_SUFFIX}")
    } else if let Some(base) = first.strip_suffix(CUSTOM_REL_SUFFIX) {
        format!("{base}{CUSTOM_SUFFIX}")
    } else {
        format!("{first}{ID_SUFFIX}")
    };

    join_segments(converted, rest)
}

/// The direct lookup field a relationship path starts from
/// (`Account.Owner.Name` → `AccountId`).
pub fn lookup_field_of_path(path: &str) -> Option<String> {
    let (first, rest) = split_first_segment(path);
    rest.map(|_| to_direct_field(first))
}

/// Applies an object's field-mapping table to field names, filters and
/// external IDs.
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    source_entity: String,
    target_entity: String,
    fields: HashMap<String, String>,
}

impl FieldMapper {
    /// A mapper that leaves every name unchanged.
    pub fn identity(entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Self {
            target_entity: entity.clone(),
            source_entity: entity,
            fields: HashMap::new(),
        }
    }

    /// Create a mapper from explicit source→target field pairs.
    pub fn new<I>(source_entity: impl Into<String>, target_entity: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            fields: pairs.into_iter().collect(),
        }
    }

    pub fn source_entity(&self) -> &str {
        &self.source_entity
    }

    pub fn target_entity(&self) -> &str {
        &self.target_entity
    }

    /// Whether the mapper renames anything at all.
    pub fn is_identity(&self) -> bool {
        self.fields.is_empty() && self.source_entity == self.target_entity
    }

    /// Register an additional mapping (relationship counterparts computed at finalize).
    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.fields.insert(source.into(), target.into());
    }

    /// Map a single field. Relationship paths are mapped through the direct
    /// spelling of their first segment; the remaining segments are kept.
    pub fn map_field(&self, field: &str) -> String {
        if let Some(mapped) = self.fields.get(field) {
            return mapped.clone();
        }

        let (first, rest) = split_first_segment(field);
        if let Some(rest) = rest {
            let direct = to_direct_field(first);
            if let Some(mapped) = self.fields.get(&direct) {
                return format!("{}.{rest}", to_relationship_field(mapped));
            }
        }

        field.to_string()
    }

    /// Map every field token of a filter clause, skipping keywords,
    /// operators and quoted literals.
    pub fn map_where_clause(&self, filter: &str) -> String {
        if self.fields.is_empty() || filter.trim().is_empty() {
            return filter.to_string();
        }
        rewrite_identifiers(filter, |field| self.map_field(field))
    }

    /// Map each part of a (possibly composite) external ID.
    pub fn map_external_id(&self, external_id: &str, delimiter: &str) -> String {
        external_id
            .split(delimiter)
            .map(|part| self.map_field(part.trim()))
            .collect::<Vec<_>>()
            .join(delimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_round_trip() {
        for field in ["AccountId", "Parent__c", "Person__pc", "OwnerId", "Parent__c.Name"] {
            assert_eq!(to_direct_field(&to_relationship_field(field)), field, "{field}");
        }
        for field in ["Account", "Parent__r", "Person__pr", "Account.Name"] {
            assert_eq!(to_relationship_field(&to_direct_field(field)), field, "{field}");
        }
    }

    #[test]
    fn test_conversions_only_touch_first_segment() {
        assert_eq!(to_relationship_field("Parent__c"), "Parent__r");
        assert_eq!(to_relationship_field("Person__pc"), "Person__pr");
        assert_eq!(to_direct_field("Parent__r.Owner__r.Name"), "Parent__c.Owner__r.Name");
        assert_eq!(to_relationship_field("Name"), "Name");
        assert_eq!(to_relationship_field("Id"), "Id");
    }

    #[test]
    fn test_lookup_field_of_path() {
        assert_eq!(lookup_field_of_path("Account.Name").as_deref(), Some("AccountId"));
        assert_eq!(lookup_field_of_path("Parent__r.Code__c").as_deref(), Some("Parent__c"));
        assert_eq!(lookup_field_of_path("Name"), None);
    }

    #[test]
    fn test_map_field_and_relationship_path() {
        let mapper = FieldMapper::new(
            "Account",
            "Customer__c",
            [
                ("Name".to_string(), "Title__c".to_string()),
                ("ParentId".to_string(), "Parent__c".to_string()),
            ],
        );

        assert_eq!(mapper.map_field("Name"), "Title__c");
        assert_eq!(mapper.map_field("Parent.Name"), "Parent__r.Name");
        assert_eq!(mapper.map_field("Industry"), "Industry");
        assert_eq!(mapper.target_entity(), "Customer__c");
    }

    #[test]
    fn test_map_where_clause() {
        let mapper = FieldMapper::new(
            "Account",
            "Account",
            [("Name".to_string(), "Title__c".to_string())],
        );
        assert_eq!(
            mapper.map_where_clause("Name = 'Name' AND Name LIKE 'A%' OR Type = NULL"),
            "Title__c = 'Name' AND Title__c LIKE 'A%' OR Type = NULL"
        );
    }

    #[test]
    fn test_map_composite_external_id() {
        let mapper = FieldMapper::new(
            "Account",
            "Account",
            [("Code".to_string(), "Code__c".to_string())],
        );
        assert_eq!(mapper.map_external_id("Name;Code", ";"), "Name;Code__c");
    }
}
