//! Script objects and their derived working state

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::endpoint::EntityDescribe;
use crate::error::{ConfigError, Result};
use crate::query::{FieldMapper, ParsedQuery};

/// Operation applied to an object's records in the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Upsert,
    #[default]
    Readonly,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "Insert",
            Operation::Update => "Update",
            Operation::Upsert => "Upsert",
            Operation::Readonly => "Readonly",
            Operation::Delete => "Delete",
        }
    }

    /// Whether records of this object are written to the target
    pub fn is_write(&self) -> bool {
        matches!(self, Operation::Insert | Operation::Update | Operation::Upsert)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "upsert" => Ok(Operation::Upsert),
            "readonly" => Ok(Operation::Readonly),
            "delete" => Ok(Operation::Delete),
            _ => Err(ConfigError::InvalidValue {
                field: "operation".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// One row of an object's field-mapping table.
///
/// A row with only `target_object` renames the entity itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldMappingEntry {
    pub source_field: Option<String>,
    pub target_field: Option<String>,
    pub target_object: Option<String>,
}

/// Object definition as written in the script file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectDefinition {
    pub query: String,
    pub operation: Option<String>,
    pub external_id: Option<String>,
    pub delete_query: Option<String>,
    pub delete_old_data: bool,
    pub hard_delete: bool,
    pub use_field_mapping: bool,
    pub field_mapping: Vec<FieldMappingEntry>,
    pub excluded_fields: Vec<String>,
    pub excluded_from_update_fields: Vec<String>,
    pub skip_existing_records: bool,
    pub master: Option<bool>,
    pub excluded: bool,
}

/// Per-object transfer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStats {
    pub source_queried: u64,
    pub target_queried: u64,
    pub deleted: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
}

/// A lookup that could not be resolved while writing because the referenced
/// record did not exist in the target yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLookup {
    /// Target id of the written child record
    pub target_id: String,
    /// Lookup field in target spelling
    pub target_field: String,
    /// Lookup field in source spelling
    pub source_field: String,
    /// Source id of the referenced parent record
    pub source_parent_id: String,
}

/// Derived, mutable working state of a [`ScriptObject`].
///
/// Computed during prepare and finalize; the caches grow while records are
/// streamed.
#[derive(Debug, Clone, Default)]
pub struct ExtraData {
    /// Parsed main query in source names
    pub query: ParsedQuery,
    pub delete_query: Option<ParsedQuery>,

    pub target_entity: String,
    pub target_filter: String,
    pub target_fields: Vec<String>,

    pub external_id: String,
    pub target_external_id: String,
    /// Whether the external ID was defaulted rather than set in the script
    pub external_id_auto_assigned: bool,

    /// Source → target renaming
    pub mapper: FieldMapper,

    /// Lookup field → referenced entity
    pub lookup_entities: BTreeMap<String, String>,
    /// Lookup field → name of the referenced object in the same set
    pub lookup_objects: BTreeMap<String, String>,
    /// Master-detail subset of `lookup_entities`
    pub master_detail_lookups: BTreeMap<String, String>,
    /// Lookup field → relationship-path fields carrying the parent external ID
    pub relationship_fields: BTreeMap<String, Vec<String>>,

    /// Kept for selection, never written
    pub excluded_from_update: BTreeSet<String>,

    pub source_describe: Option<EntityDescribe>,
    pub target_describe: Option<EntityDescribe>,

    pub source_id_to_external_id: HashMap<String, String>,
    pub target_external_id_to_id: HashMap<String, String>,

    /// Lookup field → parent ids seen on queried source records
    pub referenced_source_ids: BTreeMap<String, BTreeSet<String>>,
    /// Filter key (`Id` or a lookup field) → values already used in child queries
    pub queried_values: HashMap<String, HashSet<String>>,
    /// Whether the whole source entity was already fetched
    pub source_fully_queried: bool,

    pub source_total: u64,
    pub target_total: u64,
    pub target_to_delete: u64,

    pub pending_lookups: Vec<PendingLookup>,
    pub stats: ObjectStats,
}

/// One entity definition of an object set.
#[derive(Debug, Clone, Default)]
pub struct ScriptObject {
    pub query: String,
    pub operation: Operation,
    /// External ID as written in the script; empty when not set
    pub external_id: String,
    pub delete_query: String,
    pub excluded: bool,
    pub master: bool,
    pub delete_old_data: bool,
    pub hard_delete: bool,
    pub use_field_mapping: bool,
    pub skip_existing_records: bool,
    pub excluded_fields: Vec<String>,
    pub excluded_from_update_fields: Vec<String>,
    pub field_mapping: Vec<FieldMappingEntry>,

    /// Index of the owning object set (1-based)
    pub set_index: usize,
    /// Created while resolving references rather than declared in the script
    pub synthesized: bool,
    pub completed: bool,

    pub extra: ExtraData,
}

impl ScriptObject {
    /// Build an object from its script definition.
    pub fn from_definition(definition: ObjectDefinition, set_index: usize) -> Result<Self> {
        let parsed = ParsedQuery::parse(&definition.query);
        if parsed.is_empty() {
            return Err(ConfigError::InvalidFormat(format!(
                "object set {set_index}: cannot parse query `{}`",
                definition.query
            ))
            .into());
        }

        let operation = match definition.operation.as_deref() {
            Some(op) => op.parse::<Operation>()?,
            None => Operation::default(),
        };

        Ok(Self {
            query: definition.query,
            operation,
            external_id: definition.external_id.unwrap_or_default().trim().to_string(),
            delete_query: definition.delete_query.unwrap_or_default().trim().to_string(),
            excluded: definition.excluded,
            master: definition.master.unwrap_or(true),
            delete_old_data: definition.delete_old_data,
            hard_delete: definition.hard_delete,
            use_field_mapping: definition.use_field_mapping,
            skip_existing_records: definition.skip_existing_records,
            excluded_fields: definition.excluded_fields,
            excluded_from_update_fields: definition.excluded_from_update_fields,
            field_mapping: definition.field_mapping,
            set_index,
            synthesized: false,
            completed: false,
            extra: ExtraData {
                query: parsed,
                ..Default::default()
            },
        })
    }

    /// A read-only object fetching only `Id`, for a referenced entity the
    /// script does not declare.
    pub fn readonly_id_only(entity: &str, set_index: usize) -> Self {
        let query = format!("SELECT Id FROM {entity}");
        Self {
            extra: ExtraData {
                query: ParsedQuery::parse(&query),
                ..Default::default()
            },
            query,
            operation: Operation::Readonly,
            master: false,
            set_index,
            synthesized: true,
            ..Default::default()
        }
    }

    /// Source entity name
    pub fn name(&self) -> &str {
        &self.extra.query.entity_name
    }

    /// Target entity name, falling back to the source name before finalize
    pub fn target_name(&self) -> &str {
        if self.extra.target_entity.is_empty() {
            self.name()
        } else {
            &self.extra.target_entity
        }
    }

    /// Whether the old target records are removed before writing
    pub fn deletes_target_records(&self) -> bool {
        self.operation == Operation::Delete || self.delete_old_data
    }

    /// Whether the object takes part in the query and write stages
    pub fn is_active(&self) -> bool {
        !self.excluded && !self.completed
    }

    /// Lookup fields whose referenced object is present in the set
    pub fn resolved_lookups(&self) -> impl Iterator<Item = (&String, &String)> {
        self.extra.lookup_objects.iter()
    }

    /// The source-side entity renaming declared in the field mapping, if any
    pub fn mapped_target_entity(&self) -> Option<&str> {
        if !self.use_field_mapping {
            return None;
        }
        self.field_mapping
            .iter()
            .find(|entry| entry.source_field.is_none() && entry.target_object.is_some())
            .and_then(|entry| entry.target_object.as_deref())
    }

    /// Source → target field pairs declared in the field mapping
    pub fn mapped_fields(&self) -> Vec<(String, String)> {
        if !self.use_field_mapping {
            return Vec::new();
        }
        self.field_mapping
            .iter()
            .filter_map(|entry| match (&entry.source_field, &entry.target_field) {
                (Some(source), Some(target)) => Some((source.clone(), target.clone())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(query: &str) -> ObjectDefinition {
        ObjectDefinition {
            query: query.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_operation_parse_case_insensitive() {
        assert_eq!("upsert".parse::<Operation>().unwrap(), Operation::Upsert);
        assert_eq!("ReadOnly".parse::<Operation>().unwrap(), Operation::Readonly);
        assert!("merge".parse::<Operation>().is_err());
        assert!(Operation::Insert.is_write());
        assert!(!Operation::Delete.is_write());
    }

    #[test]
    fn test_from_definition_defaults() {
        let object = ScriptObject::from_definition(definition("SELECT Id, Name FROM Account"), 1).unwrap();
        assert_eq!(object.name(), "Account");
        assert_eq!(object.operation, Operation::Readonly);
        assert!(object.master);
        assert!(object.external_id.is_empty());
        assert_eq!(object.target_name(), "Account");
    }

    #[test]
    fn test_from_definition_rejects_unparseable_query() {
        assert!(ScriptObject::from_definition(definition("Account"), 1).is_err());
    }

    #[test]
    fn test_readonly_id_only() {
        let object = ScriptObject::readonly_id_only("User", 2);
        assert_eq!(object.query, "SELECT Id FROM User");
        assert_eq!(object.extra.query.fields, vec!["Id"]);
        assert!(!object.master);
        assert!(object.synthesized);
        assert_eq!(object.set_index, 2);
    }

    #[test]
    fn test_field_mapping_accessors() {
        let mut def = definition("SELECT Id, Name FROM Account");
        def.use_field_mapping = true;
        def.field_mapping = vec![
            FieldMappingEntry {
                target_object: Some("Customer__c".to_string()),
                ..Default::default()
            },
            FieldMappingEntry {
                source_field: Some("Name".to_string()),
                target_field: Some("Title__c".to_string()),
                ..Default::default()
            },
        ];
        let object = ScriptObject::from_definition(def, 1).unwrap();
        assert_eq!(object.mapped_target_entity(), Some("Customer__c"));
        assert_eq!(object.mapped_fields(), vec![("Name".to_string(), "Title__c".to_string())]);
    }
}
