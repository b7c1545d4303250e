//! Endpoint client boundary
//!
//! The pipeline reaches schema describe, record queries, synchronous writes and
//! bulk ingest jobs only through [`EndpointClient`]. Two implementations live
//! here: [`memory::MemoryEndpoint`] and [`csv_file::CsvFileEndpoint`].

pub mod csv_file;
pub mod filter;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TransportError};
use crate::transfer::streaming::RecordSource;

pub use csv_file::CsvFileEndpoint;
pub use memory::MemoryEndpoint;

/// A flat record: field name (or dotted relationship path) → value
pub type Record = serde_json::Map<String, Value>;

/// Record identifier field
pub const ID_FIELD: &str = "Id";

/// Kind of endpoint behind a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Database,
    File,
}

/// Query transport variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTransport {
    /// Row-limited synchronous queries
    Rest,
    /// Long-running bulk query jobs
    Bulk,
}

/// Write operations understood by endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
    HardDelete,
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteOperation::Insert => "insert",
            WriteOperation::Update => "update",
            WriteOperation::Delete => "delete",
            WriteOperation::HardDelete => "hardDelete",
        };
        f.write_str(name)
    }
}

/// Schema of one field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldDescribe {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub nillable: bool,
    pub createable: bool,
    pub updateable: bool,
    pub unique: bool,
    pub name_field: bool,
    pub auto_number: bool,
    pub custom: bool,
    pub reference_to: Vec<String>,
    pub cascade_delete: bool,
}

impl FieldDescribe {
    /// A writable text field
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: "string".to_string(),
            nillable: true,
            createable: true,
            updateable: true,
            custom: name.ends_with("__c"),
            ..Default::default()
        }
    }

    /// The read-only record identifier
    pub fn id() -> Self {
        Self {
            name: ID_FIELD.to_string(),
            field_type: "id".to_string(),
            unique: true,
            ..Default::default()
        }
    }

    /// A writable lookup to `entity`
    pub fn lookup(name: &str, entity: &str) -> Self {
        Self {
            field_type: "reference".to_string(),
            reference_to: vec![entity.to_string()],
            ..Self::text(name)
        }
    }

    /// A master-detail reference to `entity` (cascade-deleting, not nillable)
    pub fn master_detail(name: &str, entity: &str) -> Self {
        Self {
            nillable: false,
            cascade_delete: true,
            ..Self::lookup(name, entity)
        }
    }

    pub fn is_lookup(&self) -> bool {
        !self.reference_to.is_empty()
    }

    /// Master-detail references cascade-delete and cannot be empty
    pub fn is_master_detail(&self) -> bool {
        self.is_lookup() && self.cascade_delete && !self.nillable
    }

    /// Whether the field can be set by inserts, updates or both
    pub fn is_writable(&self, insert: bool, update: bool) -> bool {
        (!insert || self.createable) && (!update || self.updateable)
    }
}

/// Schema of one entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityDescribe {
    pub name: String,
    pub fields: Vec<FieldDescribe>,
}

impl EntityDescribe {
    pub fn new(name: &str, fields: Vec<FieldDescribe>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescribe> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Default external ID: a name field, else an auto-number, else a unique
    /// field, else the record identifier.
    pub fn default_external_id(&self) -> String {
        let pick = |pred: fn(&FieldDescribe) -> bool| {
            self.fields
                .iter()
                .find(|f| f.name != ID_FIELD && pred(f))
                .map(|f| f.name.clone())
        };
        pick(|f| f.name_field)
            .or_else(|| pick(|f| f.auto_number))
            .or_else(|| pick(|f| f.unique))
            .unwrap_or_else(|| ID_FIELD.to_string())
    }
}

/// Bulk ingest job states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Open,
    UploadComplete,
    InProgress,
    JobComplete,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::JobComplete | JobState::Failed | JobState::Aborted)
    }
}

/// Bulk ingest job status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub entity: String,
    pub operation: WriteOperation,
    pub state: JobState,
    pub records_processed: u64,
    pub records_failed: u64,
    pub error_message: Option<String>,
}

/// Per-record write outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    /// Position of the record in the submitted batch
    pub index: usize,
    pub id: Option<String>,
    pub created: bool,
    pub error: Option<String>,
}

impl RecordResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Status column of the status file
    pub fn status(&self) -> &'static str {
        if self.is_success() { "Success" } else { "Error" }
    }
}

/// Client interface for one endpoint
#[async_trait]
pub trait EndpointClient: Send + Sync {
    /// Human-readable label used in logs and error context
    fn label(&self) -> &str;

    fn kind(&self) -> EndpointKind;

    async fn describe(&self, entity: &str) -> Result<EntityDescribe>;

    /// Adopt a schema described elsewhere. Flat-file endpoints use it to
    /// type entities they hold no schema file for.
    async fn register_schema(&self, _describe: &EntityDescribe) -> Result<()> {
        Ok(())
    }

    /// Start a query and stream its records.
    async fn query_stream(&self, query: &str, transport: QueryTransport) -> Result<Box<dyn RecordSource>>;

    /// Run a `COUNT(...)` query.
    async fn count(&self, query: &str) -> Result<u64> {
        let mut source = self.query_stream(query, QueryTransport::Rest).await?;
        let batch = source.next_batch().await?.unwrap_or_default();
        source.close().await?;

        batch
            .first()
            .and_then(|record| record.values().next())
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .ok_or_else(|| TransportError::QueryFailed(format!("no count returned for `{query}`")).into())
    }

    /// Row-limited synchronous write; results are in input order.
    async fn update(&self, entity: &str, operation: WriteOperation, records: Vec<Record>) -> Result<Vec<RecordResult>>;

    async fn ingest_open(&self, entity: &str, operation: WriteOperation) -> Result<JobInfo>;

    /// Upload the job payload as CSV text with a header row.
    async fn ingest_upload(&self, job_id: &str, csv: String) -> Result<()>;

    async fn ingest_close(&self, job_id: &str) -> Result<JobInfo>;

    async fn ingest_check(&self, job_id: &str) -> Result<JobInfo>;

    async fn ingest_successful_results(&self, job_id: &str) -> Result<Vec<RecordResult>>;

    async fn ingest_failed_results(&self, job_id: &str) -> Result<Vec<RecordResult>>;

    /// Persist pending changes at the end of a run.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_external_id() {
        let mut describe = EntityDescribe::new("Account", vec![FieldDescribe::id(), FieldDescribe::text("Code__c")]);
        assert_eq!(describe.default_external_id(), "Id");

        describe.fields[1].unique = true;
        assert_eq!(describe.default_external_id(), "Code__c");

        let mut name = FieldDescribe::text("Name");
        name.name_field = true;
        describe.fields.push(name);
        assert_eq!(describe.default_external_id(), "Name");
    }

    #[test]
    fn test_field_kinds() {
        assert!(FieldDescribe::master_detail("Parent__c", "Parent").is_master_detail());
        assert!(!FieldDescribe::lookup("AccountId", "Account").is_master_detail());
        assert!(!FieldDescribe::id().is_writable(true, false));

        let mut created_only = FieldDescribe::text("Region__c");
        created_only.updateable = false;
        assert!(created_only.is_writable(true, false));
        assert!(!created_only.is_writable(false, true));
        assert!(!created_only.is_writable(true, true));
        assert!(FieldDescribe::text("Code__c").custom);
    }

    #[test]
    fn test_describe_deserializes_type_field() {
        let describe: EntityDescribe = serde_json::from_str(
            r#"{"name":"Contact","fields":[{"name":"AccountId","type":"reference","referenceTo":["Account"],"createable":true}]}"#,
        )
        .unwrap();
        let field = describe.field("accountid").unwrap();
        assert_eq!(field.field_type, "reference");
        assert!(field.is_lookup());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::UploadComplete.is_terminal());
    }
}
