//! In-memory endpoint
//!
//! Holds tables of flat records with their schema and answers the queries
//! the pipeline emits. Used as the database stand-in for tests and as the
//! storage behind [`super::CsvFileEndpoint`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SchemaError, TransportError};
use crate::query::{ParsedQuery, to_direct_field};
use crate::transfer::csv::{parse_records, value_to_text};
use crate::transfer::streaming::{RecordSource, VecRecordSource};

use super::filter::parse_filter;
use super::{
    EndpointClient, EndpointKind, EntityDescribe, ID_FIELD, JobInfo, JobState, QueryTransport,
    Record, RecordResult, WriteOperation,
};

const REST_PAGE_SIZE: usize = 2000;
const BULK_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Default)]
struct Table {
    describe: EntityDescribe,
    records: Vec<Record>,
}

#[derive(Debug, Clone)]
struct Job {
    info: JobInfo,
    payload: String,
    results: Vec<RecordResult>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Table>,
    jobs: HashMap<String, Job>,
    failing_entities: HashSet<String>,
    executed_queries: Vec<String>,
    describe_calls: usize,
}

/// Endpoint keeping every table in memory
pub struct MemoryEndpoint {
    label: String,
    kind: EndpointKind,
    state: RwLock<MemoryState>,
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn get_ci<'a>(record: &'a Record, field: &str) -> Option<&'a Value> {
    record.get(field).or_else(|| {
        record
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(field))
            .map(|(_, value)| value)
    })
}

fn non_empty(value: Option<&Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(v) => Some(v.clone()),
    }
}

fn compare_values(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let (a, b) = (value_to_text(a), value_to_text(b));
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.to_lowercase().cmp(&b.to_lowercase()),
            }
        }
    }
}

impl MemoryState {
    fn table(&self, entity: &str) -> Option<&Table> {
        self.tables.get(entity).or_else(|| {
            self.tables
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(entity))
                .map(|(_, table)| table)
        })
    }

    fn table_mut(&mut self, entity: &str) -> Option<&mut Table> {
        let key = self
            .tables
            .keys()
            .find(|name| name.eq_ignore_ascii_case(entity))
            .cloned()?;
        self.tables.get_mut(&key)
    }

    /// Resolve a field or relationship path (`Account.Owner.Name`) on a record.
    fn resolve(&self, table: &Table, record: &Record, field: &str) -> Option<Value> {
        if let Some(value) = get_ci(record, field) {
            return non_empty(Some(value));
        }

        let (relationship, rest) = field.split_once('.')?;
        let lookup = to_direct_field(relationship);
        let parent_id = non_empty(get_ci(record, &lookup))?;
        let parent_id = value_to_text(&parent_id);

        let parent_entity = table.describe.field(&lookup)?.reference_to.first()?;
        let parent_table = self.table(parent_entity)?;
        let parent = parent_table.records.iter().find(|r| {
            get_ci(r, ID_FIELD).is_some_and(|id| value_to_text(id) == parent_id)
        })?;

        self.resolve(parent_table, parent, rest)
    }

    fn execute_query(&self, query: &str) -> Result<Vec<Record>> {
        let parsed = ParsedQuery::parse(query);
        if parsed.is_empty() {
            return Err(TransportError::QueryFailed(format!("cannot parse `{query}`")).into());
        }

        let table = self
            .table(&parsed.entity_name)
            .ok_or_else(|| TransportError::QueryFailed(format!("entity {} not found", parsed.entity_name)))?;

        let filter = if parsed.filter.is_empty() {
            None
        } else {
            Some(parse_filter(&parsed.filter)?)
        };

        let mut matched: Vec<&Record> = table
            .records
            .iter()
            .filter(|record| match &filter {
                Some(expr) => expr.matches(&|field: &str| {
                    self.resolve(table, record, field).map(|v| value_to_text(&v))
                }),
                None => true,
            })
            .collect();

        let is_count = parsed.fields.len() == 1 && parsed.fields[0].to_uppercase().starts_with("COUNT(");
        if is_count {
            let mut record = Record::new();
            record.insert("expr0".to_string(), Value::from(matched.len() as u64));
            return Ok(vec![record]);
        }

        if let Some(order) = parsed.order_by.split(',').next().filter(|o| !o.trim().is_empty()) {
            let mut parts = order.split_whitespace();
            let field = parts.next().unwrap_or_default().to_string();
            let descending = parts.any(|p| p.eq_ignore_ascii_case("DESC"));
            matched.sort_by(|a, b| {
                let ordering = compare_values(&self.resolve(table, a, &field), &self.resolve(table, b, &field));
                if descending { ordering.reverse() } else { ordering }
            });
        }

        let offset = parsed.offset.unwrap_or(0) as usize;
        let limit = parsed.limit.map(|l| l as usize).unwrap_or(usize::MAX);

        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|record| {
                parsed
                    .fields
                    .iter()
                    .map(|field| {
                        let value = self.resolve(table, record, field).unwrap_or(Value::Null);
                        (field.clone(), value)
                    })
                    .collect()
            })
            .collect())
    }

    fn apply_write(&mut self, entity: &str, operation: WriteOperation, records: Vec<Record>) -> Result<Vec<RecordResult>> {
        let failing = self.failing_entities.contains(entity);
        let table = self.table_mut(entity).ok_or_else(|| SchemaError::EntityNotFound {
            entity: entity.to_string(),
            endpoint: "memory".to_string(),
        })?;

        let mut results = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            if failing {
                results.push(RecordResult {
                    index,
                    id: None,
                    created: false,
                    error: Some("forced failure".to_string()),
                });
                continue;
            }
            results.push(Self::write_one(table, index, operation, record));
        }
        Ok(results)
    }

    fn write_one(table: &mut Table, index: usize, operation: WriteOperation, mut record: Record) -> RecordResult {
        let failure = |id: Option<String>, error: String| RecordResult {
            index,
            id,
            created: false,
            error: Some(error),
        };

        if let Some(unknown) = record
            .keys()
            .find(|key| key.as_str() != ID_FIELD && !table.describe.has_field(key))
        {
            return failure(None, format!("No such column '{unknown}' on {}", table.describe.name));
        }

        let id = non_empty(record.get(ID_FIELD)).map(|v| value_to_text(&v));
        let position = id.as_ref().and_then(|id| {
            table
                .records
                .iter()
                .position(|r| get_ci(r, ID_FIELD).is_some_and(|v| value_to_text(v) == *id))
        });

        match operation {
            WriteOperation::Insert => {
                let id = new_id();
                record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                table.records.push(record);
                RecordResult {
                    index,
                    id: Some(id),
                    created: true,
                    error: None,
                }
            }
            WriteOperation::Update => match position {
                Some(pos) => {
                    let existing = &mut table.records[pos];
                    for (key, value) in record {
                        existing.insert(key, value);
                    }
                    RecordResult {
                        index,
                        id,
                        created: false,
                        error: None,
                    }
                }
                None => failure(id, "entity is deleted or does not exist".to_string()),
            },
            WriteOperation::Delete | WriteOperation::HardDelete => match position {
                Some(pos) => {
                    table.records.remove(pos);
                    RecordResult {
                        index,
                        id,
                        created: false,
                        error: None,
                    }
                }
                None => failure(id, "entity is deleted or does not exist".to_string()),
            },
        }
    }
}

impl MemoryEndpoint {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: EndpointKind::Database,
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn with_kind(mut self, kind: EndpointKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add an entity with initial records; records without an `Id` get one.
    pub fn with_entity(mut self, describe: EntityDescribe, records: Vec<Record>) -> Self {
        let state = self.state.get_mut();
        let records = records
            .into_iter()
            .map(|mut record| {
                if non_empty(record.get(ID_FIELD)).is_none() {
                    record.insert(ID_FIELD.to_string(), Value::String(new_id()));
                }
                record
            })
            .collect();
        state.tables.insert(describe.name.clone(), Table { describe, records });
        self
    }

    /// Make every write to `entity` fail (bulk jobs end `Failed`).
    pub async fn set_failing(&self, entity: &str, failing: bool) {
        let mut state = self.state.write().await;
        if failing {
            state.failing_entities.insert(entity.to_string());
        } else {
            state.failing_entities.remove(entity);
        }
    }

    /// Current records of an entity
    pub async fn records(&self, entity: &str) -> Vec<Record> {
        let state = self.state.read().await;
        state.table(entity).map(|t| t.records.clone()).unwrap_or_default()
    }

    /// Every entity with its records
    pub async fn tables(&self) -> Vec<(EntityDescribe, Vec<Record>)> {
        let state = self.state.read().await;
        state
            .tables
            .values()
            .map(|t| (t.describe.clone(), t.records.clone()))
            .collect()
    }

    /// Queries run so far, in order
    pub async fn executed_queries(&self) -> Vec<String> {
        self.state.read().await.executed_queries.clone()
    }

    pub async fn describe_calls(&self) -> usize {
        self.state.read().await.describe_calls
    }

    /// Register or replace an entity schema, keeping its records.
    pub async fn put_describe(&self, describe: EntityDescribe) {
        let name = describe.name.clone();
        let mut state = self.state.write().await;
        state.tables.entry(name).or_default().describe = describe;
    }

    async fn job(&self, job_id: &str) -> Result<Job> {
        self.state
            .read()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| TransportError::JobFailed(format!("unknown job {job_id}")).into())
    }
}

#[async_trait]
impl EndpointClient for MemoryEndpoint {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> EndpointKind {
        self.kind
    }

    async fn describe(&self, entity: &str) -> Result<EntityDescribe> {
        let mut state = self.state.write().await;
        state.describe_calls += 1;
        state
            .table(entity)
            .map(|t| t.describe.clone())
            .ok_or_else(|| {
                SchemaError::EntityNotFound {
                    entity: entity.to_string(),
                    endpoint: self.label.clone(),
                }
                .into()
            })
    }

    async fn query_stream(&self, query: &str, transport: QueryTransport) -> Result<Box<dyn RecordSource>> {
        let mut state = self.state.write().await;
        state.executed_queries.push(query.to_string());
        let records = state.execute_query(query)?;
        debug!("{}: {:?} query returned {} records", self.label, transport, records.len());

        let page = match transport {
            QueryTransport::Rest => REST_PAGE_SIZE,
            QueryTransport::Bulk => BULK_PAGE_SIZE,
        };
        Ok(Box::new(VecRecordSource::new(records, page)))
    }

    async fn update(&self, entity: &str, operation: WriteOperation, records: Vec<Record>) -> Result<Vec<RecordResult>> {
        let mut state = self.state.write().await;
        state.apply_write(entity, operation, records)
    }

    async fn ingest_open(&self, entity: &str, operation: WriteOperation) -> Result<JobInfo> {
        let mut state = self.state.write().await;
        if state.table(entity).is_none() {
            return Err(SchemaError::EntityNotFound {
                entity: entity.to_string(),
                endpoint: self.label.clone(),
            }
            .into());
        }

        let info = JobInfo {
            id: new_id(),
            entity: entity.to_string(),
            operation,
            state: JobState::Open,
            records_processed: 0,
            records_failed: 0,
            error_message: None,
        };
        state.jobs.insert(
            info.id.clone(),
            Job {
                info: info.clone(),
                payload: String::new(),
                results: Vec::new(),
            },
        );
        Ok(info)
    }

    async fn ingest_upload(&self, job_id: &str, csv: String) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| TransportError::JobFailed(format!("unknown job {job_id}")))?;
        if job.info.state != JobState::Open {
            return Err(TransportError::JobFailed(format!("job {job_id} is not open")).into());
        }
        job.payload = csv;
        Ok(())
    }

    async fn ingest_close(&self, job_id: &str) -> Result<JobInfo> {
        let mut state = self.state.write().await;
        let mut job = state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| TransportError::JobFailed(format!("unknown job {job_id}")))?;

        let (_, records) = parse_records(&job.payload);
        let total = records.len() as u64;

        if state.failing_entities.contains(&job.info.entity) {
            job.info.state = JobState::Failed;
            job.info.error_message = Some("forced failure".to_string());
            job.info.records_processed = 0;
            job.info.records_failed = total;
        } else {
            let results = state.apply_write(&job.info.entity, job.info.operation, records)?;
            job.info.records_failed = results.iter().filter(|r| !r.is_success()).count() as u64;
            job.info.records_processed = total;
            job.info.state = JobState::JobComplete;
            job.results = results;
        }

        info!(
            "{}: job {} on {} finished as {:?}",
            self.label, job.info.id, job.info.entity, job.info.state
        );
        let info = job.info.clone();
        state.jobs.insert(job_id.to_string(), job);
        Ok(info)
    }

    async fn ingest_check(&self, job_id: &str) -> Result<JobInfo> {
        Ok(self.job(job_id).await?.info)
    }

    async fn ingest_successful_results(&self, job_id: &str) -> Result<Vec<RecordResult>> {
        let job = self.job(job_id).await?;
        Ok(job.results.into_iter().filter(|r| r.is_success()).collect())
    }

    async fn ingest_failed_results(&self, job_id: &str) -> Result<Vec<RecordResult>> {
        let job = self.job(job_id).await?;
        Ok(job.results.into_iter().filter(|r| !r.is_success()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::FieldDescribe;
    use serde_json::json;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    fn endpoint() -> MemoryEndpoint {
        MemoryEndpoint::new("org")
            .with_entity(
                EntityDescribe::new("Account", vec![FieldDescribe::id(), FieldDescribe::text("Name")]),
                vec![
                    record(&[("Id", "A1"), ("Name", "Acme")]),
                    record(&[("Id", "A2"), ("Name", "Globex")]),
                ],
            )
            .with_entity(
                EntityDescribe::new(
                    "Contact",
                    vec![
                        FieldDescribe::id(),
                        FieldDescribe::text("LastName"),
                        FieldDescribe::lookup("AccountId", "Account"),
                    ],
                ),
                vec![
                    record(&[("Id", "C1"), ("LastName", "Smith"), ("AccountId", "A1")]),
                    record(&[("Id", "C2"), ("LastName", "Jones"), ("AccountId", "A2")]),
                    record(&[("Id", "C3"), ("LastName", "Brown")]),
                ],
            )
    }

    async fn query(endpoint: &MemoryEndpoint, query: &str) -> Vec<Record> {
        let mut source = endpoint.query_stream(query, QueryTransport::Rest).await.unwrap();
        let mut records = Vec::new();
        while let Some(batch) = source.next_batch().await.unwrap() {
            records.extend(batch);
        }
        records
    }

    #[tokio::test]
    async fn test_query_with_relationship_path() {
        let endpoint = endpoint();
        let records = query(&endpoint, "SELECT Id, Account.Name FROM Contact WHERE Account.Name = 'Acme'").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["Id"], json!("C1"));
        assert_eq!(records[0]["Account.Name"], json!("Acme"));
    }

    #[tokio::test]
    async fn test_count_order_limit() {
        let endpoint = endpoint();
        assert_eq!(endpoint.count("SELECT COUNT(Id) FROM Contact WHERE AccountId != null").await.unwrap(), 2);

        let records = query(&endpoint, "SELECT Id FROM Contact ORDER BY LastName DESC LIMIT 2").await;
        let ids: Vec<_> = records.iter().map(|r| r["Id"].clone()).collect();
        assert_eq!(ids, vec![json!("C1"), json!("C2")]);
    }

    #[tokio::test]
    async fn test_unknown_entity() {
        let endpoint = endpoint();
        assert!(endpoint.describe("Lead").await.is_err());
        assert!(endpoint.query_stream("SELECT Id FROM Lead", QueryTransport::Rest).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_writes() {
        let endpoint = endpoint();
        let results = endpoint
            .update(
                "Account",
                WriteOperation::Insert,
                vec![record(&[("Name", "Initech")]), record(&[("Bogus", "x")])],
            )
            .await
            .unwrap();
        assert!(results[0].is_success() && results[0].created);
        assert!(!results[1].is_success());

        let results = endpoint
            .update("Account", WriteOperation::Update, vec![record(&[("Id", "A1"), ("Name", "Acme 2")])])
            .await
            .unwrap();
        assert!(results[0].is_success());

        endpoint
            .update("Account", WriteOperation::Delete, vec![record(&[("Id", "A2")])])
            .await
            .unwrap();
        let names: Vec<_> = endpoint.records("Account").await.iter().map(|r| r["Name"].clone()).collect();
        assert_eq!(names, vec![json!("Acme 2"), json!("Initech")]);
    }

    #[tokio::test]
    async fn test_ingest_job_lifecycle() {
        let endpoint = endpoint();
        let job = endpoint.ingest_open("Account", WriteOperation::Insert).await.unwrap();
        assert_eq!(job.state, JobState::Open);

        endpoint
            .ingest_upload(&job.id, "Name\nHooli\n\"Pied, Piper\"\n".to_string())
            .await
            .unwrap();
        let closed = endpoint.ingest_close(&job.id).await.unwrap();
        assert_eq!(closed.state, JobState::JobComplete);
        assert_eq!(closed.records_processed, 2);

        let ok = endpoint.ingest_successful_results(&job.id).await.unwrap();
        assert_eq!(ok.len(), 2);
        assert!(endpoint.ingest_failed_results(&job.id).await.unwrap().is_empty());
        assert_eq!(endpoint.records("Account").await.len(), 4);
    }

    #[tokio::test]
    async fn test_failing_job() {
        let endpoint = endpoint();
        endpoint.set_failing("Account", true).await;
        let job = endpoint.ingest_open("Account", WriteOperation::Insert).await.unwrap();
        endpoint.ingest_upload(&job.id, "Name\nHooli\n".to_string()).await.unwrap();
        let closed = endpoint.ingest_close(&job.id).await.unwrap();
        assert_eq!(closed.state, JobState::Failed);
        assert_eq!(closed.records_failed, 1);
    }
}
