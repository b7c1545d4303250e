//! Flat-file endpoint over a directory of `<Entity>.csv` files
//!
//! Schemas come from `<Entity>.describe.json` when present and are otherwise
//! synthesized from the header row. Written entities are saved back to their
//! CSV files by [`EndpointClient::finish`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::transfer::csv::{CsvWriter, read_records};
use crate::transfer::streaming::{RecordSink, RecordSource};

use super::memory::MemoryEndpoint;
use super::{
    EndpointClient, EndpointKind, EntityDescribe, FieldDescribe, ID_FIELD, JobInfo, QueryTransport,
    Record, RecordResult, WriteOperation,
};

const CSV_EXTENSION: &str = "csv";
const DESCRIBE_SUFFIX: &str = ".describe.json";

/// Endpoint backed by CSV files
pub struct CsvFileEndpoint {
    directory: PathBuf,
    inner: MemoryEndpoint,
    dirty: Mutex<BTreeSet<String>>,
}

/// Schema for a CSV file without a describe file: every column is a writable
/// text field, relationship path columns are left out.
fn synthesize_describe(entity: &str, headers: &[String]) -> EntityDescribe {
    let mut fields = vec![FieldDescribe::id()];
    fields.extend(
        headers
            .iter()
            .filter(|h| h.as_str() != ID_FIELD && !h.contains('.'))
            .map(|h| FieldDescribe::text(h)),
    );
    EntityDescribe::new(entity, fields)
}

impl CsvFileEndpoint {
    /// Load every `<Entity>.csv` of `directory`.
    pub async fn open(label: impl Into<String>, directory: &Path) -> Result<Self> {
        let label = label.into();
        let mut inner = MemoryEndpoint::new(label.clone()).with_kind(EndpointKind::File);

        if tokio::fs::try_exists(directory).await.unwrap_or(false) {
            let mut entries = tokio::fs::read_dir(directory).await?;
            let mut files = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some(CSV_EXTENSION) {
                    files.push(path);
                }
            }
            files.sort();

            for path in files {
                let Some(entity) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                let (headers, records) = read_records(&path).await?;

                let describe_path = directory.join(format!("{entity}{DESCRIBE_SUFFIX}"));
                let describe = if tokio::fs::try_exists(&describe_path).await.unwrap_or(false) {
                    let content = tokio::fs::read_to_string(&describe_path).await?;
                    let mut describe: EntityDescribe = serde_json::from_str(&content)?;
                    describe.name = entity.clone();
                    describe
                } else {
                    synthesize_describe(&entity, &headers)
                };

                debug!("{}: loaded {} records of {}", label, records.len(), entity);
                inner = inner.with_entity(describe, records);
            }
        }

        info!("Opened CSV endpoint {} at {}", label, directory.display());
        Ok(Self {
            directory: directory.to_path_buf(),
            inner,
            dirty: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Current records of an entity
    pub async fn records(&self, entity: &str) -> Vec<Record> {
        self.inner.records(entity).await
    }

    async fn mark_dirty(&self, entity: &str) {
        self.dirty.lock().await.insert(entity.to_string());
    }
}

#[async_trait]
impl EndpointClient for CsvFileEndpoint {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::File
    }

    async fn describe(&self, entity: &str) -> Result<EntityDescribe> {
        self.inner.describe(entity).await
    }

    async fn register_schema(&self, describe: &EntityDescribe) -> Result<()> {
        self.inner.put_describe(describe.clone()).await;
        Ok(())
    }

    async fn query_stream(&self, query: &str, transport: QueryTransport) -> Result<Box<dyn RecordSource>> {
        self.inner.query_stream(query, transport).await
    }

    async fn update(&self, entity: &str, operation: WriteOperation, records: Vec<Record>) -> Result<Vec<RecordResult>> {
        self.mark_dirty(entity).await;
        self.inner.update(entity, operation, records).await
    }

    async fn ingest_open(&self, entity: &str, operation: WriteOperation) -> Result<JobInfo> {
        self.mark_dirty(entity).await;
        self.inner.ingest_open(entity, operation).await
    }

    async fn ingest_upload(&self, job_id: &str, csv: String) -> Result<()> {
        self.inner.ingest_upload(job_id, csv).await
    }

    async fn ingest_close(&self, job_id: &str) -> Result<JobInfo> {
        self.inner.ingest_close(job_id).await
    }

    async fn ingest_check(&self, job_id: &str) -> Result<JobInfo> {
        self.inner.ingest_check(job_id).await
    }

    async fn ingest_successful_results(&self, job_id: &str) -> Result<Vec<RecordResult>> {
        self.inner.ingest_successful_results(job_id).await
    }

    async fn ingest_failed_results(&self, job_id: &str) -> Result<Vec<RecordResult>> {
        self.inner.ingest_failed_results(job_id).await
    }

    async fn finish(&self) -> Result<()> {
        let dirty = self.dirty.lock().await.clone();
        if dirty.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.directory).await?;

        for (describe, records) in self.inner.tables().await {
            if !dirty.contains(&describe.name) {
                continue;
            }

            let mut headers = vec![ID_FIELD.to_string()];
            for field in &describe.fields {
                if field.name != ID_FIELD {
                    headers.push(field.name.clone());
                }
            }
            for record in &records {
                for key in record.keys() {
                    if !headers.contains(key) {
                        headers.push(key.clone());
                    }
                }
            }

            let path = self.directory.join(format!("{}.{CSV_EXTENSION}", describe.name));
            let mut writer = CsvWriter::create(&path, headers).await?;
            writer.write_batch(&records).await?;
            writer.finalize().await?;
            info!("{}: saved {} records to {}", self.label(), records.len(), path.display());
        }

        Ok(())
    }
}
