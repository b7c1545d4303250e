//! Streaming transfer engine
//!
//! Moves query results into CSV files and records into endpoints:
//! - Query transfers run the record source and the sink as two futures of one
//!   task joined over a bounded channel; a full channel suspends the reader
//!   until the writer drains it
//! - A timer-driven progress future reports the written count and skips ticks
//!   where the count did not change
//! - Writes go through row-limited calls or the bulk job lifecycle
//!   (open, upload, close, poll, collect results)

pub mod csv;
pub mod progress;
pub mod streaming;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PollingConfig, TransferConfig};
use crate::endpoint::{EndpointClient, JobState, QueryTransport, Record, RecordResult, WriteOperation};
use crate::engine::suggest_polling_settings;
use crate::error::{Result, StreamError, TransportError};

use self::csv::{CsvWriter, records_to_csv};
use self::progress::ProgressTracker;
use self::streaming::RecordSink;

/// Called with a transfer label and the records written so far
pub type ProgressCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Result of a query transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryTransferResult {
    /// Records received from the source
    pub records_read: u64,
    /// Records kept by the transform and written to the sink
    pub records_written: u64,
    pub elapsed_ms: u64,
}

/// Result of a write transfer
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    /// One result per submitted record, in submission order
    pub results: Vec<RecordResult>,
    /// Terminal state of the last bulk job, if the bulk transport was used
    pub job_state: Option<JobState>,
    pub job_error: Option<String>,
    pub processed: u64,
    pub failed: u64,
}

impl UpdateOutcome {
    /// Whether a bulk job ended `Failed` or `Aborted`
    pub fn job_failed(&self) -> bool {
        matches!(self.job_state, Some(JobState::Failed | JobState::Aborted))
    }
}

/// Batch sizes for a write transfer
#[derive(Debug, Clone, Copy)]
pub struct WriteBatching {
    pub use_bulk: bool,
    pub rest_batch_size: usize,
    pub bulk_batch_size: usize,
}

/// Executes query and write transfers against endpoints
pub struct TransferEngine {
    transfer: TransferConfig,
    polling: PollingConfig,
    show_progress: bool,
    on_progress: Option<ProgressCallback>,
}

impl TransferEngine {
    pub fn new(transfer: TransferConfig, polling: PollingConfig) -> Self {
        Self {
            transfer,
            polling,
            show_progress: false,
            on_progress: None,
        }
    }

    /// Draw progress bars
    pub fn with_progress_bars(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Stream a query into a sink.
    ///
    /// `transform` sees every record; returning `None` drops it.
    ///
    /// # Arguments
    /// * `endpoint` - Endpoint to query
    /// * `query` - Complete query text
    /// * `transport` - Row-limited or bulk query
    /// * `label` - Name used in logs and progress
    /// * `sink` - Destination of the kept records
    /// * `transform` - Per-record transformation and filter
    pub async fn query_to_sink<F>(
        &self,
        endpoint: &dyn EndpointClient,
        query: &str,
        transport: QueryTransport,
        label: &str,
        sink: &mut dyn RecordSink,
        mut transform: F,
    ) -> Result<QueryTransferResult>
    where
        F: FnMut(Record) -> Option<Record> + Send,
    {
        let start_time = Instant::now();
        debug!("{}: {:?} query on {}: {}", label, transport, endpoint.label(), query);

        let mut source = endpoint.query_stream(query, transport).await?;
        let (tx, mut rx) = mpsc::channel::<Vec<Record>>(self.transfer.channel_capacity.max(1));

        let read = AtomicU64::new(0);
        let written = AtomicU64::new(0);
        let done = CancellationToken::new();
        let tracker = ProgressTracker::new(label, None, self.show_progress);

        let (read_ref, written_ref, done_ref) = (&read, &written, &done);

        let producer = async move {
            let result: Result<()> = async {
                while let Some(batch) = source.next_batch().await? {
                    read_ref.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    // Suspends while the channel is full
                    if tx.send(batch).await.is_err() {
                        return Err(StreamError::Closed.into());
                    }
                }
                Ok(())
            }
            .await;
            drop(tx);
            if let Err(e) = source.close().await {
                warn!("Failed to close record source: {}", e);
            }
            result
        };

        let consumer = async move {
            let result: Result<()> = async {
                while let Some(batch) = rx.recv().await {
                    let kept: Vec<Record> = batch.into_iter().filter_map(&mut transform).collect();
                    if kept.is_empty() {
                        continue;
                    }
                    sink.write_batch(&kept).await?;
                    written_ref.fetch_add(kept.len() as u64, Ordering::Relaxed);
                }
                sink.finalize().await
            }
            .await;
            // Dropping the receiver wakes a producer waiting on a full channel
            drop(rx);
            done_ref.cancel();
            result
        };

        let progress = async {
            let mut ticker = tokio::time::interval(Duration::from_millis(self.transfer.progress_interval_ms.max(1)));
            ticker.tick().await;
            let mut last = 0;
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        let current = written.load(Ordering::Relaxed);
                        if current != last {
                            last = current;
                            tracker.update(current);
                            if let Some(callback) = &self.on_progress {
                                callback(label, current);
                            }
                        }
                    }
                }
            }
        };

        let (produced, consumed, ()) = tokio::join!(producer, consumer, progress);
        tracker.finish();
        // A failed sink closes the channel, so its error explains the producer's
        consumed?;
        produced?;

        let result = QueryTransferResult {
            records_read: read.load(Ordering::Relaxed),
            records_written: written.load(Ordering::Relaxed),
            elapsed_ms: start_time.elapsed().as_millis() as u64,
        };
        if let Some(callback) = &self.on_progress {
            callback(label, result.records_written);
        }

        info!(
            "{}: {} records read, {} written ({} ms)",
            label, result.records_read, result.records_written, result.elapsed_ms
        );
        Ok(result)
    }

    /// Stream a query into a CSV file, creating it or appending to it.
    #[allow(clippy::too_many_arguments)]
    pub async fn query_to_csv<F>(
        &self,
        endpoint: &dyn EndpointClient,
        query: &str,
        transport: QueryTransport,
        label: &str,
        path: &Path,
        headers: Vec<String>,
        append: bool,
        transform: F,
    ) -> Result<QueryTransferResult>
    where
        F: FnMut(Record) -> Option<Record> + Send,
    {
        let mut writer = if append {
            CsvWriter::append(path, headers).await?
        } else {
            CsvWriter::create(path, headers).await?
        };
        self.query_to_sink(endpoint, query, transport, label, &mut writer, transform)
            .await
    }

    /// Write records to an endpoint.
    ///
    /// A bulk job ending `Failed` or `Aborted` is reported in the outcome, its
    /// records (and any not yet submitted) marked with the job error.
    pub async fn update_records(
        &self,
        endpoint: &dyn EndpointClient,
        entity: &str,
        operation: WriteOperation,
        records: Vec<Record>,
        batching: WriteBatching,
    ) -> Result<UpdateOutcome> {
        let mut outcome = UpdateOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let total = records.len();
        let batch_size = if batching.use_bulk {
            batching.bulk_batch_size
        } else {
            batching.rest_batch_size
        }
        .max(1);

        info!(
            "{}: {} {} records via {}",
            entity,
            operation,
            total,
            if batching.use_bulk { "bulk" } else { "rest" }
        );

        let mut offset = 0;
        let mut remaining = records;
        while !remaining.is_empty() {
            let rest = remaining.split_off(batch_size.min(remaining.len()));
            let chunk = std::mem::replace(&mut remaining, rest);
            let chunk_len = chunk.len();

            let results = if batching.use_bulk {
                let (state, error, results) = self.run_bulk_job(endpoint, entity, operation, chunk).await?;
                outcome.job_state = Some(state);
                if matches!(state, JobState::Failed | JobState::Aborted) {
                    let message = error.unwrap_or_else(|| format!("bulk job {state:?}"));
                    warn!("{}: bulk {} job ended {:?}: {}", entity, operation, state, message);
                    for index in offset..total {
                        outcome.results.push(RecordResult {
                            index,
                            id: None,
                            created: false,
                            error: Some(message.clone()),
                        });
                    }
                    outcome.job_error = Some(message);
                    outcome.failed += (total - offset) as u64;
                    return Ok(outcome);
                }
                results
            } else {
                endpoint.update(entity, operation, chunk).await?
            };

            for mut result in results {
                result.index += offset;
                if result.is_success() {
                    outcome.processed += 1;
                } else {
                    outcome.failed += 1;
                }
                outcome.results.push(result);
            }
            offset += chunk_len;
        }

        outcome.results.sort_by_key(|r| r.index);
        Ok(outcome)
    }

    async fn run_bulk_job(
        &self,
        endpoint: &dyn EndpointClient,
        entity: &str,
        operation: WriteOperation,
        records: Vec<Record>,
    ) -> Result<(JobState, Option<String>, Vec<RecordResult>)> {
        let mut headers: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }

        let job = endpoint.ingest_open(entity, operation).await?;
        endpoint
            .ingest_upload(&job.id, records_to_csv(&headers, &records))
            .await?;
        let mut info = endpoint.ingest_close(&job.id).await?;

        let settings = suggest_polling_settings(records.len() as u64, &self.polling);
        let started = Instant::now();
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.tick().await;

        while !info.state.is_terminal() {
            if started.elapsed() > settings.timeout {
                return Err(TransportError::JobTimeout {
                    job_id: job.id.clone(),
                    elapsed_secs: started.elapsed().as_secs(),
                }
                .into());
            }
            ticker.tick().await;
            info = endpoint.ingest_check(&job.id).await?;
            debug!(
                "{}: job {} is {:?} ({} processed, {} failed)",
                entity, job.id, info.state, info.records_processed, info.records_failed
            );
        }

        if info.state != JobState::JobComplete {
            return Ok((info.state, info.error_message, Vec::new()));
        }

        let mut results = endpoint.ingest_successful_results(&job.id).await?;
        results.extend(endpoint.ingest_failed_results(&job.id).await?);
        results.sort_by_key(|r| r.index);
        Ok((info.state, None, results))
    }
}

/// Append per-record results to a status file (`id, created, error, status`).
pub async fn write_status_file(path: &Path, results: &[RecordResult]) -> Result<()> {
    let headers = ["id", "created", "error", "status"].map(str::to_string).to_vec();
    let mut writer = CsvWriter::append(path, headers).await?;

    let rows: Vec<Record> = results
        .iter()
        .map(|result| {
            let mut row = Record::new();
            row.insert("id".to_string(), result.id.clone().into());
            row.insert("created".to_string(), result.created.into());
            row.insert("error".to_string(), result.error.clone().into());
            row.insert("status".to_string(), result.status().into());
            row
        })
        .collect();

    writer.write_batch(&rows).await?;
    writer.finalize().await
}
