//! Record sources and sinks for streamed transfers
//!
//! A source yields records in batches until exhausted; a sink accepts batches
//! and is finalized once. Neither loads a whole result set into memory.

use async_trait::async_trait;
use tracing::debug;

use crate::endpoint::Record;
use crate::error::Result;

/// Trait for streaming records in batches
#[async_trait]
pub trait RecordSource: Send {
    /// Fetch the next batch of records
    ///
    /// # Returns
    /// * `Result<Option<Vec<Record>>>` - Next batch, or None if exhausted
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>>;

    /// Close the source and release its resources
    async fn close(&mut self) -> Result<()>;
}

/// Trait for writing record batches to a destination
#[async_trait]
pub trait RecordSink: Send {
    /// Write a batch of records
    ///
    /// # Returns
    /// * `Result<usize>` - Number of records written
    async fn write_batch(&mut self, records: &[Record]) -> Result<usize>;

    /// Flush buffers
    async fn finalize(&mut self) -> Result<()>;
}

/// Record source over records already in memory
pub struct VecRecordSource {
    records: std::vec::IntoIter<Record>,
    batch_size: usize,
    fetched: u64,
    closed: bool,
}

impl VecRecordSource {
    pub fn new(records: Vec<Record>, batch_size: usize) -> Self {
        Self {
            records: records.into_iter(),
            batch_size: batch_size.max(1),
            fetched: 0,
            closed: false,
        }
    }
}

#[async_trait]
impl RecordSource for VecRecordSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        if self.closed {
            return Ok(None);
        }

        let batch: Vec<Record> = self.records.by_ref().take(self.batch_size).collect();
        if batch.is_empty() {
            debug!("Record source exhausted after {} records", self.fetched);
            self.closed = true;
            return Ok(None);
        }

        self.fetched += batch.len() as u64;
        Ok(Some(batch))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Sink collecting records in memory
#[derive(Debug, Default)]
pub struct VecRecordSink {
    pub records: Vec<Record>,
}

#[async_trait]
impl RecordSink for VecRecordSink {
    async fn write_batch(&mut self, records: &[Record]) -> Result<usize> {
        self.records.extend_from_slice(records);
        Ok(records.len())
    }

    async fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}
