//! CSV staging files
//!
//! Records are flat maps; dotted relationship paths (`Account.Name`) are plain
//! column names. Empty cells read back as null.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use crate::endpoint::Record;
use crate::error::{Result, StreamError};

use super::streaming::{RecordSink, RecordSource};

const WRITE_BUFFER_CAPACITY: usize = 1024 * 1024;
const READ_BUFFER_CAPACITY: usize = 256 * 1024;
const READ_BATCH_SIZE: usize = 2000;

/// Escape a CSV value if necessary
pub fn escape_csv_value(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Plain text of a record value; null is empty.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn format_row<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .map(escape_csv_value)
        .collect::<Vec<_>>()
        .join(",")
}

fn record_row(headers: &[String], record: &Record) -> String {
    let values: Vec<String> = headers
        .iter()
        .map(|h| record.get(h).map(value_to_text).unwrap_or_default())
        .collect();
    format_row(values.iter().map(String::as_str))
}

/// Incremental CSV row parser, fed one character at a time. Quoted cells
/// may hold separators, doubled quotes and line breaks.
#[derive(Debug, Default)]
struct RowParser {
    row: Vec<String>,
    cell: String,
    in_quotes: bool,
    /// A quote inside a quoted cell: either an escaped quote or the closing one
    quote_pending: bool,
}

impl RowParser {
    /// Returns a row when `ch` ends one. Blank lines yield nothing.
    fn feed(&mut self, ch: char) -> Option<Vec<String>> {
        if self.quote_pending {
            self.quote_pending = false;
            if ch == '"' {
                self.cell.push('"');
                return None;
            }
            self.in_quotes = false;
        } else if self.in_quotes {
            if ch == '"' {
                self.quote_pending = true;
            } else {
                self.cell.push(ch);
            }
            return None;
        }

        match ch {
            '"' => self.in_quotes = true,
            ',' => self.row.push(std::mem::take(&mut self.cell)),
            '\r' => {}
            '\n' => {
                self.row.push(std::mem::take(&mut self.cell));
                let finished = std::mem::take(&mut self.row);
                if !(finished.len() == 1 && finished[0].is_empty()) {
                    return Some(finished);
                }
            }
            _ => self.cell.push(ch),
        }
        None
    }

    /// The last row of input without a trailing line break
    fn finish(&mut self) -> Option<Vec<String>> {
        self.in_quotes = false;
        self.quote_pending = false;
        if self.cell.is_empty() && self.row.is_empty() {
            return None;
        }
        self.row.push(std::mem::take(&mut self.cell));
        Some(std::mem::take(&mut self.row))
    }
}

/// Split CSV text into rows of cells, honoring quoted cells with embedded
/// separators, doubled quotes and line breaks. Blank lines are skipped.
pub fn parse_csv(content: &str) -> Vec<Vec<String>> {
    let mut parser = RowParser::default();
    let mut rows: Vec<Vec<String>> = content.chars().filter_map(|ch| parser.feed(ch)).collect();
    rows.extend(parser.finish());
    rows
}

fn row_to_record(headers: &[String], cells: &[String]) -> Record {
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let value = match cells.get(i) {
                Some(cell) if !cell.is_empty() => Value::String(cell.clone()),
                _ => Value::Null,
            };
            (header.clone(), value)
        })
        .collect()
}

/// Parse CSV text with a header row into records.
pub fn parse_records(content: &str) -> (Vec<String>, Vec<Record>) {
    let mut rows = parse_csv(content).into_iter();
    let Some(headers) = rows.next() else {
        return (Vec::new(), Vec::new());
    };
    let records = rows.map(|cells| row_to_record(&headers, &cells)).collect();
    (headers, records)
}

/// Render records as CSV text with a header row (bulk upload payloads).
pub fn records_to_csv(headers: &[String], records: &[Record]) -> String {
    let mut out = format_row(headers.iter().map(String::as_str));
    out.push('\n');
    for record in records {
        out.push_str(&record_row(headers, record));
        out.push('\n');
    }
    out
}

/// Read every record of a CSV file; a missing file has none.
///
/// Holds the whole file in memory. Staged files are read through
/// [`CsvReader`] instead.
pub async fn read_records(path: &Path) -> Result<(Vec<String>, Vec<Record>)> {
    let mut reader = CsvReader::open(path, READ_BATCH_SIZE).await?;
    let mut records = Vec::new();
    while let Some(batch) = reader.next_batch().await? {
        records.extend(batch);
    }
    Ok((reader.headers, records))
}

/// Header row of a CSV file; empty when the file is missing or empty.
pub async fn read_header(path: &Path) -> Result<Vec<String>> {
    Ok(CsvReader::open(path, 1).await?.headers)
}

/// Writer for staged CSV files with a fixed column list
pub struct CsvWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    headers: Vec<String>,
    written: u64,
}

impl CsvWriter {
    /// Create (or truncate) a file and write the header row.
    pub async fn create(path: &Path, headers: Vec<String>) -> Result<Self> {
        validate_path(path)?;
        let file = File::create(path)
            .await
            .map_err(|e| StreamError::WriteFailed(format!("Failed to create {}: {e}", path.display())))?;

        let mut writer = Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file),
            path: path.to_path_buf(),
            headers,
            written: 0,
        };
        let header_line = format_row(writer.headers.iter().map(String::as_str));
        writer.write_line(&header_line).await?;

        debug!("Created CSV file {}", path.display());
        Ok(writer)
    }

    /// Open a file for appending. An existing header row wins over `headers`
    /// so appended rows line up with the rows already written.
    pub async fn append(path: &Path, headers: Vec<String>) -> Result<Self> {
        let existing = read_header(path).await?;
        if existing.is_empty() {
            return Self::create(path, headers).await;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| StreamError::WriteFailed(format!("Failed to open {}: {e}", path.display())))?;

        debug!("Appending to CSV file {}", path.display());
        Ok(Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file),
            path: path.to_path_buf(),
            headers: existing,
            written: 0,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written by this writer
    pub fn written(&self) -> u64 {
        self.written
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StreamError::WriteFailed(format!("Failed to write row: {e}")))?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|e| StreamError::WriteFailed(format!("Failed to write newline: {e}")))?;
        Ok(())
    }

    pub async fn file_size(&self) -> Result<u64> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| StreamError::WriteFailed(format!("Failed to get file metadata: {e}")))?;
        Ok(metadata.len())
    }
}

#[async_trait]
impl RecordSink for CsvWriter {
    async fn write_batch(&mut self, records: &[Record]) -> Result<usize> {
        for record in records {
            let row = record_row(&self.headers, record);
            self.write_line(&row).await?;
        }
        self.written += records.len() as u64;
        Ok(records.len())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| StreamError::WriteFailed(format!("Failed to flush file: {e}")))?;
        debug!("Finalized CSV file {} ({} rows)", self.path.display(), self.written);
        Ok(())
    }
}

fn validate_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(StreamError::WriteFailed(format!(
                "Directory does not exist: {}",
                parent.display()
            ))
            .into());
        }
    }
    Ok(())
}

/// Record source over a staged CSV file.
///
/// Rows are parsed line by line from a buffered reader, `batch_size` records
/// at a time; only the current batch is held in memory.
pub struct CsvReader {
    reader: Option<BufReader<File>>,
    path: PathBuf,
    headers: Vec<String>,
    parser: RowParser,
    line: String,
    batch_size: usize,
    fetched: u64,
}

impl CsvReader {
    /// Open a file and read its header row. A missing file reads as empty.
    pub async fn open(path: &Path, batch_size: usize) -> Result<Self> {
        let reader = match File::open(path).await {
            Ok(file) => Some(BufReader::with_capacity(READ_BUFFER_CAPACITY, file)),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StreamError::ReadFailed(format!("{}: {e}", path.display())).into()),
        };

        let mut csv = Self {
            reader,
            path: path.to_path_buf(),
            headers: Vec::new(),
            parser: RowParser::default(),
            line: String::new(),
            batch_size: batch_size.max(1),
            fetched: 0,
        };
        csv.headers = csv.read_row().await?.unwrap_or_default();
        debug!("Opened CSV file {} ({} columns)", path.display(), csv.headers.len());
        Ok(csv)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    async fn read_row(&mut self) -> Result<Option<Vec<String>>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        loop {
            self.line.clear();
            let read = reader
                .read_line(&mut self.line)
                .await
                .map_err(|e| StreamError::ReadFailed(format!("{}: {e}", self.path.display())))?;
            if read == 0 {
                self.reader = None;
                return Ok(self.parser.finish());
            }
            // A line ends at most one row; quoted line breaks keep it open
            for ch in self.line.chars() {
                if let Some(row) = self.parser.feed(ch) {
                    return Ok(Some(row));
                }
            }
        }
    }
}

#[async_trait]
impl RecordSource for CsvReader {
    async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            match self.read_row().await? {
                Some(cells) => batch.push(row_to_record(&self.headers, &cells)),
                None => break,
            }
        }

        if batch.is_empty() {
            debug!("CSV file {} exhausted after {} records", self.path.display(), self.fetched);
            return Ok(None);
        }
        self.fetched += batch.len() as u64;
        Ok(Some(batch))
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
