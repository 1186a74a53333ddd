//! Per-format record readers.
//!
//! A reader turns a file's bytes into fixed-size batches of raw field maps
//! and pushes them into a bounded channel. Decoding is synchronous (the
//! format crates want `std::io::Read`), so the runner executes
//! [`Reader::run_blocking`] under `spawn_blocking`, bridging the async byte
//! stream with `SyncIoBridge`. A closed channel means the downstream stage
//! failed first; the reader stops and reports it as such.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;

use tabload_core::{
    DeclaredSource, FileKind, LoadError, RawBatch, RawBatchTx, RawRecord, SourceFormat,
};

mod csv;
mod excel;
mod json;
mod parquet;

pub use json::flatten_json;

/// Input handed to a reader: a byte stream for formats that decode
/// sequentially, a full buffer for formats that need random access.
pub enum ReaderInput {
    Stream(Box<dyn Read + Send>),
    Buffer(Bytes),
}

/// A configured reader for one file.
pub struct Reader {
    kind: FileKind,
    source: Arc<DeclaredSource>,
    filename: String,
    batch_size: usize,
}

impl Reader {
    /// Build a reader for `filename` according to its extension. The
    /// registry has already matched extension and format, so a mismatch
    /// here is a programming error reported as configuration.
    pub fn new(
        source: Arc<DeclaredSource>,
        filename: &str,
        batch_size: usize,
    ) -> Result<Self, LoadError> {
        let ext = tabload_core::file_extension(filename);
        let kind = FileKind::for_extension(&ext).ok_or_else(|| {
            LoadError::Config(format!("no reader for extension {ext:?} of {filename}"))
        })?;
        Ok(Self {
            kind,
            source,
            filename: filename.to_string(),
            batch_size,
        })
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Whether this format needs the whole object buffered in memory.
    pub fn needs_buffer(&self) -> bool {
        matches!(self.kind, FileKind::Excel | FileKind::Parquet)
    }

    /// Position of the first data record in the file. Row 1 is the header
    /// for CSV and Excel, so data starts at 2 plus any skipped rows; JSON
    /// and Parquet have no header row.
    pub fn starting_row_number(&self) -> i64 {
        match (&self.kind, &self.source.format) {
            (FileKind::Csv { .. }, SourceFormat::Csv { skip_rows, .. }) => 2 + *skip_rows as i64,
            (FileKind::Excel, SourceFormat::Excel { skip_rows, .. }) => 2 + *skip_rows as i64,
            _ => 1,
        }
    }

    /// Decode the file, pushing batches into `tx`. Returns the number of
    /// raw records read. Blocking; run under `spawn_blocking`.
    pub fn run_blocking(&self, input: ReaderInput, tx: RawBatchTx) -> Result<u64, LoadError> {
        let sink = BatchSender::new(tx, self.batch_size);
        match (&self.kind, &self.source.format, input) {
            (
                FileKind::Csv { gzip },
                SourceFormat::Csv {
                    delimiter,
                    skip_rows,
                },
                ReaderInput::Stream(stream),
            ) => {
                let stream = maybe_gunzip(stream, *gzip);
                csv::read_csv(
                    stream,
                    *delimiter,
                    *skip_rows,
                    &self.source.schema,
                    &self.filename,
                    sink,
                )
            }
            (
                FileKind::Json { gzip },
                SourceFormat::Json { array_path },
                ReaderInput::Stream(stream),
            ) => {
                let stream = maybe_gunzip(stream, *gzip);
                json::read_json(stream, array_path, &self.source.schema, &self.filename, sink)
            }
            (
                FileKind::Excel,
                SourceFormat::Excel {
                    sheet_name,
                    skip_rows,
                },
                ReaderInput::Buffer(data),
            ) => excel::read_excel(
                data,
                sheet_name.as_deref(),
                *skip_rows,
                &self.source.schema,
                &self.filename,
                sink,
            ),
            (FileKind::Parquet, SourceFormat::Parquet, ReaderInput::Buffer(data)) => {
                parquet::read_parquet(data, &self.source.schema, &self.filename, sink)
            }
            _ => Err(LoadError::Config(format!(
                "reader input does not match declared format for {}",
                self.filename
            ))),
        }
    }
}

fn maybe_gunzip(stream: Box<dyn Read + Send>, gzip: bool) -> Box<dyn Read + Send> {
    if gzip {
        Box::new(GzDecoder::new(stream))
    } else {
        stream
    }
}

/// Accumulates raw records and flushes full batches into the channel.
pub(crate) struct BatchSender {
    tx: RawBatchTx,
    batch: RawBatch,
    batch_size: usize,
    rows: u64,
}

impl BatchSender {
    fn new(tx: RawBatchTx, batch_size: usize) -> Self {
        Self {
            tx,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            rows: 0,
        }
    }

    pub(crate) fn push(&mut self, record: RawRecord) -> Result<(), LoadError> {
        self.batch.push(record);
        self.rows += 1;
        if self.batch.len() == self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LoadError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.tx
            .blocking_send(batch)
            .map_err(|_| LoadError::ChannelClosed("reader output"))
    }

    /// Flush the final partial batch and return the raw record count.
    pub(crate) fn finish(mut self) -> Result<u64, LoadError> {
        self.flush()?;
        Ok(self.rows)
    }
}

/// Check that every schema field (by external alias if declared) is present
/// in the file's header set, compared case-insensitively.
pub(crate) fn validate_fields<'a>(
    actual_fields: impl IntoIterator<Item = &'a str>,
    schema: &tabload_core::RecordSchema,
    filename: &str,
) -> Result<(), LoadError> {
    let actual: BTreeSet<String> = actual_fields
        .into_iter()
        .map(|f| f.to_lowercase())
        .collect();
    let required: BTreeSet<String> = schema
        .fields
        .iter()
        .map(|f| f.file_name().to_lowercase())
        .collect();
    let missing: Vec<String> = required.difference(&actual).cloned().collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(LoadError::MissingColumns {
            source_filename: filename.to_string(),
            required_fields: required.into_iter().collect(),
            missing_fields: missing,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tabload_core::STAGE_CHANNEL_CAPACITY;

    /// Drive a reader function on one thread while draining batches on
    /// another, the way the runner does with spawn_blocking.
    pub(crate) fn collect_batches<F>(read: F) -> (Result<u64, LoadError>, Vec<RawBatch>)
    where
        F: FnOnce(BatchSender) -> Result<u64, LoadError> + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let (tx, mut rx) = tokio::sync::mpsc::channel(STAGE_CHANNEL_CAPACITY);
            let sink = BatchSender::new(tx, test_batch_size());
            let reader = tokio::task::spawn_blocking(move || read(sink));
            let mut batches = Vec::new();
            while let Some(batch) = rx.recv().await {
                batches.push(batch);
            }
            (reader.await.unwrap(), batches)
        })
    }

    pub(crate) fn test_batch_size() -> usize {
        3
    }
}
