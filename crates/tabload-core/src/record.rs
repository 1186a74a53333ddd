//! Record batches and the channel plumbing between pipeline stages.
//!
//! One file's pipeline is three tasks: reader, validator, stage writer.
//! They are connected by bounded channels so memory stays proportional to
//! `batch_size * field_count` regardless of file size.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::ValidationIssue;
use crate::value::Value;

/// Backpressure bound between pipeline stages: at most this many batches
/// are in flight between two stages.
pub const STAGE_CHANNEL_CAPACITY: usize = 2;

/// A raw record as read from a file: file column name to raw cell.
pub type RawRecord = HashMap<String, serde_json::Value>;

/// A batch of raw records, at most `batch_size` long.
pub type RawBatch = Vec<RawRecord>;

pub type RawBatchTx = mpsc::Sender<RawBatch>;
pub type RawBatchRx = mpsc::Receiver<RawBatch>;

/// A record that passed validation, carrying its derived columns.
#[derive(Debug, Clone)]
pub struct AcceptedRecord {
    /// Typed cells in schema declaration order.
    pub values: Vec<Value>,
    pub row_hash: [u8; 16],
    pub source_filename: String,
    pub file_load_log_id: i64,
}

/// A record that failed validation, shaped for the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DlqRecord {
    pub source_filename: String,
    /// 1-based position of the record in the source file, counted from the
    /// reader's starting row number.
    pub file_row_number: i64,
    /// The failed record projected to failing fields plus grain fields,
    /// keyed by external column alias.
    pub file_record_data: serde_json::Value,
    pub validation_errors: Vec<ValidationIssue>,
    pub file_load_log_id: i64,
    pub target_table_name: String,
    pub failed_at: DateTime<Utc>,
}

/// Validator output: accepted and rejected records interleaved in input
/// order within each batch.
#[derive(Debug, Clone)]
pub enum Validated {
    Accepted(AcceptedRecord),
    Rejected(DlqRecord),
}

pub type ValidatedBatch = Vec<Validated>;

pub type ValidatedBatchTx = mpsc::Sender<ValidatedBatch>;
pub type ValidatedBatchRx = mpsc::Receiver<ValidatedBatch>;
