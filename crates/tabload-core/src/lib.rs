//! # Tabload Core
//!
//! Foundational types for the tabload file-ingestion pipeline: the declarative
//! record schema, the source registry that classifies incoming files, typed
//! values and coercion, the row fingerprint used for change detection, the
//! error taxonomy, runtime settings, and the lineage-log model shared by the
//! runner and the warehouse layer.
//!
//! ## Key Components
//!
//! - **Schema**: [`RecordSchema`] and [`FieldDef`] describe the typed shape of
//!   a source's records; one declaration drives DDL generation, validation,
//!   alias resolution in the readers, and the row fingerprint.
//! - **Sources**: [`DeclaredSource`] plus [`SourceRegistry`] resolve a
//!   filename to at most one declared source by extension and glob pattern.
//! - **Values**: [`Value`] is the typed cell representation with a canonical,
//!   host-independent string form.
//! - **Errors**: [`LoadError`] partitions failures into the file-notifiable,
//!   transient, and configuration families the runner relies on.
//! - **Batches**: channel type aliases connecting the reader, validator, and
//!   stage-writer tasks of one file's pipeline.

pub mod error;
pub mod hash;
pub mod lineage;
pub mod record;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod source;
pub mod value;

pub use error::{GrainDuplicate, LoadError, SampleError, ValidationIssue};
pub use hash::{row_fingerprint, row_fingerprint_ordered};
pub use lineage::{OutcomeCategory, Phase, PhaseCounters, PhaseOutcome};
pub use record::{
    AcceptedRecord, DlqRecord, RawBatch, RawBatchRx, RawBatchTx, RawRecord, Validated,
    ValidatedBatch, ValidatedBatchRx, ValidatedBatchTx, STAGE_CHANNEL_CAPACITY,
};
pub use retry::{retry, RetryPolicy};
pub use schema::{FieldDef, FieldType, RecordSchema};
pub use settings::{Platform, Settings};
pub use source::{
    file_extension, load_catalog, DeclaredSource, FileKind, Resolution, SourceFormat,
    SourceRegistry,
};
pub use value::Value;
