//! Error taxonomy for the ingestion pipeline.
//!
//! Errors partition into three families the runner treats differently:
//!
//! 1. **File-notifiable** errors describe a problem with the file itself
//!    (missing header, failed audit, ...). They are never retried; if the
//!    source declares notification recipients they are rendered into an
//!    email and the file counts as handled.
//! 2. **Transient** storage and database errors, retried with bounded
//!    exponential backoff.
//! 3. **Configuration** errors (unknown dialect, ambiguous source match),
//!    fatal for the affected file with no retry.

use serde::Serialize;

/// One structured validation failure attached to a DLQ record.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub column_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_value: Option<serde_json::Value>,
    pub error_type: String,
    pub error_msg: String,
}

/// A rejected record kept verbatim for error reporting (first five only).
#[derive(Debug, Clone)]
pub struct SampleError {
    pub file_row_number: i64,
    pub record: serde_json::Value,
    pub issues: Vec<ValidationIssue>,
}

/// A grain tuple that appears more than once in a stage table.
#[derive(Debug, Clone)]
pub struct GrainDuplicate {
    /// Grain values keyed by external column alias.
    pub values: Vec<(String, String)>,
    pub count: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("file {source_filename} has already been processed")]
    DuplicateFile { source_filename: String },

    #[error("no header found in file {source_filename}")]
    MissingHeader { source_filename: String },

    #[error("missing required fields in file {source_filename}: {}", missing_fields.join(", "))]
    MissingColumns {
        source_filename: String,
        required_fields: Vec<String>,
        missing_fields: Vec<String>,
    },

    #[error("no data found in file {source_filename}")]
    NoDataInFile { source_filename: String },

    #[error("grain values are not unique in {stage_table} for file {source_filename}")]
    GrainValidation {
        source_filename: String,
        stage_table: String,
        grain_aliases: Vec<String>,
        examples: Vec<GrainDuplicate>,
    },

    #[error("audit checks failed for {stage_table}: {}", failed_audits.join(", "))]
    AuditFailed {
        source_filename: String,
        stage_table: String,
        failed_audits: Vec<String>,
    },

    #[error(
        "validation error rate {error_rate:.2} exceeds threshold {threshold} for file {source_filename}"
    )]
    ValidationThresholdExceeded {
        source_filename: String,
        error_rate: f64,
        threshold: f64,
        records_validated: u64,
        validation_errors: u64,
        samples: Vec<SampleError>,
    },

    #[error("file {filename} matches no declared source")]
    NoSourceMatch { filename: String },

    #[error("file {filename} matches multiple declared sources: {}", tables.join(", "))]
    AmbiguousSource { filename: String, tables: Vec<String> },

    #[error("storage error during {context}: {message}")]
    Storage { context: String, message: String },

    #[error("database error during {context}: {message}")]
    Database { context: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl LoadError {
    pub fn storage(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        LoadError::Storage {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn database(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        LoadError::Database {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Machine-readable error kind, recorded in `file_load_log.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            LoadError::DuplicateFile { .. } => "duplicate_file",
            LoadError::MissingHeader { .. } => "missing_header",
            LoadError::MissingColumns { .. } => "missing_columns",
            LoadError::NoDataInFile { .. } => "no_data_in_file",
            LoadError::GrainValidation { .. } => "grain_validation",
            LoadError::AuditFailed { .. } => "audit_failed",
            LoadError::ValidationThresholdExceeded { .. } => "validation_threshold_exceeded",
            LoadError::NoSourceMatch { .. } => "no_source",
            LoadError::AmbiguousSource { .. } => "ambiguous_source",
            LoadError::Storage { .. } => "storage_error",
            LoadError::Database { .. } => "database_error",
            LoadError::Config(_) => "config_error",
            LoadError::ChannelClosed(_) => "channel_closed",
        }
    }

    /// Human-readable error kind used in email subjects.
    pub fn display_kind(&self) -> &'static str {
        match self {
            LoadError::DuplicateFile { .. } => "Duplicate File Detected",
            LoadError::MissingHeader { .. } => "Missing Header",
            LoadError::MissingColumns { .. } => "Missing Columns",
            LoadError::NoDataInFile { .. } => "No Data In File",
            LoadError::GrainValidation { .. } => "Grain Validation Error",
            LoadError::AuditFailed { .. } => "Audit Failed",
            LoadError::ValidationThresholdExceeded { .. } => "Validation Threshold Exceeded",
            _ => "Pipeline Failure",
        }
    }

    /// Whether this error belongs to the file-notifiable family: per-file,
    /// non-retriable, surfaced to the source's recipients.
    pub fn is_notifiable(&self) -> bool {
        matches!(
            self,
            LoadError::DuplicateFile { .. }
                | LoadError::MissingHeader { .. }
                | LoadError::MissingColumns { .. }
                | LoadError::NoDataInFile { .. }
                | LoadError::GrainValidation { .. }
                | LoadError::AuditFailed { .. }
                | LoadError::ValidationThresholdExceeded { .. }
        )
    }

    /// The kind-specific paragraph of the failure email, for notifiable
    /// errors only.
    pub fn email_body(&self) -> Option<String> {
        match self {
            LoadError::DuplicateFile { source_filename } => Some(format!(
                "The file {source_filename} has already been processed and has been moved to the duplicates directory.\n\n\
                 To reprocess this file:\n\
                 1. Existing records need to be removed from the target table where source_filename = '{source_filename}'\n\
                 2. Move the file from the duplicates directory back to the processing directory"
            )),
            LoadError::MissingHeader { source_filename } => {
                Some(format!("No header found in file: {source_filename}"))
            }
            LoadError::MissingColumns {
                source_filename,
                required_fields,
                missing_fields,
            } => Some(format!(
                "Missing required fields in file: {source_filename}\n\
                 Required fields: {}\n\
                 Missing fields: {}",
                required_fields.join(", "),
                missing_fields.join(", ")
            )),
            LoadError::NoDataInFile { source_filename } => {
                Some(format!("No data found in file: {source_filename}"))
            }
            LoadError::GrainValidation {
                source_filename,
                stage_table,
                grain_aliases,
                examples,
            } => {
                let mut body = format!(
                    "Grain values are not unique for file: {source_filename}\n\
                     Table: {stage_table}\n\
                     Grain columns (file column names): {}",
                    grain_aliases.join(", ")
                );
                if !examples.is_empty() {
                    body.push_str("\n\nSample duplicate grain violations:\n");
                    for example in examples {
                        let rendered: Vec<String> = example
                            .values
                            .iter()
                            .map(|(k, v)| format!("{k}: {v}"))
                            .collect();
                        body.push_str(&format!(
                            "  - {}, duplicate_count: {}\n",
                            rendered.join(", "),
                            example.count
                        ));
                    }
                }
                Some(body)
            }
            LoadError::AuditFailed {
                source_filename,
                stage_table,
                failed_audits,
            } => Some(format!(
                "Audit checks failed for file: {source_filename}\n\
                 Table: {stage_table}\n\
                 Failed audits: {}",
                failed_audits.join(", ")
            )),
            LoadError::ValidationThresholdExceeded {
                source_filename,
                error_rate,
                threshold,
                records_validated,
                validation_errors,
                samples,
            } => {
                let mut body = format!(
                    "Validation error rate ({error_rate:.2}) exceeds threshold ({threshold}) for file: {source_filename}\n\
                     Total Records Processed: {records_validated}\n\
                     Failed Records: {validation_errors}"
                );
                if !samples.is_empty() {
                    body.push_str("\n\nSample validation failure records:");
                    for sample in samples {
                        body.push_str(&format!("\nRow {}:", sample.file_row_number));
                        for issue in &sample.issues {
                            body.push_str(&format!("\n  Column: {}", issue.column_name));
                            if let Some(v) = &issue.column_value {
                                body.push_str(&format!("\n  Value: {v}"));
                            }
                            body.push_str(&format!("\n  Error Type: {}", issue.error_type));
                            body.push_str(&format!("\n  Error Message: {}", issue.error_msg));
                        }
                        body.push_str(&format!("\n  Record: {}", sample.record));
                    }
                }
                Some(body)
            }
            _ => None,
        }
    }
}
