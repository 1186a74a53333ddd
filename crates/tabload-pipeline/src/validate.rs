//! Record validation against the declared schema.
//!
//! Raw field maps are renamed to schema field names (case-insensitive,
//! alias-aware), coerced to typed values, and split into accepted records
//! (with derived columns attached) and DLQ-shaped rejects. Batch
//! boundaries and in-batch order are preserved.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};

use tabload_core::{
    row_fingerprint_ordered, AcceptedRecord, DeclaredSource, DlqRecord, LoadError, RawBatchRx,
    RawRecord, SampleError, Validated, ValidatedBatchTx, ValidationIssue, Value,
};

const SAMPLE_ERROR_LIMIT: usize = 5;

/// Counters reported at the validate phase boundary.
#[derive(Debug, Clone, Copy)]
pub struct ValidationReport {
    pub records_validated: u64,
    pub validation_errors: u64,
}

pub struct Validator {
    source: Arc<DeclaredSource>,
    source_filename: String,
    log_id: i64,
    starting_row_number: i64,
    /// lowercase file column name -> schema field name
    field_mapping: HashMap<String, String>,
    hash_order: Vec<usize>,
}

impl Validator {
    pub fn new(
        source: Arc<DeclaredSource>,
        source_filename: String,
        log_id: i64,
        starting_row_number: i64,
    ) -> Self {
        let field_mapping = source
            .schema
            .fields
            .iter()
            .map(|f| (f.file_name().to_lowercase(), f.name.clone()))
            .collect();
        let hash_order = source.schema.hash_order();
        Self {
            source,
            source_filename,
            log_id,
            starting_row_number,
            field_mapping,
            hash_order,
        }
    }

    /// Consume raw batches, emit validated batches, and enforce the
    /// source's error threshold once the stream drains.
    pub async fn run(
        &self,
        mut rx: RawBatchRx,
        tx: ValidatedBatchTx,
    ) -> Result<ValidationReport, LoadError> {
        let mut records_validated: u64 = 0;
        let mut validation_errors: u64 = 0;
        let mut samples: Vec<SampleError> = Vec::new();

        while let Some(batch) = rx.recv().await {
            let mut out = Vec::with_capacity(batch.len());
            for raw in batch {
                records_validated += 1;
                let renamed = self.rename_and_filter(raw);
                match self.coerce(&renamed) {
                    Ok((values, row_hash)) => out.push(Validated::Accepted(AcceptedRecord {
                        values,
                        row_hash,
                        source_filename: self.source_filename.clone(),
                        file_load_log_id: self.log_id,
                    })),
                    Err(issues) => {
                        validation_errors += 1;
                        let file_row_number =
                            self.starting_row_number + records_validated as i64 - 1;
                        if samples.len() < SAMPLE_ERROR_LIMIT {
                            samples.push(SampleError {
                                file_row_number,
                                record: object_from(&renamed),
                                issues: issues.iter().map(|(_, issue)| issue.clone()).collect(),
                            });
                        }
                        out.push(Validated::Rejected(self.dlq_record(
                            &renamed,
                            file_row_number,
                            issues,
                        )));
                    }
                }
            }
            debug!(log_id = self.log_id, rows = out.len(), "validated batch");
            if tx.send(out).await.is_err() {
                return Err(LoadError::ChannelClosed("validator output"));
            }
        }

        if records_validated > 0 && validation_errors > 0 {
            let error_rate = validation_errors as f64 / records_validated as f64;
            if error_rate > self.source.validation_error_threshold {
                error!(
                    log_id = self.log_id,
                    error_rate,
                    threshold = self.source.validation_error_threshold,
                    "validation threshold exceeded"
                );
                return Err(LoadError::ValidationThresholdExceeded {
                    source_filename: self.source_filename.clone(),
                    error_rate,
                    threshold: self.source.validation_error_threshold,
                    records_validated,
                    validation_errors,
                    samples,
                });
            }
        }
        Ok(ValidationReport {
            records_validated,
            validation_errors,
        })
    }

    /// Lowercase-match raw keys against the field mapping, dropping
    /// anything the schema does not declare.
    fn rename_and_filter(&self, raw: RawRecord) -> HashMap<String, serde_json::Value> {
        raw.into_iter()
            .filter_map(|(key, value)| {
                self.field_mapping
                    .get(&key.to_lowercase())
                    .map(|name| (name.clone(), value))
            })
            .collect()
    }

    /// Coerce a renamed record. On success returns the typed values in
    /// schema order plus the row fingerprint; on failure, the issues per
    /// failing schema field.
    #[allow(clippy::type_complexity)]
    fn coerce(
        &self,
        renamed: &HashMap<String, serde_json::Value>,
    ) -> Result<(Vec<Value>, [u8; 16]), Vec<(String, ValidationIssue)>> {
        let mut values = Vec::with_capacity(self.source.schema.len());
        let mut issues: Vec<(String, ValidationIssue)> = Vec::new();
        for field in &self.source.schema.fields {
            let raw = renamed.get(&field.name);
            match raw {
                None | Some(serde_json::Value::Null) => {
                    if field.optional {
                        values.push(Value::Null);
                    } else {
                        issues.push((
                            field.name.clone(),
                            ValidationIssue {
                                column_name: field.file_name().to_string(),
                                column_value: None,
                                error_type: "missing".into(),
                                error_msg: "field required".into(),
                            },
                        ));
                    }
                }
                Some(raw) => match field.field_type.coerce(raw) {
                    Ok(value) => values.push(value),
                    Err(coercion) => issues.push((
                        field.name.clone(),
                        ValidationIssue {
                            column_name: field.file_name().to_string(),
                            column_value: Some(raw.clone()),
                            error_type: coercion.error_type.into(),
                            error_msg: coercion.message,
                        },
                    )),
                },
            }
        }
        if issues.is_empty() {
            let row_hash = row_fingerprint_ordered(&values, &self.hash_order);
            Ok((values, row_hash))
        } else {
            Err(issues)
        }
    }

    /// Project the failed record to failing fields plus grain fields,
    /// keyed by external alias.
    fn dlq_record(
        &self,
        renamed: &HashMap<String, serde_json::Value>,
        file_row_number: i64,
        issues: Vec<(String, ValidationIssue)>,
    ) -> DlqRecord {
        let mut keep: BTreeSet<&str> = issues.iter().map(|(name, _)| name.as_str()).collect();
        keep.extend(self.source.grain.iter().map(String::as_str));

        let mut data = serde_json::Map::new();
        for name in keep {
            let alias = self.source.schema.alias_for(name).to_string();
            let value = renamed.get(name).cloned().unwrap_or(serde_json::Value::Null);
            data.insert(alias, value);
        }
        DlqRecord {
            source_filename: self.source_filename.clone(),
            file_row_number,
            file_record_data: serde_json::Value::Object(data),
            validation_errors: issues.into_iter().map(|(_, issue)| issue).collect(),
            file_load_log_id: self.log_id,
            target_table_name: self.source.table_name.clone(),
            failed_at: Utc::now(),
        }
    }
}

fn object_from(renamed: &HashMap<String, serde_json::Value>) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in renamed {
        map.insert(key.clone(), value.clone());
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabload_core::{FieldDef, FieldType, RecordSchema, SourceFormat, STAGE_CHANNEL_CAPACITY};

    fn source(threshold: f64) -> Arc<DeclaredSource> {
        Arc::new(DeclaredSource {
            file_pattern: "sales_*.csv".into(),
            format: SourceFormat::Csv {
                delimiter: ',',
                skip_rows: 0,
            },
            schema: RecordSchema::new(vec![
                FieldDef {
                    name: "transaction_id".into(),
                    alias: Some("TransactionId".into()),
                    field_type: FieldType::String { max_length: Some(20) },
                    optional: false,
                },
                FieldDef {
                    name: "quantity".into(),
                    alias: None,
                    field_type: FieldType::Int,
                    optional: false,
                },
            ]),
            table_name: "transactions".into(),
            grain: vec!["transaction_id".into()],
            audit_query: None,
            validation_error_threshold: threshold,
            notification_recipients: None,
        })
    }

    async fn run_validator(
        threshold: f64,
        batches: Vec<Vec<RawRecord>>,
    ) -> (Result<ValidationReport, LoadError>, Vec<Vec<Validated>>) {
        let validator = Validator::new(source(threshold), "sales_2024.csv".into(), 7, 2);
        let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (val_tx, mut val_rx) = tokio::sync::mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let feeder = tokio::spawn(async move {
            for batch in batches {
                if raw_tx.send(batch).await.is_err() {
                    break;
                }
            }
        });
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(batch) = val_rx.recv().await {
                out.push(batch);
            }
            out
        });
        let report = validator.run(raw_rx, val_tx).await;
        feeder.await.unwrap();
        (report, collector.await.unwrap())
    }

    fn record(id: &str, qty: serde_json::Value) -> RawRecord {
        RawRecord::from_iter([
            ("TransactionId".to_string(), json!(id)),
            ("quantity".to_string(), qty),
            ("ignored_extra".to_string(), json!("x")),
        ])
    }

    #[tokio::test]
    async fn accepts_and_derives_columns() {
        let (report, batches) =
            run_validator(0.0, vec![vec![record("T1", json!("3"))]]).await;
        let report = report.unwrap();
        assert_eq!(report.records_validated, 1);
        assert_eq!(report.validation_errors, 0);
        match &batches[0][0] {
            Validated::Accepted(rec) => {
                assert_eq!(rec.values, vec![Value::Str("T1".into()), Value::Int(3)]);
                assert_eq!(rec.source_filename, "sales_2024.csv");
                assert_eq!(rec.file_load_log_id, 7);
                assert_ne!(rec.row_hash, [0u8; 16]);
            }
            other => panic!("expected accepted record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_carry_row_numbers_and_aliased_projection() {
        // Rows start at 2 (CSV header); the second record is the failure.
        let (report, batches) = run_validator(
            1.0,
            vec![vec![record("T1", json!("3")), record("T2", json!("oops"))]],
        )
        .await;
        assert_eq!(report.unwrap().validation_errors, 1);
        match &batches[0][1] {
            Validated::Rejected(dlq) => {
                assert_eq!(dlq.file_row_number, 3);
                assert_eq!(dlq.target_table_name, "transactions");
                let data = dlq.file_record_data.as_object().unwrap();
                assert_eq!(data.get("TransactionId"), Some(&json!("T2")));
                assert_eq!(data.get("quantity"), Some(&json!("oops")));
                assert_eq!(dlq.validation_errors[0].error_type, "int_parsing");
                assert_eq!(dlq.validation_errors[0].column_name, "quantity");
            }
            other => panic!("expected rejected record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn threshold_is_a_strict_bound() {
        // 1 failure out of 2 equals a threshold of 0.5: passes.
        let rows = vec![vec![record("T1", json!(1)), record("T2", json!("bad"))]];
        let (report, _) = run_validator(0.5, rows.clone()).await;
        assert!(report.is_ok());

        // The same file against a threshold of 0.0 fails with samples.
        let (report, _) = run_validator(0.0, rows).await;
        match report.unwrap_err() {
            LoadError::ValidationThresholdExceeded {
                records_validated,
                validation_errors,
                samples,
                ..
            } => {
                assert_eq!(records_validated, 2);
                assert_eq!(validation_errors, 1);
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].file_row_number, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_required_field_is_rejected_and_optional_is_null() {
        let mut optional_source = (*source(1.0)).clone();
        optional_source.schema.fields[1].optional = true;
        let validator = Validator::new(
            Arc::new(optional_source),
            "sales_2024.csv".into(),
            1,
            2,
        );
        let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (val_tx, mut val_rx) = tokio::sync::mpsc::channel(STAGE_CHANNEL_CAPACITY);
        raw_tx
            .send(vec![RawRecord::from_iter([(
                "TransactionId".to_string(),
                json!("T1"),
            )])])
            .await
            .unwrap();
        drop(raw_tx);
        validator.run(raw_rx, val_tx).await.unwrap();
        let batch = val_rx.recv().await.unwrap();
        match &batch[0] {
            Validated::Accepted(rec) => {
                assert_eq!(rec.values[1], Value::Null);
            }
            other => panic!("expected accepted record, got {other:?}"),
        }
    }
}
