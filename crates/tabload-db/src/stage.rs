//! Per-file stage tables and the buffered stage writer.
//!
//! Stage tables are deterministic per filename, so a retry reuses (and
//! first drops) the same table instead of colliding with it, and a failed
//! attempt leaves its table behind for inspection.

use sqlx::{Any, QueryBuilder};
use tracing::{debug, info};

use tabload_core::{
    AcceptedRecord, DeclaredSource, DlqRecord, LoadError, Validated, ValidatedBatchRx, Value,
};

use crate::dialect::Dialect;
use crate::pool::Warehouse;

/// Sanitize a filename stem into an identifier: non-alphanumerics become
/// `_`, and a leading non-letter gets a `t_` prefix.
pub fn sanitize_table_name(filename: &str) -> String {
    let stem = match filename.rfind('.') {
        Some(dot) if dot > 0 => &filename[..dot],
        _ => filename,
    };
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        name = format!("t_{name}");
    }
    name
}

/// Stage table name for a source filename.
pub fn stage_table_name(filename: &str) -> String {
    format!("stage_{}", sanitize_table_name(filename))
}

/// Create the stage table for this attempt, dropping any remnant of a
/// previous attempt first.
pub async fn create_stage_table(
    warehouse: &Warehouse,
    source: &DeclaredSource,
    filename: &str,
) -> Result<String, LoadError> {
    let name = stage_table_name(filename);
    warehouse
        .execute(&format!("DROP TABLE IF EXISTS {name}"), "dropping old stage table")
        .await?;
    warehouse
        .execute(
            &warehouse.dialect.stage_ddl(&name, &source.schema),
            "creating stage table",
        )
        .await?;
    info!(stage_table = name, file = filename, "created stage table");
    Ok(name)
}

pub async fn drop_stage_table(warehouse: &Warehouse, stage_table: &str) -> Result<(), LoadError> {
    warehouse
        .execute(
            &format!("DROP TABLE IF EXISTS {stage_table}"),
            "dropping stage table",
        )
        .await
}

/// Buffered writer splitting the validated stream: accepted rows into the
/// stage table, rejected rows into the DLQ, both flushed at the batch
/// boundary. A database error on either stream aborts the attempt.
pub struct StageWriter {
    warehouse: Warehouse,
    stage_table: String,
    columns: Vec<String>,
    batch_size: usize,
    accepted: Vec<AcceptedRecord>,
    rejected: Vec<DlqRecord>,
    rows_written_to_stage: u64,
}

impl StageWriter {
    pub fn new(
        warehouse: Warehouse,
        source: &DeclaredSource,
        stage_table: String,
        batch_size: usize,
    ) -> Self {
        let columns: Vec<String> = source
            .schema
            .field_names()
            .map(str::to_string)
            .chain(
                ["etl_row_hash", "source_filename", "file_load_log_id"]
                    .into_iter()
                    .map(str::to_string),
            )
            .collect();
        Self {
            warehouse,
            stage_table,
            columns,
            batch_size,
            accepted: Vec::new(),
            rejected: Vec::new(),
            rows_written_to_stage: 0,
        }
    }

    /// Drain the validator's output. Returns the accepted-row count.
    pub async fn write(&mut self, mut rx: ValidatedBatchRx) -> Result<u64, LoadError> {
        while let Some(batch) = rx.recv().await {
            for item in batch {
                match item {
                    Validated::Accepted(record) => {
                        self.accepted.push(record);
                        if self.accepted.len() == self.batch_size {
                            self.flush_accepted().await?;
                        }
                    }
                    Validated::Rejected(record) => {
                        self.rejected.push(record);
                        if self.rejected.len() == self.batch_size {
                            self.flush_rejected().await?;
                        }
                    }
                }
            }
        }
        self.flush_accepted().await?;
        self.flush_rejected().await?;
        Ok(self.rows_written_to_stage)
    }

    /// Rows per statement under the dialect's bind-parameter budget.
    fn rows_per_statement(&self, column_count: usize) -> usize {
        let by_params = self.warehouse.dialect.max_bind_params() / column_count.max(1);
        by_params.clamp(1, self.batch_size)
    }

    async fn flush_accepted(&mut self) -> Result<(), LoadError> {
        if self.accepted.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.accepted);
        let dialect = self.warehouse.dialect;
        let prefix = format!(
            "INSERT INTO {} ({}) ",
            self.stage_table,
            self.columns.join(", ")
        );
        for chunk in rows.chunks(self.rows_per_statement(self.columns.len())) {
            let mut builder: QueryBuilder<Any> = QueryBuilder::new(prefix.as_str());
            builder.push_values(chunk, |mut b, record| {
                for value in &record.values {
                    bind_value(&mut b, dialect, value);
                }
                b.push_bind(record.row_hash.to_vec());
                b.push_bind(record.source_filename.clone());
                b.push_bind(record.file_load_log_id);
            });
            builder
                .build()
                .execute(&self.warehouse.pool)
                .await
                .map_err(|e| LoadError::database("inserting into stage table", e))?;
        }
        self.rows_written_to_stage += rows.len() as u64;
        debug!(
            stage_table = self.stage_table,
            rows = rows.len(),
            "flushed accepted rows"
        );
        Ok(())
    }

    async fn flush_rejected(&mut self) -> Result<(), LoadError> {
        if self.rejected.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rejected);
        let dialect = self.warehouse.dialect;

        // Serialise the JSON payloads up front so binding can't fail.
        let mut bound: Vec<(String, i64, String, String, i64, String, String)> =
            Vec::with_capacity(rows.len());
        for record in &rows {
            let data = serde_json::to_string(&record.file_record_data)
                .map_err(|e| LoadError::database("serialising DLQ record", e))?;
            let issues = serde_json::to_string(&record.validation_errors)
                .map_err(|e| LoadError::database("serialising DLQ record", e))?;
            bound.push((
                record.source_filename.clone(),
                record.file_row_number,
                data,
                issues,
                record.file_load_log_id,
                record.target_table_name.clone(),
                dialect.render_datetime(&record.failed_at),
            ));
        }

        let prefix = "INSERT INTO file_load_dlq (source_filename, file_row_number, \
                      file_record_data, validation_errors, file_load_log_id, \
                      target_table_name, failed_at) ";
        for chunk in bound.chunks(self.rows_per_statement(7)) {
            let mut builder: QueryBuilder<Any> = QueryBuilder::new(prefix);
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.0.clone());
                b.push_bind(row.1);
                b.push_bind(row.2.clone());
                b.push_bind(row.3.clone());
                b.push_bind(row.4);
                b.push_bind(row.5.clone());
                b.push_bind(row.6.clone());
            });
            builder
                .build()
                .execute(&self.warehouse.pool)
                .await
                .map_err(|e| LoadError::database("inserting into DLQ table", e))?;
        }
        debug!(rows = rows.len(), "flushed rejected rows to DLQ");
        Ok(())
    }
}

fn bind_value(
    b: &mut sqlx::query_builder::Separated<'_, '_, Any, &'static str>,
    dialect: Dialect,
    value: &Value,
) {
    match value {
        Value::Null => {
            b.push_bind(Option::<String>::None);
        }
        Value::Str(s) => {
            b.push_bind(s.clone());
        }
        Value::Int(i) => {
            b.push_bind(*i);
        }
        Value::Float(f) => {
            b.push_bind(*f);
        }
        Value::Bool(v) => {
            b.push_bind(*v);
        }
        Value::Decimal(d) => {
            b.push_bind(d.to_string());
        }
        Value::Date(d) => {
            b.push_bind(d.format("%Y-%m-%d").to_string());
        }
        Value::DateTime(dt) => {
            b.push_bind(dialect.render_datetime(dt));
        }
    }
}
