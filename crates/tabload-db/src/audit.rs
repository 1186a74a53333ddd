//! Stage-table auditing: grain uniqueness, then the source's declared
//! audit query. Both run in their own read transactions and are retried
//! on transient errors.

use sqlx::{Column, Row};
use tracing::{info, warn};

use tabload_core::{retry, DeclaredSource, GrainDuplicate, LoadError, RetryPolicy};

use crate::pool::Warehouse;
use crate::row::{int_at, text_at};

const DUPLICATE_EXAMPLE_LIMIT: usize = 5;

pub struct Auditor<'a> {
    warehouse: &'a Warehouse,
    source: &'a DeclaredSource,
    stage_table: &'a str,
    source_filename: &'a str,
    log_id: i64,
    policy: RetryPolicy,
}

impl<'a> Auditor<'a> {
    pub fn new(
        warehouse: &'a Warehouse,
        source: &'a DeclaredSource,
        stage_table: &'a str,
        source_filename: &'a str,
        log_id: i64,
    ) -> Self {
        Self {
            warehouse,
            source,
            stage_table,
            source_filename,
            log_id,
            policy: RetryPolicy::default(),
        }
    }

    /// Fail with exemplars unless the grain is distinct across the stage.
    pub async fn audit_grain(&self) -> Result<(), LoadError> {
        info!(log_id = self.log_id, stage_table = self.stage_table, "auditing grain");
        let sql = self
            .warehouse
            .dialect
            .grain_check_sql(self.stage_table, &self.source.grain);
        let unique = retry(self.policy, "grain audit", || async {
            let row = sqlx::query(&sql)
                .fetch_one(&self.warehouse.pool)
                .await
                .map_err(|e| LoadError::database("checking grain uniqueness", e))?;
            int_at(&row, 0, "checking grain uniqueness")
        })
        .await?;

        if unique != 0 {
            return Ok(());
        }

        let examples = self.duplicate_examples().await?;
        let grain_aliases: Vec<String> = self
            .source
            .grain
            .iter()
            .map(|g| self.source.schema.alias_for(g).to_string())
            .collect();
        Err(LoadError::GrainValidation {
            source_filename: self.source_filename.to_string(),
            stage_table: self.stage_table.to_string(),
            grain_aliases,
            examples,
        })
    }

    /// Run the declared audit query, if any. Every zero-valued column is a
    /// failed audit.
    pub async fn audit_declared(&self) -> Result<(), LoadError> {
        let Some(template) = &self.source.audit_query else {
            warn!(
                log_id = self.log_id,
                table = self.source.table_name,
                "no audit query declared for source"
            );
            return Ok(());
        };
        info!(log_id = self.log_id, stage_table = self.stage_table, "running declared audits");
        let sql = template.replace("{table}", self.stage_table).trim().to_string();

        let failed = retry(self.policy, "declared audit", || {
            let sql = sql.clone();
            async move {
                let row = sqlx::query(&sql)
                    .fetch_one(&self.warehouse.pool)
                    .await
                    .map_err(|e| LoadError::database("running audit query", e))?;
                let mut failed: Vec<String> = Vec::new();
                for (index, column) in row.columns().iter().enumerate() {
                    if int_at(&row, index, "reading audit result")? == 0 {
                        failed.push(column.name().to_string());
                    }
                }
                Ok(failed)
            }
        })
        .await?;

        if failed.is_empty() {
            Ok(())
        } else {
            Err(LoadError::AuditFailed {
                source_filename: self.source_filename.to_string(),
                stage_table: self.stage_table.to_string(),
                failed_audits: failed,
            })
        }
    }

    async fn duplicate_examples(&self) -> Result<Vec<GrainDuplicate>, LoadError> {
        let sql = self.warehouse.dialect.duplicate_examples_sql(
            self.stage_table,
            &self.source.grain,
            DUPLICATE_EXAMPLE_LIMIT,
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.warehouse.pool)
            .await
            .map_err(|e| LoadError::database("fetching duplicate grain examples", e))?;
        let mut examples = Vec::with_capacity(rows.len());
        for row in rows {
            let values: Vec<(String, String)> = self
                .source
                .grain
                .iter()
                .enumerate()
                .map(|(index, g)| {
                    (
                        self.source.schema.alias_for(g).to_string(),
                        text_at(&row, index),
                    )
                })
                .collect();
            let count = int_at(&row, self.source.grain.len(), "reading duplicate count")?;
            examples.push(GrainDuplicate { values, count });
        }
        Ok(examples)
    }
}
