//! Removal of superseded dead-letter rows.
//!
//! After an attempt for a filename completes its stage write, DLQ rows
//! left by earlier attempts of the same file describe records that either
//! loaded cleanly this time or were re-queued; they are deleted in
//! batches. Idempotent and retried.

use tracing::info;

use tabload_core::{retry, LoadError, RetryPolicy};

use crate::pool::Warehouse;

pub struct DlqCleaner<'a> {
    warehouse: &'a Warehouse,
    policy: RetryPolicy,
}

impl<'a> DlqCleaner<'a> {
    pub fn new(warehouse: &'a Warehouse) -> Self {
        Self {
            warehouse,
            policy: RetryPolicy::default(),
        }
    }

    /// Delete DLQ rows for `source_filename` from attempts older than
    /// `log_id`, in batches of `batch_size`. Returns the number removed.
    pub async fn clean(
        &self,
        source_filename: &str,
        log_id: i64,
        batch_size: usize,
    ) -> Result<u64, LoadError> {
        if !self.superseded_rows_exist(source_filename, log_id).await? {
            return Ok(0);
        }

        let sql = self.warehouse.dialect.dlq_delete_batch_sql(batch_size);
        let mut total: u64 = 0;
        loop {
            let deleted = retry(self.policy, "deleting DLQ batch", || async {
                sqlx::query(&sql)
                    .bind(source_filename)
                    .bind(log_id)
                    .execute(&self.warehouse.pool)
                    .await
                    .map(|r| r.rows_affected())
                    .map_err(|e| LoadError::database("deleting superseded DLQ rows", e))
            })
            .await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
        }
        info!(log_id, file = source_filename, deleted = total, "cleaned superseded DLQ rows");
        Ok(total)
    }

    async fn superseded_rows_exist(
        &self,
        source_filename: &str,
        log_id: i64,
    ) -> Result<bool, LoadError> {
        let dialect = self.warehouse.dialect;
        let sql = format!(
            "SELECT id FROM file_load_dlq WHERE source_filename = {} AND file_load_log_id < {} LIMIT 1",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        retry(self.policy, "checking for superseded DLQ rows", || async {
            sqlx::query(&sql)
                .bind(source_filename)
                .bind(log_id)
                .fetch_optional(&self.warehouse.pool)
                .await
                .map(|row| row.is_some())
                .map_err(|e| LoadError::database("checking for superseded DLQ rows", e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabload_core::SourceRegistry;

    async fn warehouse_with_dlq_rows(dir: &std::path::Path) -> Warehouse {
        let url = format!("sqlite://{}?mode=rwc", dir.join("w.db").display());
        let warehouse = Warehouse::connect(&url).await.unwrap();
        let registry =
            SourceRegistry::register(vec![crate::pool::tests::test_source()]).unwrap();
        warehouse.create_tables(&registry).await.unwrap();
        for (file, log_id, row) in [
            ("sales_2024.csv", 1i64, 2i64),
            ("sales_2024.csv", 1, 3),
            ("sales_2024.csv", 2, 4),
            ("other.csv", 1, 2),
        ] {
            sqlx::query(
                "INSERT INTO file_load_log (source_filename, started_at) VALUES (?, ?)",
            )
            .bind(file)
            .bind("2024-01-01T00:00:00Z")
            .execute(&warehouse.pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO file_load_dlq (source_filename, file_row_number, file_record_data, \
                 validation_errors, file_load_log_id, target_table_name, failed_at) \
                 VALUES (?, ?, '{}', '[]', ?, 'transactions', '2024-01-01T00:00:00Z')",
            )
            .bind(file)
            .bind(row)
            .bind(log_id)
            .execute(&warehouse.pool)
            .await
            .unwrap();
        }
        warehouse
    }

    #[tokio::test]
    async fn removes_only_older_rows_for_the_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let warehouse = warehouse_with_dlq_rows(tmp.path()).await;
        let cleaner = DlqCleaner::new(&warehouse);

        // Batch size of 1 forces the delete loop to iterate.
        let deleted = cleaner.clean("sales_2024.csv", 2, 1).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = sqlx::query("SELECT source_filename, file_load_log_id FROM file_load_dlq")
            .fetch_all(&warehouse.pool)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);

        // Idempotent second run.
        assert_eq!(cleaner.clean("sales_2024.csv", 2, 1).await.unwrap(), 0);
    }
}
