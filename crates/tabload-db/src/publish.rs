//! Merge the stage table into the target with change detection.
//!
//! Expected insert and update counts are computed before the merge so the
//! lineage row can carry them; the merge itself is one dialect-specific
//! statement, atomic per the engine's transactional guarantee.

use chrono::Utc;
use tracing::info;

use tabload_core::{retry, DeclaredSource, LoadError, RetryPolicy};

use crate::pool::Warehouse;
use crate::row::int_at;

pub struct Publisher<'a> {
    warehouse: &'a Warehouse,
    source: &'a DeclaredSource,
    stage_table: &'a str,
    log_id: i64,
    policy: RetryPolicy,
}

impl<'a> Publisher<'a> {
    pub fn new(
        warehouse: &'a Warehouse,
        source: &'a DeclaredSource,
        stage_table: &'a str,
        log_id: i64,
    ) -> Self {
        Self {
            warehouse,
            source,
            stage_table,
            log_id,
            policy: RetryPolicy::default(),
        }
    }

    /// Merge and return `(inserts, updates)`.
    pub async fn publish(&self) -> Result<(i64, i64), LoadError> {
        let target = &self.source.table_name;
        let grain_join = self.grain_join();

        let inserts = self
            .count(&format!(
                "SELECT COUNT(*) FROM {stage} AS stage WHERE NOT EXISTS \
                 (SELECT 1 FROM {target} AS target WHERE {grain_join})",
                stage = self.stage_table,
            ))
            .await?;
        let updates = self
            .count(&format!(
                "SELECT COUNT(*) FROM {stage} AS stage WHERE EXISTS \
                 (SELECT 1 FROM {target} AS target WHERE {grain_join} \
                 AND target.etl_row_hash <> stage.etl_row_hash)",
                stage = self.stage_table,
            ))
            .await?;

        let merge = self.warehouse.dialect.merge_sql(
            target,
            self.stage_table,
            &self.source.schema,
            &self.source.grain,
            &Utc::now(),
        );
        retry(self.policy, "publish merge", || async {
            self.warehouse.execute(&merge, "merging stage into target").await
        })
        .await?;

        info!(
            log_id = self.log_id,
            target, inserts, updates, "published stage into target"
        );
        Ok((inserts, updates))
    }

    fn grain_join(&self) -> String {
        self.source
            .grain
            .iter()
            .map(|g| format!("target.{g} = stage.{g}"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    async fn count(&self, sql: &str) -> Result<i64, LoadError> {
        retry(self.policy, "publish count", || async {
            let row = sqlx::query(sql)
                .fetch_one(&self.warehouse.pool)
                .await
                .map_err(|e| LoadError::database("counting expected merge effects", e))?;
            int_at(&row, 0, "counting expected merge effects")
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;
    use tabload_core::{row_fingerprint, SourceRegistry, Value};

    struct Fixture {
        warehouse: Warehouse,
        source: tabload_core::DeclaredSource,
        stage: String,
    }

    async fn fixture(dir: &std::path::Path) -> Fixture {
        let url = format!("sqlite://{}?mode=rwc", dir.join("w.db").display());
        let warehouse = Warehouse::connect(&url).await.unwrap();
        let source = crate::pool::tests::test_source();
        let registry = SourceRegistry::register(vec![source.clone()]).unwrap();
        warehouse.create_tables(&registry).await.unwrap();
        let stage = crate::stage::create_stage_table(&warehouse, &source, "sales_2024.csv")
            .await
            .unwrap();
        Fixture {
            warehouse,
            source,
            stage,
        }
    }

    async fn stage_row(f: &Fixture, id: &str, qty: i64, filename: &str, log_id: i64) {
        let values = vec![Value::Str(id.into()), Value::Int(qty)];
        let hash = row_fingerprint(&f.source.schema, &values);
        sqlx::query(&format!(
            "INSERT INTO {} (transaction_id, quantity, etl_row_hash, source_filename, file_load_log_id) VALUES (?, ?, ?, ?, ?)",
            f.stage
        ))
        .bind(id)
        .bind(qty)
        .bind(hash.to_vec())
        .bind(filename)
        .bind(log_id)
        .execute(&f.warehouse.pool)
        .await
        .unwrap();
    }

    async fn clear_stage(f: &Fixture) {
        sqlx::query(&format!("DELETE FROM {}", f.stage))
            .execute(&f.warehouse.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_publish_inserts_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        stage_row(&f, "T1", 2, "sales_2024.csv", 1).await;
        stage_row(&f, "T2", 5, "sales_2024.csv", 1).await;

        let publisher = Publisher::new(&f.warehouse, &f.source, &f.stage, 1);
        assert_eq!(publisher.publish().await.unwrap(), (2, 0));

        let row = sqlx::query("SELECT COUNT(*) FROM transactions WHERE etl_updated_at IS NULL")
            .fetch_one(&f.warehouse.pool)
            .await
            .unwrap();
        assert_eq!(int_at(&row, 0, "t").unwrap(), 2);
    }

    #[tokio::test]
    async fn changed_rows_update_and_unchanged_rows_are_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fixture(tmp.path()).await;
        stage_row(&f, "T1", 2, "sales_2024.csv", 1).await;
        stage_row(&f, "T2", 5, "sales_2024.csv", 1).await;
        Publisher::new(&f.warehouse, &f.source, &f.stage, 1)
            .publish()
            .await
            .unwrap();

        // Second file: T1 changes quantity, T2 is identical.
        clear_stage(&f).await;
        stage_row(&f, "T1", 3, "sales_2025.csv", 2).await;
        stage_row(&f, "T2", 5, "sales_2025.csv", 2).await;
        let publisher = Publisher::new(&f.warehouse, &f.source, &f.stage, 2);
        assert_eq!(publisher.publish().await.unwrap(), (0, 1));

        let changed = sqlx::query(
            "SELECT quantity, source_filename, etl_updated_at FROM transactions WHERE transaction_id = 'T1'",
        )
        .fetch_one(&f.warehouse.pool)
        .await
        .unwrap();
        assert_eq!(int_at(&changed, 0, "t").unwrap(), 3);
        let filename: String = changed.get(1);
        assert_eq!(filename, "sales_2025.csv");
        let updated_at: Option<String> = changed.get(2);
        assert!(updated_at.is_some());

        let unchanged = sqlx::query(
            "SELECT etl_updated_at, source_filename FROM transactions WHERE transaction_id = 'T2'",
        )
        .fetch_one(&f.warehouse.pool)
        .await
        .unwrap();
        let updated_at: Option<String> = unchanged.get(0);
        assert!(updated_at.is_none());
        let filename: String = unchanged.get(1);
        assert_eq!(filename, "sales_2024.csv");
    }
}
