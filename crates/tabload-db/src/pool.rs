//! Warehouse connection pool and startup DDL.

use std::time::Duration;

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::AnyPool;
use tracing::{debug, info, warn};

use tabload_core::{LoadError, SourceRegistry};

use crate::dialect::Dialect;
use crate::row::int_at;

/// Shared handle on the warehouse: the pool and its dialect. All per-file
/// work borrows connections from here per statement, never across phases.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pub pool: AnyPool,
    pub dialect: Dialect,
}

impl Warehouse {
    /// Connect to the warehouse, inferring the dialect from the URL.
    pub async fn connect(database_url: &str) -> Result<Self, LoadError> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_url(database_url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| LoadError::database("connecting to warehouse", e))?;
        info!(dialect = dialect.name(), "connected to warehouse");
        Ok(Self { pool, dialect })
    }

    pub async fn execute(&self, sql: &str, context: &str) -> Result<(), LoadError> {
        debug!(context, "executing statement");
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| LoadError::database(context.to_string(), e))
    }

    /// Create the target tables, the lineage log, and the DLQ if absent.
    pub async fn create_tables(&self, registry: &SourceRegistry) -> Result<(), LoadError> {
        for source in registry.sources() {
            if source.grain.len() > 3 {
                warn!(
                    table = source.table_name,
                    grain_columns = source.grain.len(),
                    "wide grain makes an inefficient primary key"
                );
            }
            let ddl = self
                .dialect
                .target_ddl(&source.table_name, &source.schema, &source.grain);
            self.execute(&ddl, "creating target table").await?;
            self.create_index(
                &format!("idx_{}_source_filename", source.table_name),
                &source.table_name,
                "source_filename",
            )
            .await?;
        }

        self.execute(&self.file_load_log_ddl(), "creating file_load_log")
            .await?;
        self.create_index(
            "idx_file_load_log_source_filename",
            "file_load_log",
            "source_filename, id",
        )
        .await?;

        self.execute(&self.file_load_dlq_ddl(), "creating file_load_dlq")
            .await?;
        self.create_index("idx_dlq_file_load_log_id", "file_load_dlq", "file_load_log_id")
            .await?;
        self.create_index(
            "idx_dlq_source_filename",
            "file_load_dlq",
            "source_filename, id",
        )
        .await?;
        Ok(())
    }

    /// `EXISTS` probe on the target table: filename is the sole duplicate
    /// key, no content hashing.
    pub async fn is_duplicate_file(
        &self,
        target_table: &str,
        source_filename: &str,
    ) -> Result<bool, LoadError> {
        let sql = format!(
            "SELECT CASE WHEN EXISTS (SELECT 1 FROM {target_table} WHERE source_filename = {}) THEN 1 ELSE 0 END",
            self.dialect.placeholder(1)
        );
        let row: AnyRow = sqlx::query(&sql)
            .bind(source_filename)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LoadError::database("checking for duplicate file", e))?;
        Ok(int_at(&row, 0, "checking for duplicate file")? != 0)
    }

    /// MySQL has no `CREATE INDEX IF NOT EXISTS`; a duplicate-name error
    /// there means the index already exists and is not a failure.
    async fn create_index(
        &self,
        index_name: &str,
        table: &str,
        columns: &str,
    ) -> Result<(), LoadError> {
        let sql = match self.dialect {
            Dialect::MySql => format!("CREATE INDEX {index_name} ON {table} ({columns})"),
            _ => format!("CREATE INDEX IF NOT EXISTS {index_name} ON {table} ({columns})"),
        };
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("1061") => Ok(()),
            Err(e) => Err(LoadError::database("creating index", e)),
        }
    }

    fn file_load_log_ddl(&self) -> String {
        let dt = self.dialect.datetime_type();
        let boolean = match self.dialect {
            Dialect::Postgres => "BOOLEAN",
            Dialect::MySql => "TINYINT(1)",
            Dialect::Sqlite => "INTEGER",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS file_load_log (\n    \
             id {identity},\n    \
             source_filename VARCHAR(255) NOT NULL,\n    \
             started_at {dt} NOT NULL,\n    \
             duplicate_skipped {boolean} NULL,\n    \
             archive_copy_started_at {dt} NULL,\n    \
             archive_copy_ended_at {dt} NULL,\n    \
             archive_copy_success {boolean} NULL,\n    \
             read_started_at {dt} NULL,\n    \
             read_ended_at {dt} NULL,\n    \
             read_success {boolean} NULL,\n    \
             records_read BIGINT NULL,\n    \
             validate_started_at {dt} NULL,\n    \
             validate_ended_at {dt} NULL,\n    \
             validate_success {boolean} NULL,\n    \
             validation_errors BIGINT NULL,\n    \
             write_started_at {dt} NULL,\n    \
             write_ended_at {dt} NULL,\n    \
             write_success {boolean} NULL,\n    \
             records_written_to_stage BIGINT NULL,\n    \
             audit_started_at {dt} NULL,\n    \
             audit_ended_at {dt} NULL,\n    \
             audit_success {boolean} NULL,\n    \
             publish_started_at {dt} NULL,\n    \
             publish_ended_at {dt} NULL,\n    \
             publish_success {boolean} NULL,\n    \
             publish_inserts BIGINT NULL,\n    \
             publish_updates BIGINT NULL,\n    \
             ended_at {dt} NULL,\n    \
             success {boolean} NULL,\n    \
             error_type VARCHAR(50) NULL,\n    \
             outcome_category VARCHAR(20) NULL\n)",
            identity = self.dialect.identity_column(),
        )
    }

    fn file_load_dlq_ddl(&self) -> String {
        let dt = self.dialect.datetime_type();
        let json = self.dialect.json_type();
        format!(
            "CREATE TABLE IF NOT EXISTS file_load_dlq (\n    \
             id {identity},\n    \
             source_filename VARCHAR(255) NOT NULL,\n    \
             file_row_number BIGINT NOT NULL,\n    \
             file_record_data {json} NOT NULL,\n    \
             validation_errors {json} NOT NULL,\n    \
             file_load_log_id BIGINT NOT NULL REFERENCES file_load_log (id),\n    \
             target_table_name VARCHAR(255) NOT NULL,\n    \
             failed_at {dt} NOT NULL\n)",
            identity = self.dialect.identity_column(),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tabload_core::{DeclaredSource, FieldDef, FieldType, RecordSchema, SourceFormat};

    pub(crate) fn test_source() -> DeclaredSource {
        DeclaredSource {
            file_pattern: "sales_*.csv".into(),
            format: SourceFormat::Csv {
                delimiter: ',',
                skip_rows: 0,
            },
            schema: RecordSchema::new(vec![
                FieldDef {
                    name: "transaction_id".into(),
                    alias: None,
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
            validation_error_threshold: 0.0,
            notification_recipients: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_creates_tables_idempotently() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", tmp.path().join("w.db").display());
        let warehouse = Warehouse::connect(&url).await.unwrap();
        let registry = SourceRegistry::register(vec![test_source()]).unwrap();

        warehouse.create_tables(&registry).await.unwrap();
        // Second bootstrap must be a no-op.
        warehouse.create_tables(&registry).await.unwrap();

        assert!(!warehouse
            .is_duplicate_file("transactions", "sales_2024.csv")
            .await
            .unwrap());
    }
}
