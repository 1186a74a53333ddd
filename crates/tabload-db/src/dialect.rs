//! Per-dialect SQL fragments.
//!
//! The supported engines are the ones the `sqlx` Any driver can reach:
//! PostgreSQL, MySQL, SQLite. A connection URL with any other scheme is a
//! configuration error.

use chrono::{DateTime, SecondsFormat, Utc};

use tabload_core::{FieldType, LoadError, RecordSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Infer the dialect from a connection URL scheme.
    pub fn from_url(database_url: &str) -> Result<Self, LoadError> {
        let scheme = database_url.split("://").next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(LoadError::Config(format!(
                "unsupported database dialect {other:?}; supported: postgres, mysql, sqlite"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            _ => "?".to_string(),
        }
    }

    /// Upper bound on bind parameters per statement, which caps how many
    /// rows one multi-row insert may carry.
    pub fn max_bind_params(&self) -> usize {
        match self {
            Dialect::Postgres => 65_535,
            Dialect::MySql => 65_535,
            Dialect::Sqlite => 32_766,
        }
    }

    /// Whether `INSERT ... RETURNING id` is available; MySQL reports the
    /// generated key through the statement result instead.
    pub fn supports_insert_returning(&self) -> bool {
        !matches!(self, Dialect::MySql)
    }

    /// Render a UTC datetime the way this engine's datetime columns
    /// accept it as text.
    pub fn render_datetime(&self, dt: &DateTime<Utc>) -> String {
        match self {
            Dialect::MySql => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            _ => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    /// Column type for a schema field.
    pub fn column_type(&self, field_type: &FieldType) -> String {
        match (self, field_type) {
            (_, FieldType::String { max_length: Some(n) }) => format!("VARCHAR({n})"),
            (Dialect::MySql, FieldType::String { max_length: None }) => "TEXT".into(),
            (_, FieldType::String { max_length: None }) => "TEXT".into(),
            (Dialect::Sqlite, FieldType::Int) => "INTEGER".into(),
            (_, FieldType::Int) => "BIGINT".into(),
            (Dialect::Postgres, FieldType::Float) => "DOUBLE PRECISION".into(),
            (Dialect::MySql, FieldType::Float) => "DOUBLE".into(),
            (Dialect::Sqlite, FieldType::Float) => "REAL".into(),
            (Dialect::Postgres, FieldType::Bool) => "BOOLEAN".into(),
            (Dialect::MySql, FieldType::Bool) => "TINYINT(1)".into(),
            (Dialect::Sqlite, FieldType::Bool) => "INTEGER".into(),
            (Dialect::MySql, FieldType::Decimal) => "DECIMAL(38, 9)".into(),
            (_, FieldType::Decimal) => "NUMERIC".into(),
            (Dialect::Sqlite, FieldType::Date) => "TEXT".into(),
            (_, FieldType::Date) => "DATE".into(),
            (_, FieldType::Datetime) => self.datetime_type().into(),
            (Dialect::Sqlite, FieldType::Email) => "TEXT".into(),
            (_, FieldType::Email) => "VARCHAR(254)".into(),
        }
    }

    /// Timezone-aware datetime column type (SQLite stores the rendered
    /// text, zone included in the value).
    pub fn datetime_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "TIMESTAMPTZ",
            Dialect::MySql => "DATETIME(6)",
            Dialect::Sqlite => "TEXT",
        }
    }

    /// Column type of the 16-byte row fingerprint.
    pub fn hash_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BYTEA",
            Dialect::MySql => "VARBINARY(16)",
            Dialect::Sqlite => "BLOB",
        }
    }

    /// Column type of the DLQ's JSON payloads.
    pub fn json_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "JSONB",
            Dialect::MySql => "JSON",
            Dialect::Sqlite => "TEXT",
        }
    }

    /// Auto-assigned 64-bit identity primary key.
    pub fn identity_column(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::MySql => "BIGINT AUTO_INCREMENT PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    /// Stage-table DDL: schema columns plus the derived columns, no
    /// timestamps, no primary key.
    pub fn stage_ddl(&self, stage_table: &str, schema: &RecordSchema) -> String {
        let mut columns = self.schema_columns(schema);
        columns.push(format!("etl_row_hash {} NOT NULL", self.hash_type()));
        columns.push("source_filename VARCHAR(255) NOT NULL".into());
        columns.push("file_load_log_id BIGINT NOT NULL".into());
        format!(
            "CREATE TABLE {stage_table} (\n    {}\n)",
            columns.join(",\n    ")
        )
    }

    /// Target-table DDL: stage columns plus audit timestamps, primary key
    /// on the grain.
    pub fn target_ddl(&self, target_table: &str, schema: &RecordSchema, grain: &[String]) -> String {
        let mut columns = self.schema_columns(schema);
        columns.push(format!("etl_row_hash {} NOT NULL", self.hash_type()));
        columns.push("source_filename VARCHAR(255) NOT NULL".into());
        columns.push("file_load_log_id BIGINT NOT NULL".into());
        columns.push(format!("etl_created_at {} NOT NULL", self.datetime_type()));
        columns.push(format!("etl_updated_at {} NULL", self.datetime_type()));
        columns.push(format!("PRIMARY KEY ({})", grain.join(", ")));
        format!(
            "CREATE TABLE IF NOT EXISTS {target_table} (\n    {}\n)",
            columns.join(",\n    ")
        )
    }

    fn schema_columns(&self, schema: &RecordSchema) -> Vec<String> {
        schema
            .fields
            .iter()
            .map(|f| {
                let nullability = if f.optional { "NULL" } else { "NOT NULL" };
                format!("{} {} {nullability}", f.name, self.column_type(&f.field_type))
            })
            .collect()
    }

    /// Returns 1 iff the grain is distinct across all rows of `table`,
    /// projected as `grain_unique`.
    pub fn grain_check_sql(&self, table: &str, grain: &[String]) -> String {
        let distinct_expr = if grain.len() == 1 {
            grain[0].clone()
        } else {
            match self {
                // Tuple DISTINCT
                Dialect::Postgres => format!("({})", grain.join(", ")),
                // Concatenated key
                Dialect::MySql | Dialect::Sqlite => {
                    format!("CONCAT({})", grain.join(", '||', "))
                }
            }
        };
        format!(
            "SELECT CASE WHEN COUNT(DISTINCT {distinct_expr}) = COUNT(*) THEN 1 ELSE 0 END AS grain_unique FROM {table}"
        )
    }

    /// Up to `limit` duplicated grain tuples with their counts.
    pub fn duplicate_examples_sql(&self, table: &str, grain: &[String], limit: usize) -> String {
        let grain_cols = grain.join(", ");
        format!(
            "SELECT {grain_cols}, COUNT(*) AS duplicate_count FROM {table} \
             GROUP BY {grain_cols} HAVING COUNT(*) > 1 LIMIT {limit}"
        )
    }

    /// The single merge statement: insert unmatched grain tuples with
    /// `etl_created_at = now`; for matched tuples, rewrite the non-grain
    /// columns and stamp `etl_updated_at` only when the row fingerprint
    /// changed, leaving unchanged rows untouched.
    pub fn merge_sql(
        &self,
        target: &str,
        stage: &str,
        schema: &RecordSchema,
        grain: &[String],
        now: &DateTime<Utc>,
    ) -> String {
        let now_literal = self.render_datetime(now);
        let columns: Vec<&str> = schema
            .field_names()
            .chain(["etl_row_hash", "source_filename", "file_load_log_id"])
            .collect();
        let insert_columns = columns.join(", ");
        let select_columns: Vec<String> = columns.iter().map(|c| format!("stage.{c}")).collect();
        let update_columns: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !grain.iter().any(|g| g.as_str() == *c))
            .collect();

        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let conflict_columns = grain.join(", ");
                let update_set: Vec<String> = update_columns
                    .iter()
                    .map(|c| format!("{c} = excluded.{c}"))
                    .chain([format!("etl_updated_at = '{now_literal}'")])
                    .collect();
                format!(
                    "INSERT INTO {target} ({insert_columns}, etl_created_at)\n\
                     SELECT {}, '{now_literal}'\n\
                     FROM {stage} AS stage\n\
                     WHERE 1=1\n\
                     ON CONFLICT ({conflict_columns}) DO UPDATE SET\n    {}\n\
                     WHERE {target}.etl_row_hash <> excluded.etl_row_hash",
                    select_columns.join(", "),
                    update_set.join(",\n    ")
                )
            }
            Dialect::MySql => {
                let update_set: Vec<String> = update_columns
                    .iter()
                    .map(|c| {
                        format!(
                            "{c} = IF(stage.etl_row_hash <> {target}.etl_row_hash, stage.{c}, {target}.{c})"
                        )
                    })
                    .chain([format!(
                        "etl_updated_at = IF(stage.etl_row_hash <> {target}.etl_row_hash, '{now_literal}', {target}.etl_updated_at)"
                    )])
                    .collect();
                format!(
                    "INSERT INTO {target} ({insert_columns}, etl_created_at)\n\
                     SELECT {}, '{now_literal}'\n\
                     FROM {stage} AS stage\n\
                     ON DUPLICATE KEY UPDATE\n    {}",
                    select_columns.join(", "),
                    update_set.join(",\n    ")
                )
            }
        }
    }

    /// Delete one batch of superseded DLQ rows for a filename. Binds:
    /// source filename, then the log id upper bound.
    pub fn dlq_delete_batch_sql(&self, batch_size: usize) -> String {
        match self {
            Dialect::MySql => format!(
                "DELETE FROM file_load_dlq WHERE source_filename = ? AND file_load_log_id < ? LIMIT {batch_size}"
            ),
            Dialect::Postgres => format!(
                "DELETE FROM file_load_dlq WHERE id IN (\
                 SELECT id FROM file_load_dlq WHERE source_filename = $1 AND file_load_log_id < $2 LIMIT {batch_size})"
            ),
            Dialect::Sqlite => format!(
                "DELETE FROM file_load_dlq WHERE id IN (\
                 SELECT id FROM file_load_dlq WHERE source_filename = ? AND file_load_log_id < ? LIMIT {batch_size})"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabload_core::{FieldDef, FieldType};

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
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
            FieldDef {
                name: "sale_date".into(),
                alias: None,
                field_type: FieldType::Date,
                optional: true,
            },
        ])
    }

    #[test]
    fn url_scheme_picks_the_dialect() {
        assert_eq!(Dialect::from_url("postgres://u@h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("mysql://u@h/db").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::from_url("sqlite:///tmp/w.db").unwrap(), Dialect::Sqlite);
        assert!(matches!(
            Dialect::from_url("mssql://u@h/db"),
            Err(LoadError::Config(_))
        ));
    }

    #[test]
    fn stage_ddl_has_derived_columns_and_no_timestamps() {
        let ddl = Dialect::Sqlite.stage_ddl("stage_sales_2024", &schema());
        assert!(ddl.contains("CREATE TABLE stage_sales_2024"));
        assert!(ddl.contains("transaction_id VARCHAR(20) NOT NULL"));
        assert!(ddl.contains("sale_date TEXT NULL"));
        assert!(ddl.contains("etl_row_hash BLOB NOT NULL"));
        assert!(!ddl.contains("etl_created_at"));
        assert!(!ddl.contains("PRIMARY KEY"));
    }

    #[test]
    fn target_ddl_keys_on_the_grain() {
        let ddl = Dialect::Postgres.target_ddl("transactions", &schema(), &["transaction_id".into()]);
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS transactions"));
        assert!(ddl.contains("etl_created_at TIMESTAMPTZ NOT NULL"));
        assert!(ddl.contains("etl_updated_at TIMESTAMPTZ NULL"));
        assert!(ddl.contains("PRIMARY KEY (transaction_id)"));
    }

    #[test]
    fn grain_check_handles_single_and_composite_grains() {
        let single = Dialect::Postgres.grain_check_sql("stage_t", &["transaction_id".into()]);
        assert!(single.contains("COUNT(DISTINCT transaction_id)"));

        let composite = Dialect::Postgres
            .grain_check_sql("stage_t", &["store_id".into(), "transaction_id".into()]);
        assert!(composite.contains("COUNT(DISTINCT (store_id, transaction_id))"));

        let concat = Dialect::Sqlite
            .grain_check_sql("stage_t", &["store_id".into(), "transaction_id".into()]);
        assert!(concat.contains("CONCAT(store_id, '||', transaction_id)"));
    }

    #[test]
    fn merge_updates_only_on_hash_change() {
        let now = DateTime::parse_from_rfc3339("2024-01-15T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let sql = Dialect::Sqlite.merge_sql(
            "transactions",
            "stage_sales",
            &schema(),
            &["transaction_id".into()],
            &now,
        );
        assert!(sql.contains("ON CONFLICT (transaction_id) DO UPDATE SET"));
        assert!(sql.contains("quantity = excluded.quantity"));
        assert!(!sql.contains("transaction_id = excluded.transaction_id"));
        assert!(sql.contains("WHERE transactions.etl_row_hash <> excluded.etl_row_hash"));
        assert!(sql.contains("etl_updated_at = '2024-01-15T10:30:00"));

        let sql = Dialect::MySql.merge_sql(
            "transactions",
            "stage_sales",
            &schema(),
            &["transaction_id".into()],
            &now,
        );
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
        assert!(sql.contains(
            "quantity = IF(stage.etl_row_hash <> transactions.etl_row_hash, stage.quantity, transactions.quantity)"
        ));
    }

    #[test]
    fn mysql_datetime_rendering_drops_the_offset() {
        let now = DateTime::parse_from_rfc3339("2024-01-15T10:30:00.25Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            Dialect::MySql.render_datetime(&now),
            "2024-01-15 10:30:00.250000"
        );
        assert_eq!(
            Dialect::Postgres.render_datetime(&now),
            "2024-01-15T10:30:00.250000Z"
        );
    }
}
