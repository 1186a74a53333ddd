//! Persistence of the per-attempt lineage row.
//!
//! One row is inserted before any storage I/O; every later write targets
//! that row by primary key. Log writes are retried independently of the
//! pipeline body.

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use tracing::debug;

use tabload_core::{retry, LoadError, OutcomeCategory, PhaseCounters, PhaseOutcome, RetryPolicy};

use crate::pool::Warehouse;
use crate::row::int_at;

#[derive(Debug, Clone)]
pub struct LineageLog {
    warehouse: Warehouse,
    policy: RetryPolicy,
}

impl LineageLog {
    pub fn new(warehouse: Warehouse) -> Self {
        Self {
            warehouse,
            policy: RetryPolicy::default(),
        }
    }

    /// Open the attempt row, returning its assigned id.
    pub async fn start(
        &self,
        source_filename: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64, LoadError> {
        let dialect = self.warehouse.dialect;
        let started = dialect.render_datetime(&started_at);
        let id = retry(self.policy, "opening lineage row", || {
            let started = started.clone();
            async move {
                if dialect.supports_insert_returning() {
                    let sql = format!(
                        "INSERT INTO file_load_log (source_filename, started_at) VALUES ({}, {}) RETURNING id",
                        dialect.placeholder(1),
                        dialect.placeholder(2)
                    );
                    let row: AnyRow = sqlx::query(&sql)
                        .bind(source_filename)
                        .bind(started)
                        .fetch_one(&self.warehouse.pool)
                        .await
                        .map_err(|e| LoadError::database("opening lineage row", e))?;
                    int_at(&row, 0, "opening lineage row")
                } else {
                    let sql = format!(
                        "INSERT INTO file_load_log (source_filename, started_at) VALUES ({}, {})",
                        dialect.placeholder(1),
                        dialect.placeholder(2)
                    );
                    let result = sqlx::query(&sql)
                        .bind(source_filename)
                        .bind(started)
                        .execute(&self.warehouse.pool)
                        .await
                        .map_err(|e| LoadError::database("opening lineage row", e))?;
                    result.last_insert_id().ok_or_else(|| {
                        LoadError::database("opening lineage row", "no generated id returned")
                    })
                }
            }
        })
        .await?;
        debug!(log_id = id, file = source_filename, "opened lineage row");
        Ok(id)
    }

    pub async fn mark_duplicate(&self, log_id: i64) -> Result<(), LoadError> {
        let dialect = self.warehouse.dialect;
        let sql = format!(
            "UPDATE file_load_log SET duplicate_skipped = {} WHERE id = {}",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        retry(self.policy, "marking duplicate", || async {
            sqlx::query(&sql)
                .bind(true)
                .bind(log_id)
                .execute(&self.warehouse.pool)
                .await
                .map(|_| ())
                .map_err(|e| LoadError::database("marking duplicate", e))
        })
        .await
    }

    /// Record one phase's window, flag, and counters at its boundary.
    pub async fn record_phase(&self, log_id: i64, outcome: &PhaseOutcome) -> Result<(), LoadError> {
        let dialect = self.warehouse.dialect;
        let prefix = outcome.phase.column_prefix();
        let mut sets = vec![
            format!("{prefix}_started_at = {}", dialect.placeholder(1)),
            format!("{prefix}_ended_at = {}", dialect.placeholder(2)),
            format!("{prefix}_success = {}", dialect.placeholder(3)),
        ];
        let mut n = 4;
        let counters: Vec<(&str, i64)> = match outcome.counters {
            PhaseCounters::None => vec![],
            PhaseCounters::Read { records_read } => vec![("records_read", records_read)],
            PhaseCounters::Validate { validation_errors } => {
                vec![("validation_errors", validation_errors)]
            }
            PhaseCounters::Write {
                records_written_to_stage,
            } => vec![("records_written_to_stage", records_written_to_stage)],
            PhaseCounters::Publish { inserts, updates } => vec![
                ("publish_inserts", inserts),
                ("publish_updates", updates),
            ],
        };
        for (column, _) in &counters {
            sets.push(format!("{column} = {}", dialect.placeholder(n)));
            n += 1;
        }
        let sql = format!(
            "UPDATE file_load_log SET {} WHERE id = {}",
            sets.join(", "),
            dialect.placeholder(n)
        );

        let started = dialect.render_datetime(&outcome.started_at);
        let ended = dialect.render_datetime(&outcome.ended_at);
        retry(self.policy, "recording phase", || {
            let mut query = sqlx::query(&sql)
                .bind(started.clone())
                .bind(ended.clone())
                .bind(outcome.success);
            for (_, value) in &counters {
                query = query.bind(*value);
            }
            let query = query.bind(log_id);
            async move {
                query
                    .execute(&self.warehouse.pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| LoadError::database("recording phase", e))
            }
        })
        .await
    }

    /// Close the attempt row with its terminal outcome.
    pub async fn close(
        &self,
        log_id: i64,
        ended_at: DateTime<Utc>,
        success: Option<bool>,
        error_type: Option<&str>,
        outcome_category: OutcomeCategory,
    ) -> Result<(), LoadError> {
        let dialect = self.warehouse.dialect;
        let sql = format!(
            "UPDATE file_load_log SET ended_at = {}, success = {}, error_type = {}, outcome_category = {} WHERE id = {}",
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            dialect.placeholder(4),
            dialect.placeholder(5)
        );
        let ended = dialect.render_datetime(&ended_at);
        retry(self.policy, "closing lineage row", || {
            let query = sqlx::query(&sql)
                .bind(ended.clone())
                .bind(success)
                .bind(error_type.map(str::to_string))
                .bind(outcome_category.as_str())
                .bind(log_id);
            async move {
                query
                    .execute(&self.warehouse.pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| LoadError::database("closing lineage row", e))
            }
        })
        .await?;
        debug!(log_id, outcome = outcome_category.as_str(), "closed lineage row");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tabload_core::{Phase, SourceRegistry};

    async fn warehouse(dir: &std::path::Path) -> Warehouse {
        let url = format!("sqlite://{}?mode=rwc", dir.join("w.db").display());
        let warehouse = Warehouse::connect(&url).await.unwrap();
        let registry =
            SourceRegistry::register(vec![crate::pool::tests::test_source()]).unwrap();
        warehouse.create_tables(&registry).await.unwrap();
        warehouse
    }

    #[tokio::test]
    async fn lineage_rows_are_assigned_monotonic_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let log = LineageLog::new(warehouse(tmp.path()).await);
        let first = log.start("a.csv", Utc::now()).await.unwrap();
        let second = log.start("b.csv", Utc::now()).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn phase_and_close_updates_target_the_row() {
        let tmp = tempfile::tempdir().unwrap();
        let wh = warehouse(tmp.path()).await;
        let log = LineageLog::new(wh.clone());
        let id = log.start("a.csv", Utc::now()).await.unwrap();

        let started = Utc::now();
        log.record_phase(
            id,
            &PhaseOutcome::ok(Phase::Read, started, started + Duration::seconds(1))
                .with_counters(PhaseCounters::Read { records_read: 42 }),
        )
        .await
        .unwrap();
        log.close(id, Utc::now(), Some(true), None, OutcomeCategory::Success)
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT records_read, success, outcome_category FROM file_load_log WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&wh.pool)
        .await
        .unwrap();
        assert_eq!(int_at(&row, 0, "t").unwrap(), 42);
        assert_eq!(int_at(&row, 1, "t").unwrap(), 1);
        let category: String = sqlx::Row::get(&row, 2);
        assert_eq!(category, "success");
    }
}
