//! Per-file pipeline runner.
//!
//! One runner drives one source file through the state machine:
//!
//! ```text
//! LogOpen -> CheckDuplicate -> ArchiveCopy -> Read+Validate+Write
//!         -> Audit -> Publish -> CleanupDLQ -> DropStageTable
//!         -> LogClose -> DeleteSource
//! ```
//!
//! Any error jumps to the terminal handler: it records the error type and
//! the phase timings observed so far, notifies the source's recipients if
//! the error is file-notifiable, unconditionally deletes the source file,
//! and closes the lineage row. The stage table is kept on failure for
//! inspection; its name is deterministic per filename, so a retry drops
//! and recreates it instead of colliding.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::io::SyncIoBridge;
use tracing::{error, info, warn};

use tabload_core::{
    retry, DeclaredSource, LoadError, OutcomeCategory, Phase, PhaseCounters, PhaseOutcome,
    RetryPolicy, STAGE_CHANNEL_CAPACITY,
};
use tabload_db::{
    create_stage_table, drop_stage_table, Auditor, DlqCleaner, LineageLog, Publisher, StageWriter,
    Warehouse,
};
use tabload_io::notify::EmailNotifier;
use tabload_io::read::{Reader, ReaderInput};
use tabload_io::store::FileStore;

/// Terminal result of one file attempt, appended to the pool's results.
#[derive(Debug, Clone)]
pub struct FileResult {
    /// `Some(true)` success or handled failure, `Some(false)` unhandled
    /// failure, `None` duplicate-skipped or no source matched.
    pub outcome: Option<bool>,
    pub filename: String,
    pub error: Option<String>,
    pub category: OutcomeCategory,
}

pub struct PipelineRunner {
    warehouse: Warehouse,
    store: Arc<FileStore>,
    lineage: LineageLog,
    email: Arc<EmailNotifier>,
    source: Arc<DeclaredSource>,
    filename: String,
    batch_size: usize,
    policy: RetryPolicy,
}

/// One streaming stage's report: its result and its phase window.
struct StageReport<T> {
    result: Result<T, LoadError>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl PipelineRunner {
    pub fn new(
        warehouse: Warehouse,
        store: Arc<FileStore>,
        email: Arc<EmailNotifier>,
        source: Arc<DeclaredSource>,
        filename: String,
        batch_size: usize,
    ) -> Self {
        let lineage = LineageLog::new(warehouse.clone());
        Self {
            warehouse,
            store,
            lineage,
            email,
            source,
            filename,
            batch_size,
            policy: RetryPolicy::default(),
        }
    }

    pub async fn run(self) -> FileResult {
        let log_id = match self.lineage.start(&self.filename, Utc::now()).await {
            Ok(id) => id,
            Err(e) => {
                error!(file = self.filename, error = %e, "could not open lineage row");
                return FileResult {
                    outcome: Some(false),
                    filename: self.filename,
                    error: Some(e.to_string()),
                    category: OutcomeCategory::Failed,
                };
            }
        };
        info!(log_id, file = self.filename, "processing file");

        match self.execute(log_id).await {
            Ok(category) => self.finish(log_id, category).await,
            Err(e) => self.fail(log_id, e).await,
        }
    }

    /// The numbered phases. Returns the terminal category on the success
    /// and duplicate paths; every error propagates to the failure handler.
    async fn execute(&self, log_id: i64) -> Result<OutcomeCategory, LoadError> {
        if self.check_duplicate(log_id).await? {
            return Ok(OutcomeCategory::Duplicate);
        }

        self.archive_copy(log_id).await?;

        let stage_table = create_stage_table(&self.warehouse, &self.source, &self.filename).await?;
        self.stream_file(log_id, &stage_table).await?;

        self.audit(log_id, &stage_table).await?;
        self.publish(log_id, &stage_table).await?;

        DlqCleaner::new(&self.warehouse)
            .clean(&self.filename, log_id, self.batch_size)
            .await?;
        drop_stage_table(&self.warehouse, &stage_table).await?;

        Ok(OutcomeCategory::Success)
    }

    /// Filename-based dedupe against the target table. A duplicate is
    /// notified, moved aside, and marked in the lineage row.
    async fn check_duplicate(&self, log_id: i64) -> Result<bool, LoadError> {
        let duplicate = retry(self.policy, "duplicate check", || {
            self.warehouse
                .is_duplicate_file(&self.source.table_name, &self.filename)
        })
        .await?;
        if !duplicate {
            return Ok(false);
        }

        warn!(log_id, file = self.filename, "file has already been processed");
        if let Some(recipients) = &self.source.notification_recipients {
            self.email
                .notify_failure(
                    &self.filename,
                    &LoadError::DuplicateFile {
                        source_filename: self.filename.clone(),
                    },
                    Some(log_id),
                    recipients,
                )
                .await;
        }
        retry(self.policy, "moving duplicate", || {
            self.store.move_to_duplicates(&self.filename)
        })
        .await?;
        self.lineage.mark_duplicate(log_id).await?;
        Ok(true)
    }

    async fn archive_copy(&self, log_id: i64) -> Result<(), LoadError> {
        let started_at = Utc::now();
        let result = retry(self.policy, "archive copy", || {
            self.store.copy_to_archive(&self.filename)
        })
        .await;
        self.phase_boundary(log_id, Phase::ArchiveCopy, started_at, PhaseCounters::None, result)
            .await
    }

    /// The interleaved Read -> Validate -> Write section: three tasks
    /// joined at the end, connected by bounded channels.
    async fn stream_file(&self, log_id: i64, stage_table: &str) -> Result<(), LoadError> {
        let reader = Reader::new(self.source.clone(), &self.filename, self.batch_size)?;
        let starting_row_number = reader.starting_row_number();

        let input = if reader.needs_buffer() {
            let data = retry(self.policy, "fetching file", || {
                self.store.fetch(&self.filename)
            })
            .await?;
            ReaderInput::Buffer(data)
        } else {
            let stream = retry(self.policy, "opening file stream", || {
                self.store.stream(&self.filename)
            })
            .await?;
            ReaderInput::Stream(Box::new(SyncIoBridge::new(stream)))
        };

        let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (validated_tx, validated_rx) = tokio::sync::mpsc::channel(STAGE_CHANNEL_CAPACITY);

        let read_task = {
            let started_at = Utc::now();
            tokio::task::spawn_blocking(move || StageReport {
                result: reader.run_blocking(input, raw_tx),
                started_at,
                ended_at: Utc::now(),
            })
        };
        let validate_task = {
            let validator = super::Validator::new(
                self.source.clone(),
                self.filename.clone(),
                log_id,
                starting_row_number,
            );
            let started_at = Utc::now();
            tokio::spawn(async move {
                StageReport {
                    result: validator.run(raw_rx, validated_tx).await,
                    started_at,
                    ended_at: Utc::now(),
                }
            })
        };
        let write_task = {
            let mut writer = StageWriter::new(
                self.warehouse.clone(),
                &self.source,
                stage_table.to_string(),
                self.batch_size,
            );
            let started_at = Utc::now();
            tokio::spawn(async move {
                StageReport {
                    result: writer.write(validated_rx).await,
                    started_at,
                    ended_at: Utc::now(),
                }
            })
        };

        let read = read_task.await.map_err(join_error)?;
        let validate = validate_task.await.map_err(join_error)?;
        let write = write_task.await.map_err(join_error)?;

        // Record the three phase windows in pipeline order. A failure of
        // the boundary write itself only surfaces when the stages were
        // otherwise clean; it must not mask a pipeline error.
        let mut log_failure: Option<LoadError> = None;
        let windows = [
            (
                Phase::Read,
                read.started_at,
                read.ended_at,
                read.result.is_ok(),
                match &read.result {
                    Ok(rows) => PhaseCounters::Read {
                        records_read: *rows as i64,
                    },
                    Err(_) => PhaseCounters::None,
                },
            ),
            (
                Phase::Validate,
                validate.started_at,
                validate.ended_at,
                validate.result.is_ok(),
                match &validate.result {
                    Ok(report) => PhaseCounters::Validate {
                        validation_errors: report.validation_errors as i64,
                    },
                    Err(_) => PhaseCounters::None,
                },
            ),
            (
                Phase::Write,
                write.started_at,
                write.ended_at,
                write.result.is_ok(),
                match &write.result {
                    Ok(rows) => PhaseCounters::Write {
                        records_written_to_stage: *rows as i64,
                    },
                    Err(_) => PhaseCounters::None,
                },
            ),
        ];
        for (phase, started_at, ended_at, success, counters) in windows {
            let outcome = PhaseOutcome {
                phase,
                started_at,
                ended_at,
                success,
                counters,
            };
            if let Err(e) = self.lineage.record_phase(log_id, &outcome).await {
                warn!(log_id, phase = ?phase, error = %e, "could not record phase window");
                log_failure.get_or_insert(e);
            }
        }

        // Surface the most upstream real error: a closed channel only
        // ever means the peer stage failed first.
        let mut channel_closed: Option<LoadError> = None;
        for result in [
            read.result.map(|_| ()),
            validate.result.map(|_| ()),
            write.result.map(|_| ()),
        ] {
            match result {
                Ok(()) => {}
                Err(e @ LoadError::ChannelClosed(_)) => {
                    channel_closed.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = channel_closed {
            return Err(e);
        }
        if let Some(e) = log_failure {
            return Err(e);
        }
        Ok(())
    }

    async fn audit(&self, log_id: i64, stage_table: &str) -> Result<(), LoadError> {
        let auditor = Auditor::new(
            &self.warehouse,
            &self.source,
            stage_table,
            &self.filename,
            log_id,
        );
        let started_at = Utc::now();
        let result = match auditor.audit_grain().await {
            Ok(()) => auditor.audit_declared().await,
            Err(e) => Err(e),
        };
        self.phase_boundary(log_id, Phase::Audit, started_at, PhaseCounters::None, result)
            .await
    }

    async fn publish(&self, log_id: i64, stage_table: &str) -> Result<(), LoadError> {
        let publisher = Publisher::new(&self.warehouse, &self.source, stage_table, log_id);
        let started_at = Utc::now();
        let (result, counters) = match publisher.publish().await {
            Ok((inserts, updates)) => (Ok(()), PhaseCounters::Publish { inserts, updates }),
            Err(e) => (Err(e), PhaseCounters::None),
        };
        self.phase_boundary(log_id, Phase::Publish, started_at, counters, result)
            .await
    }

    /// Record a phase triple at its boundary and pass the phase result
    /// through; a log-write failure never masks a pipeline error.
    async fn phase_boundary(
        &self,
        log_id: i64,
        phase: Phase,
        started_at: DateTime<Utc>,
        counters: PhaseCounters,
        result: Result<(), LoadError>,
    ) -> Result<(), LoadError> {
        let outcome = PhaseOutcome {
            phase,
            started_at,
            ended_at: Utc::now(),
            success: result.is_ok(),
            counters,
        };
        let logged = self.lineage.record_phase(log_id, &outcome).await;
        match (result, logged) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(log_err)) => Err(log_err),
            (Err(e), logged) => {
                if let Err(log_err) = logged {
                    warn!(log_id, error = %log_err, "could not record failed phase");
                }
                Err(e)
            }
        }
    }

    /// Success and duplicate terminal transition.
    async fn finish(&self, log_id: i64, category: OutcomeCategory) -> FileResult {
        let success = match category {
            OutcomeCategory::Success => Some(true),
            _ => None,
        };
        if let Err(e) = self
            .lineage
            .close(log_id, Utc::now(), success, None, category)
            .await
        {
            error!(log_id, error = %e, "could not close lineage row");
            return FileResult {
                outcome: Some(false),
                filename: self.filename.clone(),
                error: Some(e.to_string()),
                category: OutcomeCategory::Failed,
            };
        }
        if let Err(e) = retry(self.policy, "deleting source file", || {
            self.store.delete(&self.filename)
        })
        .await
        {
            error!(log_id, file = self.filename, error = %e, "could not delete source file");
            return FileResult {
                outcome: Some(false),
                filename: self.filename.clone(),
                error: Some(e.to_string()),
                category: OutcomeCategory::Failed,
            };
        }
        info!(log_id, file = self.filename, outcome = category.as_str(), "finished file");
        FileResult {
            outcome: category.as_result_flag(),
            filename: self.filename.clone(),
            error: None,
            category,
        }
    }

    /// Terminal failure handler.
    async fn fail(&self, log_id: i64, error: LoadError) -> FileResult {
        error!(log_id, file = self.filename, error = %error, "pipeline failed");

        let recipients = self
            .source
            .notification_recipients
            .clone()
            .unwrap_or_default();
        let handled = error.is_notifiable() && !recipients.is_empty();
        if handled {
            self.email
                .notify_failure(&self.filename, &error, Some(log_id), &recipients)
                .await;
        }

        if let Err(e) = retry(self.policy, "deleting source file", || {
            self.store.delete(&self.filename)
        })
        .await
        {
            error!(log_id, file = self.filename, error = %e, "could not delete failed source file");
        }

        let category = if handled {
            OutcomeCategory::HandledFailure
        } else {
            OutcomeCategory::Failed
        };
        if let Err(e) = self
            .lineage
            .close(
                log_id,
                Utc::now(),
                Some(handled),
                Some(error.error_type()),
                category,
            )
            .await
        {
            warn!(log_id, error = %e, "could not close lineage row after failure");
        }

        FileResult {
            outcome: Some(handled),
            filename: self.filename.clone(),
            error: Some(error.to_string()),
            category,
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> LoadError {
    LoadError::Database {
        context: "pipeline stage task".into(),
        message: e.to_string(),
    }
}
