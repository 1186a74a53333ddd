//! Worker pool: parallel file consumer with bounded concurrency.
//!
//! The source location is enumerated once into a shared queue; N workers
//! (default: physical core count) pop filenames until the queue drains or
//! shutdown is requested. Between files no ordering is guaranteed; within
//! a file the runner's state machine is strictly sequential.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tabload_core::{
    retry, DeclaredSource, LoadError, OutcomeCategory, Resolution, RetryPolicy, SourceRegistry,
};
use tabload_db::{LineageLog, Warehouse};
use tabload_io::notify::{AlertLevel, EmailNotifier, WebhookNotifier};
use tabload_io::store::FileStore;

use crate::runner::{FileResult, PipelineRunner};

pub struct Processor {
    warehouse: Warehouse,
    store: Arc<FileStore>,
    registry: Arc<SourceRegistry>,
    email: Arc<EmailNotifier>,
    webhook: WebhookNotifier,
    batch_size: usize,
    workers: usize,
    policy: RetryPolicy,
}

impl Processor {
    pub fn new(
        warehouse: Warehouse,
        store: Arc<FileStore>,
        registry: Arc<SourceRegistry>,
        email: Arc<EmailNotifier>,
        webhook: WebhookNotifier,
        batch_size: usize,
        workers: Option<usize>,
    ) -> Self {
        let workers = workers.unwrap_or_else(num_cpus::get_physical).max(1);
        Self {
            warehouse,
            store,
            registry,
            email,
            webhook,
            batch_size,
            workers,
            policy: RetryPolicy::default(),
        }
    }

    /// Process every file currently in the source location. Returns the
    /// per-file results after sending the summary notification.
    pub async fn process_all(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<FileResult>, LoadError> {
        let files = retry(self.policy, "scanning source location", || self.store.scan()).await?;
        info!(files = files.len(), workers = self.workers, "starting worker pool");

        let queue = Arc::new(Mutex::new(files.into_iter().collect::<VecDeque<_>>()));
        let results: Arc<Mutex<Vec<FileResult>>> = Arc::new(Mutex::new(Vec::new()));

        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let cancel = cancel.clone();
            let processor = self.clone_for_worker();
            pool.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        warn!(worker, "shutdown requested, draining worker");
                        break;
                    }
                    let Some(filename) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let result = processor.handle_file(&filename).await;
                    results.lock().await.push(result);
                }
            });
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }

        let results = Arc::try_unwrap(results)
            .map(|m| m.into_inner())
            .unwrap_or_default();
        self.send_summary(&results).await;
        Ok(results)
    }

    /// Process a single named file (`--file`).
    pub async fn process_one(&self, filename: &str) -> FileResult {
        let result = self.handle_file(filename).await;
        self.send_summary(std::slice::from_ref(&result)).await;
        result
    }

    /// Resolve and run one file. Files with no (or no unique) declared
    /// source never construct a runner; the worker writes their lineage
    /// row itself.
    async fn handle_file(&self, filename: &str) -> FileResult {
        match self.registry.resolve(filename) {
            Resolution::Resolved(source) => self.run_pipeline(source, filename).await,
            Resolution::NoMatch => {
                warn!(file = filename, "no declared source matches file");
                self.handle_unmatched(
                    filename,
                    LoadError::NoSourceMatch {
                        filename: filename.to_string(),
                    },
                    OutcomeCategory::NoSource,
                    true,
                )
                .await
            }
            Resolution::Ambiguous(tables) => {
                error!(file = filename, tables = ?tables, "multiple declared sources match file");
                self.handle_unmatched(
                    filename,
                    LoadError::AmbiguousSource {
                        filename: filename.to_string(),
                        tables,
                    },
                    OutcomeCategory::Failed,
                    false,
                )
                .await
            }
        }
    }

    async fn run_pipeline(&self, source: Arc<DeclaredSource>, filename: &str) -> FileResult {
        PipelineRunner::new(
            self.warehouse.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.email),
            source,
            filename.to_string(),
            self.batch_size,
        )
        .run()
        .await
    }

    /// Lineage and disposition for files the registry cannot place:
    /// archive (no-match only), log, delete.
    async fn handle_unmatched(
        &self,
        filename: &str,
        error: LoadError,
        category: OutcomeCategory,
        archive: bool,
    ) -> FileResult {
        let lineage = LineageLog::new(self.warehouse.clone());
        let log_id = match lineage.start(filename, Utc::now()).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(file = filename, error = %e, "could not open lineage row");
                None
            }
        };

        if archive {
            if let Err(e) = retry(self.policy, "archiving unmatched file", || {
                self.store.copy_to_archive(filename)
            })
            .await
            {
                error!(file = filename, error = %e, "could not archive unmatched file");
            }
        }
        if let Err(e) = retry(self.policy, "deleting unmatched file", || {
            self.store.delete(filename)
        })
        .await
        {
            error!(file = filename, error = %e, "could not delete unmatched file");
        }

        if let Some(log_id) = log_id {
            let success = match category {
                OutcomeCategory::NoSource => None,
                _ => Some(false),
            };
            if let Err(e) = lineage
                .close(log_id, Utc::now(), success, Some(error.error_type()), category)
                .await
            {
                warn!(file = filename, error = %e, "could not close lineage row");
            }
        }

        FileResult {
            outcome: category.as_result_flag(),
            filename: filename.to_string(),
            error: Some(error.to_string()),
            category,
        }
    }

    /// Drain summary: counts by outcome, failed files with errors. Sent
    /// iff anything failed or went unmatched.
    async fn send_summary(&self, results: &[FileResult]) {
        let succeeded = results.iter().filter(|r| r.outcome == Some(true)).count();
        let failed: Vec<&FileResult> = results
            .iter()
            .filter(|r| r.outcome == Some(false))
            .collect();
        let unmatched = results
            .iter()
            .filter(|r| r.category == OutcomeCategory::NoSource)
            .count();
        let skipped = results.iter().filter(|r| r.outcome.is_none()).count();

        info!(
            processed = results.len(),
            succeeded,
            failed = failed.len(),
            skipped,
            "run complete"
        );
        if failed.is_empty() && unmatched == 0 {
            return;
        }

        let failed_files: Vec<serde_json::Value> = failed
            .iter()
            .map(|r| {
                json!({
                    "file": r.filename,
                    "error": r.error.clone().unwrap_or_default(),
                })
            })
            .collect();
        let details = json!({
            "processed": results.len(),
            "succeeded": succeeded,
            "failed": failed.len(),
            "skipped": skipped,
            "unmatched": unmatched,
            "failed_files": failed_files,
        });
        let level = if failed.is_empty() {
            AlertLevel::Warning
        } else {
            AlertLevel::Error
        };
        self.webhook
            .notify(
                level,
                "File load summary",
                &format!(
                    "{} of {} file(s) need attention",
                    failed.len() + unmatched,
                    results.len()
                ),
                Some(details),
            )
            .await;
    }

    fn clone_for_worker(&self) -> Self {
        Self {
            warehouse: self.warehouse.clone(),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            email: Arc::clone(&self.email),
            webhook: self.webhook.clone(),
            batch_size: self.batch_size,
            workers: self.workers,
            policy: self.policy,
        }
    }
}
