//! Lineage-log model: one `file_load_log` row per file attempt.
//!
//! The runner opens the row before any storage I/O, then reports phase
//! outcomes as the state machine advances. Each phase contributes a start
//! and end timestamp, a success flag, and phase-specific counters; the
//! terminal transition closes the row with the outcome.

use chrono::{DateTime, Utc};

/// The phases recorded as `*_started_at` / `*_ended_at` / `*_success`
/// column triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ArchiveCopy,
    Read,
    Validate,
    Write,
    Audit,
    Publish,
}

impl Phase {
    /// Column-name prefix of this phase's triple.
    pub fn column_prefix(&self) -> &'static str {
        match self {
            Phase::ArchiveCopy => "archive_copy",
            Phase::Read => "read",
            Phase::Validate => "validate",
            Phase::Write => "write",
            Phase::Audit => "audit",
            Phase::Publish => "publish",
        }
    }
}

/// Phase-specific counters written together with the phase triple.
#[derive(Debug, Clone, Copy, Default)]
pub enum PhaseCounters {
    #[default]
    None,
    Read {
        records_read: i64,
    },
    Validate {
        validation_errors: i64,
    },
    Write {
        records_written_to_stage: i64,
    },
    Publish {
        inserts: i64,
        updates: i64,
    },
}

/// The completed window of one phase, applied to the log row at the phase
/// boundary.
#[derive(Debug, Clone, Copy)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub counters: PhaseCounters,
}

impl PhaseOutcome {
    pub fn ok(phase: Phase, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        Self {
            phase,
            started_at,
            ended_at,
            success: true,
            counters: PhaseCounters::None,
        }
    }

    pub fn with_counters(mut self, counters: PhaseCounters) -> Self {
        self.counters = counters;
        self
    }
}

/// Terminal outcome of an attempt, persisted alongside the historical
/// `success` boolean to keep "pipeline succeeded" distinct from "failure
/// was handled by notification".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCategory {
    Success,
    HandledFailure,
    Failed,
    Duplicate,
    NoSource,
}

impl OutcomeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCategory::Success => "success",
            OutcomeCategory::HandledFailure => "handled_failure",
            OutcomeCategory::Failed => "failed",
            OutcomeCategory::Duplicate => "duplicate",
            OutcomeCategory::NoSource => "no_source",
        }
    }

    /// The tri-state result reported to the worker pool: `Some(true)` for
    /// success or handled failure, `Some(false)` for unhandled failure,
    /// `None` for duplicate-skipped and no-source files.
    pub fn as_result_flag(&self) -> Option<bool> {
        match self {
            OutcomeCategory::Success | OutcomeCategory::HandledFailure => Some(true),
            OutcomeCategory::Failed => Some(false),
            OutcomeCategory::Duplicate | OutcomeCategory::NoSource => None,
        }
    }
}

