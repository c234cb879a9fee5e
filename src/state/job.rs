/// Job and outcome definitions for tracking source acquisition
///
/// A job moves a single source through fetch, parse, normalize and store. Its
/// outcome decides whether the source's schedule advances.
use crate::config::Source;
use chrono::{DateTime, Utc};
use std::fmt;

/// Which cadence dispatched a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Cheap poll with a small row limit
    ChangeDetection,

    /// Larger poll catching late corrections and backfills
    FullRefresh,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChangeDetection => "change_detection",
            Self::FullRefresh => "full_refresh",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy shared by logging, reports and run statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    // ===== Fetch Failures =====
    /// Timeouts, connection resets, 5xx and 429 after retries ran out
    TransientNetwork,

    /// Bot challenge not resolved by the fallback renderer
    Blocked,

    /// 404 and other non-retryable responses
    Permanent,

    /// Breaker open; no request was sent
    CircuitOpen,

    // ===== Content Failures =====
    /// Expected table missing: probable site redesign
    Structural,

    /// Page-level content rejected by row validation
    Validation,

    // ===== Run Failures =====
    /// Stopped by a cancellation signal
    Cancelled,

    /// Storage connection or transaction failure
    Storage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::Blocked => "blocked",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit_open",
            Self::Structural => "structural",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Storage => "storage",
        }
    }

    /// Returns true if the next scheduled cycle will try this source again
    pub fn retried_next_cycle(&self) -> bool {
        !matches!(self, Self::Storage)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record counts produced by one ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounts {
    /// Rows the parser produced
    pub rows: usize,

    /// First revisions written
    pub new: usize,

    /// Additional revisions written for changed filings
    pub changed: usize,

    /// Already stored with identical content
    pub unchanged: usize,

    /// Rows failing normalization
    pub invalid: usize,

    /// Records skipped by storage (constraint violations, in-batch duplicates)
    pub skipped: usize,
}

impl IngestCounts {
    pub fn stored(&self) -> usize {
        self.new + self.changed
    }

    pub fn add(&mut self, other: &IngestCounts) {
        self.rows += other.rows;
        self.new += other.new;
        self.changed += other.changed;
        self.unchanged += other.unchanged;
        self.invalid += other.invalid;
        self.skipped += other.skipped;
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    // ===== Success States =====
    /// The page was parsed and its records went through dedup and storage
    Ingested(IngestCounts),

    /// Nothing new: identical page content, or the newest filing is already known
    Unchanged,

    // ===== Failure States =====
    /// Terminal failure for this cycle
    Failed { kind: FailureKind, message: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Returns the failure kind for failed outcomes
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns true if the source's due timers should move past this job
    ///
    /// Successes advance the schedule, and so does a structural failure, which
    /// the breaker never counts. Other failures leave the source due; the
    /// breaker throttles those.
    pub fn advances_schedule(&self) -> bool {
        match self {
            Self::Failed { kind, .. } => *kind == FailureKind::Structural,
            _ => true,
        }
    }

    pub fn counts(&self) -> IngestCounts {
        match self {
            Self::Ingested(counts) => *counts,
            _ => IngestCounts::default(),
        }
    }
}

/// One attempt to acquire a source's page
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub source: Source,
    pub kind: JobKind,

    /// Network attempts made, including retries and the fallback render
    pub attempts: u32,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
}

impl FetchJob {
    pub fn new(source: Source, kind: JobKind) -> Self {
        Self {
            source,
            kind,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        }
    }

    /// Records the terminal outcome and the finish time
    pub fn finish(&mut self, outcome: JobOutcome) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }
}
