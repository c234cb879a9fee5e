//! Run reports
//!
//! A run report collects the outcome of every job in a pass and derives the
//! run status and process exit code from them.

use crate::state::{FailureKind, IngestCounts, JobKind, JobOutcome};
use crate::storage::{RunMode, RunStatus, RunTotals};
use std::time::Duration;

/// Outcome of one source within a run
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source: String,

    /// The kind the job finished as (a change check may escalate)
    pub kind: JobKind,

    /// True if a change check escalated to a full refresh
    pub escalated: bool,

    pub attempts: u32,
    pub elapsed: Duration,
    pub outcome: JobOutcome,
}

impl SourceReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: i64,
    pub mode: RunMode,
    pub status: RunStatus,
    pub sources: Vec<SourceReport>,
    pub elapsed: Duration,
}

impl RunReport {
    /// Builds a report, deriving the status from the source outcomes
    pub fn new(
        run_id: i64,
        mode: RunMode,
        mut sources: Vec<SourceReport>,
        interrupted: bool,
        elapsed: Duration,
    ) -> Self {
        sources.sort_by(|a, b| a.source.cmp(&b.source));
        let status = status_from(&sources, interrupted);
        Self {
            run_id,
            mode,
            status,
            sources,
            elapsed,
        }
    }

    /// Sums ingest counts across sources
    pub fn counts(&self) -> IngestCounts {
        let mut total = IngestCounts::default();
        for report in &self.sources {
            total.add(&report.outcome.counts());
        }
        total
    }

    pub fn totals(&self) -> RunTotals {
        let counts = self.counts();
        let ok = self.sources.iter().filter(|s| s.is_success()).count() as u64;
        RunTotals {
            sources_ok: ok,
            sources_failed: self.sources.len() as u64 - ok,
            records_new: counts.new as u64,
            records_changed: counts.changed as u64,
            records_skipped: (counts.invalid + counts.skipped) as u64,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SourceReport, FailureKind)> {
        self.sources
            .iter()
            .filter_map(|s| s.outcome.failure_kind().map(|kind| (s, kind)))
    }

    /// Process exit code for one-shot modes
    ///
    /// | Status | Code |
    /// |--------|------|
    /// | completed, partial | 0 |
    /// | failed | 2 |
    /// | interrupted | 130 |
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Completed | RunStatus::Partial | RunStatus::Running => 0,
            RunStatus::Failed => 2,
            RunStatus::Interrupted => 130,
        }
    }
}

/// Derives a run status from source outcomes
///
/// A breaker-open skip counts as a failure here even though it leaves the
/// schedule untouched.
pub fn status_from(sources: &[SourceReport], interrupted: bool) -> RunStatus {
    if interrupted {
        return RunStatus::Interrupted;
    }

    let ok = sources.iter().filter(|s| s.is_success()).count();
    match (ok, sources.len()) {
        (_, 0) => RunStatus::Completed,
        (ok, total) if ok == total => RunStatus::Completed,
        (0, _) => RunStatus::Failed,
        _ => RunStatus::Partial,
    }
}

/// Prints a run report to stdout
pub fn print_run_report(report: &RunReport) {
    println!(
        "=== Run {} ({}) : {} in {:.1}s ===\n",
        report.run_id,
        report.mode.to_db_string(),
        report.status,
        report.elapsed.as_secs_f64()
    );

    for source in &report.sources {
        let kind = if source.escalated {
            format!("{} (escalated)", source.kind)
        } else {
            source.kind.to_string()
        };

        match &source.outcome {
            JobOutcome::Ingested(counts) => println!(
                "  {:<20} {:<30} ok: {} rows, {} new, {} changed, {} unchanged, {} invalid, {} skipped",
                source.source,
                kind,
                counts.rows,
                counts.new,
                counts.changed,
                counts.unchanged,
                counts.invalid,
                counts.skipped
            ),
            JobOutcome::Unchanged => {
                println!("  {:<20} {:<30} ok: no new filings", source.source, kind)
            }
            JobOutcome::Failed { kind: failure, message } => println!(
                "  {:<20} {:<30} FAILED [{}]: {}",
                source.source, kind, failure, message
            ),
        }
    }

    let totals = report.totals();
    println!();
    println!(
        "Sources: {} ok, {} failed. Records: {} new, {} changed, {} skipped.",
        totals.sources_ok,
        totals.sources_failed,
        totals.records_new,
        totals.records_changed,
        totals.records_skipped
    );
}
