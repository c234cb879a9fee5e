//! Statistics generation from the filings database
//!
//! This module backs the `db-health` command.

use crate::state::ScheduleState;
use crate::storage::{RunRecord, Storage, StorageResult};
use chrono::NaiveDateTime;

/// Store statistics summary
#[derive(Debug, Clone)]
pub struct HarvestStatistics {
    /// Stored rows, revisions included
    pub total_rows: u64,

    /// Distinct natural keys
    pub distinct_filings: u64,

    /// Rows per source
    pub rows_by_source: Vec<(String, u64)>,

    pub latest_filing: Option<NaiveDateTime>,
    pub schedule: Vec<ScheduleState>,
    pub last_run: Option<RunRecord>,
}

impl HarvestStatistics {
    /// Rows that are second or later revisions of a filing
    pub fn revisions(&self) -> u64 {
        self.total_rows.saturating_sub(self.distinct_filings)
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(HarvestStatistics)` - Successfully loaded statistics
/// * `Err(StorageError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage) -> StorageResult<HarvestStatistics> {
    Ok(HarvestStatistics {
        total_rows: storage.count_trades()?,
        distinct_filings: storage.count_distinct_hashes()?,
        rows_by_source: storage.count_by_source()?,
        latest_filing: storage.latest_filing_date()?,
        schedule: storage.load_source_states()?,
        last_run: storage.get_latest_run()?,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &HarvestStatistics) {
    println!("=== Store Statistics ===\n");

    println!("Overview:");
    println!("  Stored rows: {}", stats.total_rows);
    println!("  Distinct filings: {}", stats.distinct_filings);
    println!("  Revision rows: {}", stats.revisions());
    match stats.latest_filing {
        Some(latest) => println!("  Latest filing: {}", latest),
        None => println!("  Latest filing: none"),
    }
    println!();

    if !stats.rows_by_source.is_empty() {
        println!("Rows by Source:");
        for (source, count) in &stats.rows_by_source {
            let percentage = if stats.total_rows > 0 {
                (*count as f64 / stats.total_rows as f64) * 100.0
            } else {
                0.0
            };
            println!("  {}: {} ({:.1}%)", source, count, percentage);
        }
        println!();
    }

    if !stats.schedule.is_empty() {
        println!("Schedule:");
        for state in &stats.schedule {
            println!(
                "  {}: full refresh {}, change check {}, last success {}",
                state.source_name,
                format_time(state.last_full_refresh_at),
                format_time(state.last_change_check_at),
                format_time(state.last_success_at)
            );
        }
        println!();
    }

    match &stats.last_run {
        Some(run) => println!(
            "Last Run: #{} {} {} (started {}, {} ok / {} failed sources, {} new records)",
            run.id,
            run.mode.to_db_string(),
            run.status,
            run.started_at,
            run.totals.sources_ok,
            run.totals.sources_failed,
            run.totals.records_new
        ),
        None => println!("Last Run: none"),
    }
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}
