//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::ScheduleState;
use crate::storage::{RunMode, RunRecord, RunStatus, RunTotals, StoredTrade, TradeRecord, UpsertSummary};
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Errors that can occur during storage operations
///
/// Any of these reaching the coordinator is fatal for the run. Constraint
/// violations on single records are absorbed by `upsert_batch`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
pub trait Storage {
    // ===== Trades =====

    /// Resolves and inserts records, one transaction per `batch_size` chunk
    ///
    /// New records are inserted as revision 1, changed records as the next
    /// revision, unchanged records are counted and dropped. A constraint
    /// violation skips that record and the transaction continues.
    ///
    /// # Errors
    ///
    /// Any other database failure rolls back the current chunk.
    fn upsert_batch(&mut self, records: &[TradeRecord], batch_size: usize) -> StorageResult<UpsertSummary>;

    /// Checks whether any revision exists for a natural key
    fn exists_by_hash(&self, hash_id: &str) -> StorageResult<bool>;

    /// Gets the latest revision for a natural key
    fn fetch_by_hash(&self, hash_id: &str) -> StorageResult<Option<StoredTrade>>;

    /// Gets every revision for a natural key, oldest first
    fn fetch_revisions(&self, hash_id: &str) -> StorageResult<Vec<StoredTrade>>;

    /// Gets trades recorded by a source with a filing date in `[from, to]`
    fn trades_for_source_between(
        &self,
        source: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<StoredTrade>>;

    // ===== Schedule State =====

    /// Loads a source's schedule state, or a fresh one if never saved
    fn load_source_state(&self, source_name: &str) -> StorageResult<ScheduleState>;

    /// Loads every saved schedule state, ordered by source name
    fn load_source_states(&self) -> StorageResult<Vec<ScheduleState>>;

    fn save_source_state(&mut self, state: &ScheduleState) -> StorageResult<()>;

    // ===== Run Management =====

    /// Creates a new run in the `running` state
    fn create_run(&mut self, mode: RunMode) -> StorageResult<i64>;

    /// Marks a run finished with its final status and totals
    fn finish_run(&mut self, run_id: i64, status: RunStatus, totals: &RunTotals) -> StorageResult<()>;

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    // ===== Statistics =====

    /// Counts stored rows, revisions included
    fn count_trades(&self) -> StorageResult<u64>;

    /// Counts distinct natural keys
    fn count_distinct_hashes(&self) -> StorageResult<u64>;

    /// Counts rows per source, ordered by source name
    fn count_by_source(&self) -> StorageResult<Vec<(String, u64)>>;

    fn latest_filing_date(&self) -> StorageResult<Option<NaiveDateTime>>;
}
