//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.
//! Each worker opens its own `SqliteStorage`; writers serialize on SQLite's
//! immediate transactions and readers run concurrently under WAL.

use crate::state::ScheduleState;
use crate::storage::dedup::{resolve, Resolution};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    RunMode, RunRecord, RunStatus, RunTotals, StoredTrade, TradeCode, TradeRecord, UpsertSummary,
    DATETIME_FORMAT, DATE_FORMAT,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const TRADE_COLUMNS: &str = "id, hash_id, revision, filing_date, trade_date, ticker, company_name, \
     insider_name, title, trade_type, price, quantity, owned, delta_own, value, form_url, source, scraped_at";

const RUN_COLUMNS: &str = "id, mode, started_at, finished_at, status, sources_ok, sources_failed, \
     records_new, records_changed, records_skipped";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens or creates the database at `path`
    ///
    /// Creates the parent directory if needed, applies connection pragmas and
    /// initializes the schema.
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - The store is unreachable
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Storage for SqliteStorage {
    // ===== Trades =====

    fn upsert_batch(&mut self, records: &[TradeRecord], batch_size: usize) -> StorageResult<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        let mut seen = HashSet::new();

        for chunk in records.chunks(batch_size.max(1)) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let scraped_at = Utc::now().to_rfc3339();
            let mut chunk_summary = UpsertSummary::default();

            for record in chunk {
                if !seen.insert(record.hash_id.as_str()) {
                    tracing::debug!(hash = %record.hash_id, "Duplicate natural key within batch, skipping");
                    chunk_summary.skipped += 1;
                    continue;
                }

                let revision = match resolve(&tx, record)? {
                    Resolution::Unchanged => {
                        chunk_summary.unchanged += 1;
                        continue;
                    }
                    Resolution::New => 1,
                    Resolution::Changed { revision } => revision,
                };

                match insert_trade(&tx, record, revision, &scraped_at) {
                    Ok(()) if revision == 1 => chunk_summary.inserted_new += 1,
                    Ok(()) => chunk_summary.inserted_changed += 1,
                    Err(e) if is_constraint_violation(&e) => {
                        tracing::warn!(
                            source = %record.source,
                            ticker = %record.ticker,
                            error = %e,
                            "Constraint violation, skipping record"
                        );
                        chunk_summary.skipped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            tx.commit()?;
            summary.add(&chunk_summary);
        }

        Ok(summary)
    }

    fn exists_by_hash(&self, hash_id: &str) -> StorageResult<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM trades WHERE hash_id = ?1)",
            params![hash_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn fetch_by_hash(&self, hash_id: &str) -> StorageResult<Option<StoredTrade>> {
        latest_revision(&self.conn, hash_id)
    }

    fn fetch_revisions(&self, hash_id: &str) -> StorageResult<Vec<StoredTrade>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM trades WHERE hash_id = ?1 ORDER BY revision",
            TRADE_COLUMNS
        ))?;
        let trades = stmt
            .query_map(params![hash_id], read_trade)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    fn trades_for_source_between(
        &self,
        source: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<StoredTrade>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM trades
             WHERE source = ?1 AND filing_date >= ?2 AND substr(filing_date, 1, 10) <= ?3
             ORDER BY filing_date, id",
            TRADE_COLUMNS
        ))?;
        let trades = stmt
            .query_map(
                params![
                    source,
                    from.format(DATE_FORMAT).to_string(),
                    to.format(DATE_FORMAT).to_string()
                ],
                read_trade,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    // ===== Schedule State =====

    fn load_source_state(&self, source_name: &str) -> StorageResult<ScheduleState> {
        let state = self
            .conn
            .query_row(
                "SELECT source_name, last_content_hash, newest_trade_hash, last_full_refresh_at,
                        last_change_check_at, last_success_at
                 FROM source_state WHERE source_name = ?1",
                params![source_name],
                read_schedule_state,
            )
            .optional()?;
        Ok(state.unwrap_or_else(|| ScheduleState::new(source_name)))
    }

    fn load_source_states(&self) -> StorageResult<Vec<ScheduleState>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_name, last_content_hash, newest_trade_hash, last_full_refresh_at,
                    last_change_check_at, last_success_at
             FROM source_state ORDER BY source_name",
        )?;
        let states = stmt
            .query_map([], read_schedule_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    fn save_source_state(&mut self, state: &ScheduleState) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO source_state (source_name, last_content_hash, newest_trade_hash,
                 last_full_refresh_at, last_change_check_at, last_success_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_name) DO UPDATE SET
                 last_content_hash = excluded.last_content_hash,
                 newest_trade_hash = excluded.newest_trade_hash,
                 last_full_refresh_at = excluded.last_full_refresh_at,
                 last_change_check_at = excluded.last_change_check_at,
                 last_success_at = excluded.last_success_at",
            params![
                state.source_name,
                state.last_content_hash,
                state.newest_trade_hash,
                state.last_full_refresh_at.map(|t| t.to_rfc3339()),
                state.last_change_check_at.map(|t| t.to_rfc3339()),
                state.last_success_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    // ===== Run Management =====

    fn create_run(&mut self, mode: RunMode) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (mode, started_at, status) VALUES (?1, ?2, ?3)",
            params![mode.to_db_string(), now, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finish_run(&mut self, run_id: i64, status: RunStatus, totals: &RunTotals) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, sources_ok = ?3, sources_failed = ?4,
                 records_new = ?5, records_changed = ?6, records_skipped = ?7
             WHERE id = ?8",
            params![
                status.to_db_string(),
                now,
                totals.sources_ok as i64,
                totals.sources_failed as i64,
                totals.records_new as i64,
                totals.records_changed as i64,
                totals.records_skipped as i64,
                run_id
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                read_run,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS),
                [],
                read_run,
            )
            .optional()?;
        Ok(run)
    }

    // ===== Statistics =====

    fn count_trades(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_distinct_hashes(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(DISTINCT hash_id) FROM trades", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_by_source(&self) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT source, COUNT(*) FROM trades GROUP BY source ORDER BY source")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    fn latest_filing_date(&self) -> StorageResult<Option<NaiveDateTime>> {
        let latest: Option<String> = self
            .conn
            .query_row("SELECT MAX(filing_date) FROM trades", [], |row| row.get(0))?;
        latest
            .map(|s| {
                NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).map_err(|e| StorageError::CorruptRow {
                    table: "trades",
                    message: e.to_string(),
                })
            })
            .transpose()
    }
}

/// Gets the latest stored revision for a natural key
pub(super) fn latest_revision(conn: &Connection, hash_id: &str) -> StorageResult<Option<StoredTrade>> {
    let trade = conn
        .query_row(
            &format!(
                "SELECT {} FROM trades WHERE hash_id = ?1 ORDER BY revision DESC LIMIT 1",
                TRADE_COLUMNS
            ),
            params![hash_id],
            read_trade,
        )
        .optional()?;
    Ok(trade)
}

fn insert_trade(
    conn: &Connection,
    record: &TradeRecord,
    revision: u32,
    scraped_at: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO trades (hash_id, revision, filing_date, trade_date, ticker, company_name,
             insider_name, title, trade_type, price, quantity, owned, delta_own, value, form_url,
             source, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            record.hash_id,
            revision,
            record.filing_date.format(DATETIME_FORMAT).to_string(),
            record.trade_date.format(DATE_FORMAT).to_string(),
            record.ticker,
            record.company_name,
            record.insider_name,
            record.title,
            record.trade_code.as_str(),
            record.price,
            record.quantity,
            record.owned,
            record.delta_own,
            record.value,
            record.form_url,
            record.source,
            scraped_at,
        ],
    )?;
    Ok(())
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn read_trade(row: &Row<'_>) -> rusqlite::Result<StoredTrade> {
    let filing_date: String = row.get(3)?;
    let trade_date: String = row.get(4)?;
    let trade_code: String = row.get(9)?;

    Ok(StoredTrade {
        id: row.get(0)?,
        revision: row.get(2)?,
        scraped_at: row.get(17)?,
        record: TradeRecord {
            hash_id: row.get(1)?,
            filing_date: conversion(3, NaiveDateTime::parse_from_str(&filing_date, DATETIME_FORMAT))?,
            trade_date: conversion(4, NaiveDate::parse_from_str(&trade_date, DATE_FORMAT))?,
            ticker: row.get(5)?,
            company_name: row.get(6)?,
            insider_name: row.get(7)?,
            title: row.get(8)?,
            trade_code: TradeCode::from_db_string(&trade_code),
            price: row.get(10)?,
            quantity: row.get(11)?,
            owned: row.get(12)?,
            delta_own: row.get(13)?,
            value: row.get(14)?,
            form_url: row.get(15)?,
            source: row.get(16)?,
        },
    })
}

fn read_schedule_state(row: &Row<'_>) -> rusqlite::Result<ScheduleState> {
    Ok(ScheduleState {
        source_name: row.get(0)?,
        last_content_hash: row.get(1)?,
        newest_trade_hash: row.get(2)?,
        last_full_refresh_at: read_timestamp(row, 3)?,
        last_change_check_at: read_timestamp(row, 4)?,
        last_success_at: read_timestamp(row, 5)?,
    })
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let mode: String = row.get(1)?;
    let status: String = row.get(4)?;

    Ok(RunRecord {
        id: row.get(0)?,
        mode: RunMode::from_db_string(&mode).unwrap_or(RunMode::Full),
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: RunStatus::from_db_string(&status).unwrap_or(RunStatus::Running),
        totals: RunTotals {
            sources_ok: row.get::<_, i64>(5)? as u64,
            sources_failed: row.get::<_, i64>(6)? as u64,
            records_new: row.get::<_, i64>(7)? as u64,
            records_changed: row.get::<_, i64>(8)? as u64,
            records_skipped: row.get::<_, i64>(9)? as u64,
        },
    })
}

fn read_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(index)?;
    value
        .map(|s| conversion(index, DateTime::parse_from_rfc3339(&s)).map(|t| t.with_timezone(&Utc)))
        .transpose()
}

fn conversion<T>(index: usize, parsed: Result<T, chrono::ParseError>) -> rusqlite::Result<T> {
    parsed.map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}
