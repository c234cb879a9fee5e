//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the filings store.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Normalized filings, append-only; a changed filing gets the next revision
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash_id TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 1 CHECK (revision >= 1),
    filing_date TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    ticker TEXT NOT NULL CHECK (length(ticker) > 0),
    company_name TEXT,
    insider_name TEXT NOT NULL CHECK (length(insider_name) > 0),
    title TEXT,
    trade_type TEXT NOT NULL,
    price REAL,
    quantity INTEGER,
    owned INTEGER,
    delta_own REAL,
    value REAL,
    form_url TEXT,
    source TEXT NOT NULL,
    scraped_at TEXT NOT NULL,
    UNIQUE(hash_id, revision)
);

CREATE INDEX IF NOT EXISTS idx_trades_hash ON trades(hash_id);
CREATE INDEX IF NOT EXISTS idx_trades_source_filing ON trades(source, filing_date);
CREATE INDEX IF NOT EXISTS idx_trades_ticker ON trades(ticker);

-- Schedule state per source
CREATE TABLE IF NOT EXISTS source_state (
    source_name TEXT PRIMARY KEY,
    last_content_hash TEXT,
    newest_trade_hash TEXT,
    last_full_refresh_at TEXT,
    last_change_check_at TEXT,
    last_success_at TEXT
);

-- Track runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mode TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    sources_ok INTEGER NOT NULL DEFAULT 0,
    sources_failed INTEGER NOT NULL DEFAULT 0,
    records_new INTEGER NOT NULL DEFAULT 0,
    records_changed INTEGER NOT NULL DEFAULT 0,
    records_skipped INTEGER NOT NULL DEFAULT 0
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
