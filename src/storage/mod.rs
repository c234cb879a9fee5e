//! Storage module for persisting filings
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Deduplicating, append-only trade upserts
//! - Per-source schedule state persistence
//! - Run tracking

mod dedup;
mod schema;
mod sqlite;
mod traits;

pub use dedup::{resolve, Resolution};
pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

/// Storage format for filing timestamps
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Storage format for trade dates
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// SEC transaction code of a filing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeCode {
    Purchase,
    Sale,
    /// Sale following an option exercise (`S - Sale+OE`)
    SaleAfterExercise,
    Gift,
    Award,
    Disposition,
    OptionExercise,
    DerivativeExercise,
    TaxWithholding,
    Conversion,
    Inheritance,
    Unknown,
}

impl TradeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "P",
            Self::Sale => "S",
            Self::SaleAfterExercise => "S+",
            Self::Gift => "G",
            Self::Award => "A",
            Self::Disposition => "D",
            Self::OptionExercise => "M",
            Self::DerivativeExercise => "X",
            Self::TaxWithholding => "F",
            Self::Conversion => "C",
            Self::Inheritance => "W",
            Self::Unknown => "UNK",
        }
    }

    /// Parses a stored code; unrecognized values map to `Unknown`
    pub fn from_db_string(s: &str) -> Self {
        match s {
            "P" => Self::Purchase,
            "S" => Self::Sale,
            "S+" => Self::SaleAfterExercise,
            "G" => Self::Gift,
            "A" => Self::Award,
            "D" => Self::Disposition,
            "M" => Self::OptionExercise,
            "X" => Self::DerivativeExercise,
            "F" => Self::TaxWithholding,
            "C" => Self::Conversion,
            "W" => Self::Inheritance,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TradeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized filing
///
/// Records are immutable once built; a changed filing is stored as a new
/// revision under the same `hash_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    /// Natural-key hash, the only dedup identity
    pub hash_id: String,
    pub insider_name: String,
    pub title: Option<String>,
    pub ticker: String,
    pub company_name: Option<String>,
    pub filing_date: NaiveDateTime,
    pub trade_date: NaiveDate,
    pub trade_code: TradeCode,
    pub price: Option<f64>,
    pub quantity: Option<i64>,
    pub owned: Option<i64>,
    /// Ownership change as a fraction (0.05 for `+5%`)
    pub delta_own: Option<f64>,
    pub value: Option<f64>,
    pub form_url: Option<String>,
    pub source: String,
}

impl TradeRecord {
    /// Compares every field except `source`
    ///
    /// The same filing is listed by several sources; seeing it elsewhere is not
    /// a change.
    pub fn same_content(&self, other: &TradeRecord) -> bool {
        self.hash_id == other.hash_id
            && self.insider_name == other.insider_name
            && self.title == other.title
            && self.ticker == other.ticker
            && self.company_name == other.company_name
            && self.filing_date == other.filing_date
            && self.trade_date == other.trade_date
            && self.trade_code == other.trade_code
            && self.price == other.price
            && self.quantity == other.quantity
            && self.owned == other.owned
            && self.delta_own == other.delta_own
            && self.value == other.value
            && self.form_url == other.form_url
    }
}

/// A persisted revision of a filing
#[derive(Debug, Clone)]
pub struct StoredTrade {
    pub id: i64,
    pub revision: u32,
    pub scraped_at: String,
    pub record: TradeRecord,
}

/// Counts from one `upsert_batch` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted_new: u64,
    pub inserted_changed: u64,
    pub unchanged: u64,
    /// Constraint violations and in-batch duplicates
    pub skipped: u64,
}

impl UpsertSummary {
    pub fn inserted(&self) -> u64 {
        self.inserted_new + self.inserted_changed
    }

    pub fn add(&mut self, other: &UpsertSummary) {
        self.inserted_new += other.inserted_new;
        self.inserted_changed += other.inserted_changed;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
    }
}

/// What a run was started for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Check,
    Monitor,
}

impl RunMode {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Check => "check",
            Self::Monitor => "monitor",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "check" => Some(Self::Check),
            "monitor" => Some(Self::Monitor),
            _ => None,
        }
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    /// Every dispatched source succeeded
    Completed,
    /// Some sources failed, at least one succeeded
    Partial,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Totals written when a run finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub sources_ok: u64,
    pub sources_failed: u64,
    pub records_new: u64,
    pub records_changed: u64,
    pub records_skipped: u64,
}

/// Represents a run in the database
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub mode: RunMode,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub totals: RunTotals,
}
