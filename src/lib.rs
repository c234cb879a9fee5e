//! Insider-Harvest: a resilient insider-trading filings scraper
//!
//! This crate acquires insider-trading filings from an HTML-only source, normalizes
//! them into typed records and persists them without duplication. The source is
//! rate-sensitive, occasionally challenges automated clients and may change its
//! markup without notice, so every stage degrades per source instead of per run.

pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use std::time::Duration;
use thiserror::Error;

/// Main error type for run-level failures
///
/// Only configuration, startup and storage-connectivity problems surface here.
/// Per-source fetch and parse failures are recorded in the run report instead.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

/// Classified fetch failures
///
/// The variant decides what happens next: transient failures were already retried,
/// blocked pages already went through the fallback renderer, and everything here is
/// terminal for the current job.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Circuit open for source {source_name}, retry in {retry_in:?}")]
    CircuitOpen {
        source_name: String,
        retry_in: Duration,
    },

    #[error("Transient failure for {url} after {attempts} attempt(s): {reason}")]
    Transient {
        url: String,
        reason: String,
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("Permanent failure for {url}: HTTP {status}")]
    Permanent { url: String, status: u16 },

    #[error("Blocked by bot challenge at {url}: {reason}")]
    Blocked { url: String, reason: String },

    #[error("Browser rendering failed for {url}: {message}")]
    Browser { url: String, message: String },

    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),

    #[error("Fetch cancelled for {url}")]
    Cancelled { url: String },
}

impl FetchError {
    /// Maps this error onto the run-level failure taxonomy
    pub fn kind(&self) -> state::FailureKind {
        use state::FailureKind;
        match self {
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Transient { .. } => FailureKind::TransientNetwork,
            Self::Permanent { .. } | Self::InvalidUrl(_) => FailureKind::Permanent,
            Self::Blocked { .. } | Self::Browser { .. } => FailureKind::Blocked,
            Self::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}

/// Table parsing and record validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// The expected table is missing entirely, which usually means the site changed
    #[error("Structural failure: table '{table_id}' {message}")]
    Structural { table_id: String, message: String },

    /// A single row had a required field that could not be parsed
    #[error("Validation failure in field '{field}': {message}")]
    Validation { field: &'static str, message: String },
}

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::{Settings, Source};
pub use crawler::{Coordinator, Scheduler};
pub use state::{FailureKind, JobKind, JobOutcome};
pub use storage::TradeRecord;
