//! Output module for run reports and store statistics
//!
//! This module handles:
//! - Summarizing a run's per-source outcomes and deriving its status
//! - Printing store statistics for `db-health`

pub mod report;
pub mod stats;

pub use report::{print_run_report, status_from, RunReport, SourceReport};
pub use stats::{load_statistics, print_statistics, HarvestStatistics};
