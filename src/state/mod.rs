//! State module for tracking acquisition progress
//!
//! This module provides state management for sources and jobs during a run.
//!
//! # Components
//!
//! - `BreakerState`: Per-source circuit breaker state machine (closed, open, half-open)
//! - `ScheduleState`: Per-source cadence timestamps and last-seen content hashes
//! - `FetchJob` / `JobOutcome`: One acquisition attempt and how it ended

mod breaker_state;
mod job;
mod schedule_state;

// Re-export main types
pub use breaker_state::{Admission, BreakerState, CircuitState, Transition};
pub use job::{FailureKind, FetchJob, IngestCounts, JobKind, JobOutcome};
pub use schedule_state::ScheduleState;
