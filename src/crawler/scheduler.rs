//! Monitor loop for continuous acquisition
//!
//! This module handles:
//! - Deciding which sources are due for change detection or a full refresh
//! - Skipping sources whose breaker is still open
//! - Sleeping until the next source is due, or until cancelled

use crate::crawler::coordinator::{breaker_wait, Coordinator};
use crate::state::{JobKind, ScheduleState};
use crate::storage::RunMode;
use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Minimum sleep between passes, so failing sources cannot spin the loop
const DEFAULT_IDLE_FLOOR: Duration = Duration::from_secs(5);

/// Drives passes on the change-detection and full-refresh cadences
pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    change_interval: Duration,
    full_interval: Duration,
    idle_floor: Duration,
}

impl Scheduler {
    /// Creates a scheduler with explicit cadences
    pub fn new(coordinator: Arc<Coordinator>, change_interval: Duration, full_interval: Duration) -> Self {
        Self {
            coordinator,
            change_interval,
            full_interval,
            idle_floor: DEFAULT_IDLE_FLOOR,
        }
    }

    /// Creates a scheduler with the configured cadences
    pub fn from_settings(coordinator: Arc<Coordinator>) -> Self {
        let monitoring = &coordinator.settings().monitoring;
        let (change, full) = (
            monitoring.change_detection_interval(),
            monitoring.full_refresh_interval(),
        );
        Self::new(coordinator, change, full)
    }

    pub fn with_idle_floor(mut self, floor: Duration) -> Self {
        self.idle_floor = floor;
        self
    }

    /// Runs passes until the coordinator's cancellation token fires
    ///
    /// # Returns
    ///
    /// * `Ok(passes)` - Number of passes run before cancellation
    /// * `Err(HarvestError)` - A pass hit a fatal storage error
    pub async fn run(&self) -> Result<u64, HarvestError> {
        let cancel = self.coordinator.cancel_token().clone();
        let names: Vec<String> = self
            .coordinator
            .settings()
            .enabled_sources()
            .into_iter()
            .map(|s| s.name)
            .collect();
        let mut passes = 0;

        tracing::info!(
            sources = names.len(),
            change_interval = ?self.change_interval,
            full_interval = ?self.full_interval,
            "Monitor started"
        );

        while !cancel.is_cancelled() {
            let states = self.coordinator.load_schedule(names.clone()).await?;
            let jobs = due_jobs(
                &states,
                Utc::now(),
                self.change_interval,
                self.full_interval,
                |name| self.breaker_wait(name),
            );

            if !jobs.is_empty() {
                let report = self.coordinator.run_pass(RunMode::Monitor, jobs).await?;
                passes += 1;
                tracing::info!(
                    run_id = report.run_id,
                    status = %report.status,
                    new = report.counts().new,
                    "Monitor pass finished"
                );
            }

            let states = self.coordinator.load_schedule(names.clone()).await?;
            let wait = next_wake(
                &states,
                Utc::now(),
                self.change_interval,
                self.full_interval,
                |name| self.breaker_wait(name),
            )
            .max(self.idle_floor);

            tracing::debug!(?wait, "Sleeping until next source is due");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(passes, "Monitor stopped");
        Ok(passes)
    }

    fn breaker_wait(&self, source_name: &str) -> Option<Duration> {
        self.coordinator.context(source_name).and_then(|ctx| breaker_wait(ctx))
    }
}

/// Selects the sources due now and the kind of job each needs
///
/// Sources whose breaker is still cooling down are left out; their timers are
/// untouched, so they come due again as soon as the breaker admits a probe.
pub fn due_jobs(
    states: &[ScheduleState],
    now: DateTime<Utc>,
    change_interval: Duration,
    full_interval: Duration,
    breaker_wait: impl Fn(&str) -> Option<Duration>,
) -> Vec<(String, JobKind)> {
    states
        .iter()
        .filter(|state| breaker_wait(&state.source_name).is_none())
        .filter_map(|state| {
            state
                .due(now, change_interval, full_interval)
                .map(|kind| (state.source_name.clone(), kind))
        })
        .collect()
}

/// Calculates how long until any source is due
///
/// A source behind an open breaker counts as due when the breaker reopens for
/// a probe. Returns `Duration::ZERO` with no sources.
pub fn next_wake(
    states: &[ScheduleState],
    now: DateTime<Utc>,
    change_interval: Duration,
    full_interval: Duration,
    breaker_wait: impl Fn(&str) -> Option<Duration>,
) -> Duration {
    states
        .iter()
        .map(|state| {
            let due_in = state.time_until_due(now, change_interval, full_interval);
            match breaker_wait(&state.source_name) {
                Some(wait) => due_in.max(wait),
                None => due_in,
            }
        })
        .min()
        .unwrap_or(Duration::ZERO)
}
