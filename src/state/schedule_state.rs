use crate::state::JobKind;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Tracks when a source was last polled and what it looked like
///
/// Persisted in the `source_state` table so cadences survive restarts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleState {
    pub source_name: String,

    /// SHA-256 of the page body seen on the last full refresh
    pub last_content_hash: Option<String>,

    /// Natural-key hash of the newest filing seen on the page
    pub newest_trade_hash: Option<String>,

    pub last_full_refresh_at: Option<DateTime<Utc>>,
    pub last_change_check_at: Option<DateTime<Utc>>,

    /// Last job that ended without a terminal failure
    pub last_success_at: Option<DateTime<Utc>>,
}

impl ScheduleState {
    pub fn new(source_name: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            ..Self::default()
        }
    }

    /// Returns the job this source is due for, if any
    ///
    /// A full refresh wins over a change check. A full refresh also counts as a
    /// change check, so the check cadence restarts after it.
    ///
    /// # Arguments
    ///
    /// * `now` - The current wall-clock time
    /// * `change_interval` - Change-detection cadence
    /// * `full_interval` - Full-refresh cadence
    pub fn due(
        &self,
        now: DateTime<Utc>,
        change_interval: Duration,
        full_interval: Duration,
    ) -> Option<JobKind> {
        if is_elapsed(self.last_full_refresh_at, now, full_interval) {
            return Some(JobKind::FullRefresh);
        }

        if is_elapsed(self.last_polled_at(), now, change_interval) {
            return Some(JobKind::ChangeDetection);
        }

        None
    }

    /// Calculates the time until this source is next due
    ///
    /// Returns `Duration::ZERO` if it is due now.
    pub fn time_until_due(
        &self,
        now: DateTime<Utc>,
        change_interval: Duration,
        full_interval: Duration,
    ) -> Duration {
        let full = remaining(self.last_full_refresh_at, now, full_interval);
        let change = remaining(self.last_polled_at(), now, change_interval);
        full.min(change)
    }

    /// Records a successful full refresh
    pub fn record_full_refresh(
        &mut self,
        now: DateTime<Utc>,
        content_hash: Option<String>,
        newest_trade_hash: Option<String>,
    ) {
        self.last_full_refresh_at = Some(now);
        self.last_change_check_at = Some(now);
        self.last_success_at = Some(now);
        if content_hash.is_some() {
            self.last_content_hash = content_hash;
        }
        if newest_trade_hash.is_some() {
            self.newest_trade_hash = newest_trade_hash;
        }
    }

    /// Records a successful change check that found nothing new
    pub fn record_change_check(&mut self, now: DateTime<Utc>) {
        self.last_change_check_at = Some(now);
        self.last_success_at = Some(now);
    }

    /// Records a polled page that could not be used
    ///
    /// Moves the timers of the job's cadence without marking a success or
    /// touching the stored hashes, so a changed page is retried once per
    /// cadence.
    pub fn record_unusable_poll(&mut self, now: DateTime<Utc>, kind: JobKind) {
        if kind == JobKind::FullRefresh {
            self.last_full_refresh_at = Some(now);
        }
        self.last_change_check_at = Some(now);
    }

    fn last_polled_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_change_check_at, self.last_full_refresh_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

fn is_elapsed(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    remaining(last, now, interval).is_zero()
}

fn remaining(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> Duration {
    let Some(last) = last else {
        return Duration::ZERO;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}
