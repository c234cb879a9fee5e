//! Shared circuit breaker for one source
//!
//! Wraps [`BreakerState`] in a mutex so concurrent workers can consult and update
//! it, and logs every transition.

use crate::state::{Admission, BreakerState, Transition};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct CircuitBreaker {
    source_name: String,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for a source
    ///
    /// # Arguments
    ///
    /// * `source_name` - Source this breaker guards (used in log events)
    /// * `threshold` - Consecutive failures before opening
    /// * `cooldown` - Initial open period
    pub fn new(source_name: &str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            source_name: source_name.to_string(),
            state: Mutex::new(BreakerState::new(threshold, cooldown, Instant::now())),
        }
    }

    /// Asks for permission to send a request
    ///
    /// # Returns
    ///
    /// * `Ok(Admission::Allowed | Admission::Probe)` - Go ahead
    /// * `Err(retry_in)` - Short-circuited; no request may be sent
    pub fn try_acquire(&self) -> Result<Admission, Duration> {
        let (admission, transition) = self.lock().admit(Instant::now());
        self.log_transition(transition);
        match admission {
            Admission::Rejected { retry_in } => {
                tracing::debug!(source = %self.source_name, ?retry_in, "Circuit open, request short-circuited");
                Err(retry_in)
            }
            admitted => Ok(admitted),
        }
    }

    pub fn record_success(&self) {
        let transition = self.lock().on_success(Instant::now());
        self.log_transition(transition);
    }

    pub fn record_failure(&self) {
        let transition = self.lock().on_failure(Instant::now());
        self.log_transition(transition);
    }

    /// Gives back a probe that ended without a verdict
    pub fn release_probe(&self) {
        self.lock().release_probe();
    }

    /// Returns a copy of the current state
    pub fn snapshot(&self) -> BreakerState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_transition(&self, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            tracing::warn!(
                source = %self.source_name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker transition"
            );
        }
    }
}
