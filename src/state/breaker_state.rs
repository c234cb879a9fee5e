use std::time::{Duration, Instant};

/// Position of a source's circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,

    /// Requests are rejected without touching the network
    Open,

    /// A single probe request decides whether to close again
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Answer to an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal request while closed
    Allowed,

    /// The single half-open probe
    Probe,

    /// Rejected; the breaker may admit a probe after this long
    Rejected { retry_in: Duration },
}

/// A state change worth logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Tracks the breaker state of one source
///
/// All mutation goes through [`admit`](Self::admit), [`on_success`](Self::on_success)
/// and [`on_failure`](Self::on_failure). Each takes the current instant so the
/// machine can be driven deterministically.
#[derive(Debug, Clone)]
pub struct BreakerState {
    /// Current position of the breaker
    pub state: CircuitState,

    /// Failures since the last success while closed
    pub consecutive_failures: u32,

    /// When the state last changed
    pub last_transition: Instant,

    /// How long the breaker stays open before admitting a probe
    pub cooldown: Duration,

    /// Whether the half-open probe has been handed out
    pub probe_in_flight: bool,

    threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
}

/// Multiplier cap for repeated half-open failures
const MAX_COOLDOWN_FACTOR: u32 = 8;

impl BreakerState {
    /// Creates a closed breaker
    ///
    /// # Arguments
    ///
    /// * `threshold` - Consecutive failures that open the breaker
    /// * `cooldown` - Initial open period
    /// * `now` - The current time instant
    pub fn new(threshold: u32, cooldown: Duration, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_transition: now,
            cooldown,
            probe_in_flight: false,
            threshold: threshold.max(1),
            base_cooldown: cooldown,
            max_cooldown: cooldown.saturating_mul(MAX_COOLDOWN_FACTOR),
        }
    }

    /// Decides whether a request may go out now
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open and hands
    /// out exactly one probe; later callers are rejected until that probe reports.
    pub fn admit(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(self.last_transition);
                if elapsed >= self.cooldown {
                    let transition = self.transition(CircuitState::HalfOpen, now);
                    self.probe_in_flight = true;
                    (Admission::Probe, transition)
                } else {
                    (
                        Admission::Rejected {
                            retry_in: self.cooldown - elapsed,
                        },
                        None,
                    )
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    (
                        Admission::Rejected {
                            retry_in: Duration::ZERO,
                        },
                        None,
                    )
                } else {
                    self.probe_in_flight = true;
                    (Admission::Probe, None)
                }
            }
        }
    }

    /// Records a successful request
    pub fn on_success(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures = 0;
                self.cooldown = self.base_cooldown;
                self.probe_in_flight = false;
                self.transition(CircuitState::Closed, now)
            }
            // A straggler admitted before the breaker opened
            CircuitState::Open => None,
        }
    }

    /// Records a terminal request failure
    pub fn on_failure(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.cooldown = self.base_cooldown;
                    self.transition(CircuitState::Open, now)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.cooldown = self.cooldown.saturating_mul(2).min(self.max_cooldown);
                self.transition(CircuitState::Open, now)
            }
            CircuitState::Open => None,
        }
    }

    /// Releases a probe that ended without a verdict (e.g. cancellation)
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Returns true while requests are being short-circuited
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Time left before an open breaker admits a probe, without mutating state
    pub fn open_remaining(&self, now: Instant) -> Option<Duration> {
        if !self.is_open() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_transition);
        Some(self.cooldown.saturating_sub(elapsed)).filter(|d| !d.is_zero())
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        self.last_transition = now;
        (from != to).then_some(Transition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_breaker(now: Instant) -> BreakerState {
        BreakerState::new(3, Duration::from_secs(60), now)
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let now = Instant::now();
        let mut breaker = create_test_breaker(now);
        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures, 0);
        assert_eq!(breaker.admit(now).0, Admission::Allowed);
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let now = Instant::now();
        let mut breaker = create_test_breaker(now);

        assert!(breaker.on_failure(now).is_none());
        assert!(breaker.on_failure(now).is_none());
        assert_eq!(breaker.state, CircuitState::Closed);

        let transition = breaker.on_failure(now);
        assert_eq!(
            transition,
            Some(Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            })
        );
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let now = Instant::now();
        let mut breaker = create_test_breaker(now);

        breaker.on_failure(now);
        breaker.on_failure(now);
        breaker.on_success(now);
        breaker.on_failure(now);
        breaker.on_failure(now);

        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures, 2);
    }

    #[test]
    fn test_rejects_while_open() {
        let now = Instant::now();
        let mut breaker = create_test_breaker(now);
        for _ in 0..3 {
            breaker.on_failure(now);
        }

        for offset in [0, 1, 30, 59] {
            let (admission, _) = breaker.admit(now + Duration::from_secs(offset));
            assert!(matches!(admission, Admission::Rejected { .. }));
        }

        let (admission, _) = breaker.admit(now + Duration::from_secs(10));
        assert_eq!(
            admission,
            Admission::Rejected {
                retry_in: Duration::from_secs(50)
            }
        );
    }

    #[test]
    fn test_half_open_allows_exactly_one_probe() {
        let now = Instant::now();
        let mut breaker = create_test_breaker(now);
        for _ in 0..3 {
            breaker.on_failure(now);
        }

        let later = now + Duration::from_secs(60);
        let (first, transition) = breaker.admit(later);
        assert_eq!(first, Admission::Probe);
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::HalfOpen));

        let (second, _) = breaker.admit(later);
        let (third, _) = breaker.admit(later + Duration::from_secs(1));
        assert!(matches!(second, Admission::Rejected { .. }));
        assert!(matches!(third, Admission::Rejected { .. }));
    }

    #[test]
    fn test_probe_success_closes() {
        let now = Instant::now();
        let mut breaker = create_test_breaker(now);
        for _ in 0..3 {
            breaker.on_failure(now);
        }

        let later = now + Duration::from_secs(60);
        breaker.admit(later);
        let transition = breaker.on_success(later);

        assert_eq!(transition.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!(breaker.consecutive_failures, 0);
        assert_eq!(breaker.admit(later).0, Admission::Allowed);
    }

    #[test]
    fn test_probe_failure_reopens_with_longer_cooldown() {
        let now = Instant::now();
        let mut breaker = create_test_breaker(now);
        for _ in 0..3 {
            breaker.on_failure(now);
        }

        let probe_at = now + Duration::from_secs(60);
        breaker.admit(probe_at);
        breaker.on_failure(probe_at);

        assert!(breaker.is_open());
        assert_eq!(breaker.cooldown, Duration::from_secs(120));

        // The old cool-down is no longer enough
        let (admission, _) = breaker.admit(probe_at + Duration::from_secs(60));
        assert!(matches!(admission, Admission::Rejected { .. }));
        let (admission, _) = breaker.admit(probe_at + Duration::from_secs(120));
        assert_eq!(admission, Admission::Probe);
    }

    #[test]
    fn test_cooldown_is_capped() {
        let now = Instant::now();
        let mut breaker = BreakerState::new(1, Duration::from_secs(10), now);
        breaker.on_failure(now);

        let mut at = now;
        for _ in 0..10 {
            at += breaker.cooldown;
            breaker.admit(at);
            breaker.on_failure(at);
        }

        assert_eq!(breaker.cooldown, Duration::from_secs(80));
    }

    #[test]
    fn test_release_probe_allows_another_probe() {
        let now = Instant::now();
        let mut breaker = BreakerState::new(1, Duration::from_secs(5), now);
        breaker.on_failure(now);

        let later = now + Duration::from_secs(5);
        assert_eq!(breaker.admit(later).0, Admission::Probe);
        breaker.release_probe();
        assert_eq!(breaker.admit(later).0, Admission::Probe);
    }

    #[test]
    fn test_open_remaining() {
        let now = Instant::now();
        let mut breaker = BreakerState::new(1, Duration::from_secs(10), now);
        assert_eq!(breaker.open_remaining(now), None);

        breaker.on_failure(now);
        assert_eq!(
            breaker.open_remaining(now + Duration::from_secs(4)),
            Some(Duration::from_secs(6))
        );
        assert_eq!(breaker.open_remaining(now + Duration::from_secs(10)), None);
    }
}
