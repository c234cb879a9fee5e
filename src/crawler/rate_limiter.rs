//! Per-target request spacing
//!
//! Each key (a host) owns a slot holding the instant of its last grant. Callers
//! queue on the slot's async mutex, which hands out the lock in FIFO order, so a
//! waiting worker is never starved by later arrivals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

type Slot = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Enforces a minimum interval between grants for the same key
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl RateLimiter {
    /// Creates a limiter with the given minimum interval
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until a request to `key` is allowed, then records the grant
    ///
    /// The slot lock is held while sleeping, which both serializes grants for
    /// the key and preserves arrival order.
    ///
    /// # Returns
    ///
    /// The instant the grant was recorded
    pub async fn acquire(&self, key: &str) -> Instant {
        let slot = self.slot(key);
        let mut last_grant = slot.lock().await;

        if let Some(last) = *last_grant {
            let ready_at = last + self.delay;
            if ready_at > Instant::now() {
                tracing::trace!(key, wait = ?(ready_at - Instant::now()), "Rate limiting request");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let granted = Instant::now();
        *last_grant = Some(granted);
        granted
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }
}
