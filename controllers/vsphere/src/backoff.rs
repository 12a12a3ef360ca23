//! Fibonacci retry backoff.
//!
//! Failed reconciles are re-queued with a delay that follows the
//! Fibonacci sequence rather than doubling: 5s, 5s, 10s, 15s, 25s,
//! 40s, ... capped at five minutes. The slower growth keeps retries
//! frequent enough to pick up a recovering vCenter without hammering
//! one that is down.

use std::time::Duration;

/// Per-key backoff state held by the workers between attempts.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    max_secs: u64,
    prev_secs: u64,
    current_secs: u64,
}

impl FibonacciBackoff {
    /// Creates a backoff starting at `min_secs` and capped at `max_secs`.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            max_secs,
            prev_secs: 0,
            current_secs: min_secs,
        }
    }

    /// The default policy for reconcile errors: 5s minimum, 5m cap.
    #[must_use]
    pub fn for_reconcile_errors() -> Self {
        Self::new(5, 300)
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_secs);
        let next = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        result
    }

    /// Restarts the sequence after a successful reconcile.
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}
