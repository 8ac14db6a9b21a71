//! # Exponential Backoff
//!
//! Backoff used between retries of transient platform failures and between
//! reconnection attempts. Each delay doubles the previous one and is capped at
//! a configurable ceiling.
//!
//! Sequence for 500ms/30s: 500ms, 1s, 2s, 4s, 8s, 16s, 30s (max), 30s, ...

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay (for reset)
    initial: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Ceiling
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `initial` and capped at `max`
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}
