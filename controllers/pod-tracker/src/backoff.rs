//! # Fibonacci Backoff
//!
//! Provides a Fibonacci-based backoff for requeueing failed reconciliations.
//! This grows more slowly than exponential backoff, which suits transient
//! API server and sink outages that usually clear within a few attempts.
//!
//! Sequence with the defaults (1s min, 60s max): 1s, 1s, 2s, 3s, 5s, 8s, 13s,
//! 21s, 34s, 55s, 60s (max).

use crate::store::ObjectKey;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Fibonacci backoff calculator
///
/// Stateless: the caller tracks how many consecutive failures a key has seen
/// and asks for the delay belonging to that count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibonacciBackoff {
    /// Minimum backoff in seconds (first two values)
    min_secs: u64,
    /// Maximum backoff in seconds (caps the sequence)
    max_secs: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, 60)
    }
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given bounds in seconds
    ///
    /// A zero minimum is raised to one second; a maximum below the minimum is
    /// raised to the minimum.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        let min_secs = min_secs.max(1);
        Self {
            min_secs,
            max_secs: max_secs.max(min_secs),
        }
    }

    /// Calculate the backoff for a given number of consecutive errors
    ///
    /// The sequence starts at `min_secs` for error_count 0 and 1, then follows
    /// the Fibonacci sequence: min, min, min*2, min*3, min*5, min*8, etc.,
    /// capped at `max_secs`.
    #[must_use]
    pub fn delay_for(&self, error_count: u32) -> Duration {
        if error_count <= 1 {
            return Duration::from_secs(self.min_secs);
        }

        let mut prev_secs = self.min_secs;
        let mut current_secs = self.min_secs;

        for _ in 2..=error_count {
            let next_secs = prev_secs.saturating_add(current_secs);
            prev_secs = current_secs;
            current_secs = next_secs.min(self.max_secs);

            if current_secs >= self.max_secs {
                break;
            }
        }

        Duration::from_secs(current_secs)
    }
}

/// Consecutive-failure bookkeeping per object, feeding [`FibonacciBackoff`].
///
/// Used by the error policy: each failure advances the object's count, a
/// successful reconciliation clears it.
#[derive(Debug, Default)]
pub struct RetryTracker {
    backoff: FibonacciBackoff,
    error_counts: Mutex<HashMap<ObjectKey, u32>>,
}

impl RetryTracker {
    /// Creates a tracker using `backoff` for the delays.
    pub fn new(backoff: FibonacciBackoff) -> Self {
        Self {
            backoff,
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `key` and returns how long to wait before the
    /// next attempt.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        match self.error_counts.lock() {
            Ok(mut counts) => {
                let count = counts.entry(key.clone()).or_insert(0);
                let delay = self.backoff.delay_for(*count);
                *count = count.saturating_add(1);
                delay
            }
            Err(e) => {
                warn!("Failed to lock error counts: {}, using minimum backoff", e);
                self.backoff.delay_for(0)
            }
        }
    }

    /// Clears the failure history of `key`.
    pub fn reset(&self, key: &ObjectKey) {
        if let Ok(mut counts) = self.error_counts.lock() {
            counts.remove(key);
        }
    }

    /// Consecutive failures recorded for `key`.
    pub fn error_count(&self, key: &ObjectKey) -> u32 {
        self.error_counts
            .lock()
            .map(|counts| counts.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}
