//! Lock-free backoff for the worker loop.
//!
//! Escalates exponentially while the queue transport keeps failing and
//! decays back toward zero on each successful dequeue. Atomics only, so a
//! pool of workers can share one controller without a lock.
//!
//! Backoff: 0 -> 50 -> 100 -> 200 -> ... -> 2000ms cap.
//! Decay: halves per success, floors at 0.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};
use std::time::Duration;

use tokio::time::sleep;

const MAX_DELAY_MS: u64 = 2000;
const INITIAL_BACKOFF_MS: u64 = 50;

/// Cap for redelivery delays computed by [`redelivery_delay`].
pub const MAX_REDELIVERY_DELAY: Duration = Duration::from_secs(60);

pub struct Backoff {
    delay_ms: AtomicU64,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Sleeps for the current delay. No-op when delay is 0.
    pub async fn wait(&self) {
        let ms = self.delay_ms.load(Relaxed);
        if ms > 0 {
            sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Escalates the delay and returns the new value in ms.
    pub fn record_failure(&self) -> u64 {
        let failures = self.consecutive_failures.fetch_add(1, Relaxed) + 1;
        self.total_failures.fetch_add(1, Relaxed);

        // 50 * 2^(failures-1), capped at MAX_DELAY_MS
        let new_delay = (INITIAL_BACKOFF_MS * (1u64 << (failures - 1).min(6))).min(MAX_DELAY_MS);
        self.delay_ms.store(new_delay, Relaxed);
        new_delay
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Relaxed);
        let current = self.delay_ms.load(Relaxed);
        if current > 0 {
            self.delay_ms.store(current / 2, Relaxed);
        }
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.delay_ms.load(Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Relaxed)
    }
}

/// Delay before redelivering a message on its `attempt`-th failure:
/// `base * 2^(attempt-1)`, capped.
pub fn redelivery_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_REDELIVERY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_and_cap() {
        let backoff = Backoff::new();
        assert_eq!(backoff.record_failure(), 50);
        assert_eq!(backoff.record_failure(), 100);
        assert_eq!(backoff.record_failure(), 200);
        for _ in 0..10 {
            backoff.record_failure();
        }
        assert_eq!(backoff.current_delay_ms(), MAX_DELAY_MS);
        assert_eq!(backoff.total_failures(), 13);
    }

    #[test]
    fn test_success_decays_and_resets_streak() {
        let backoff = Backoff::new();
        backoff.record_failure();
        backoff.record_failure();
        backoff.record_success();
        assert_eq!(backoff.current_delay_ms(), 50);
        assert_eq!(backoff.record_failure(), 50);
    }

    #[test]
    fn test_redelivery_delay() {
        let base = Duration::from_millis(500);
        assert_eq!(redelivery_delay(base, 1), base);
        assert_eq!(redelivery_delay(base, 3), Duration::from_millis(2000));
        assert_eq!(redelivery_delay(base, 30), MAX_REDELIVERY_DELAY);
    }
}
