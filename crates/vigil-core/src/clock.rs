//! Lease clock.
//!
//! Lease expiry, reclaim instants and last-seen stamps are unix seconds read
//! from a [`Clock`], so tests can move lease time without sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::db::unix_timestamp;

/// Source of "now" for lease bookkeeping, in unix seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> i64;
}

/// Shared, dynamically dispatched clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        unix_timestamp()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Move time forward by `by` (whole seconds).
    #[allow(clippy::cast_possible_wrap)]
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Whole seconds of a duration as a signed offset for timestamp arithmetic.
#[allow(clippy::cast_possible_wrap)]
pub const fn secs(d: Duration) -> i64 {
    d.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), 1_090);

        let shared: SharedClock = Arc::new(clock.clone());
        clock.set(5);
        assert_eq!(shared.now(), 5);
    }

    #[test]
    fn system_clock_is_reasonable() {
        // After 2024-01-01
        assert!(SystemClock.now() > 1_704_067_200);
    }
}
