//! Wall Clock
//!
//! Every time read in the reliability layer (TTL checks, health timestamps,
//! schedule boundaries) goes through [`Clock`] so tests can drive time by hand.
//! Sleeping is still done with `tokio::time`; only observed time is injected.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Real system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Advance by a delta. Negative deltas are ignored.
    pub fn advance(&self, delta: chrono::Duration) {
        if delta < chrono::Duration::zero() {
            return;
        }
        let mut current = self.current.lock();
        *current += delta;
    }

    pub fn advance_millis(&self, millis: i64) {
        self.advance(chrono::Duration::milliseconds(millis));
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.lock() = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance_millis(1_500);
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(1_500));

        // Never goes backwards through advance()
        clock.advance(chrono::Duration::seconds(-10));
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(1_500));
    }
}
