//! Time source abstraction
//!
//! Every component that needs "now" (cooldowns, quiet hours, retry backoff,
//! expiry, run locks) asks a [`Clock`] instead of calling `Utc::now()` directly,
//! so evaluation passes and sweeps can be replayed at fixed instants in tests.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Clock trait for time abstraction.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic runs.
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

    /// Jump to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock() = at;
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance_secs(&self, secs: i64) {
        let mut current = self.current.lock();
        *current += Duration::seconds(secs);
    }

    /// Move the clock forward by `millis` milliseconds.
    pub fn advance_millis(&self, millis: i64) {
        let mut current = self.current.lock();
        *current += Duration::milliseconds(millis);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance_secs(90);
        assert_eq!(clock.now(), start + Duration::seconds(90));
        clock.advance_millis(250);
        assert_eq!(clock.now(), start + Duration::milliseconds(90_250));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
