//! Clock abstraction for testable time handling.
//!
//! Backoff expiry, scattering waits, and ping intervals all depend on wall
//! time, while attempt durations must survive wall-clock jumps, so both a
//! wall clock and a monotonic clock are exposed behind one trait. Tests use
//! [`FakeClock`] to step time deterministically.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Time source for the update client.
pub trait Clock: Send + Sync {
    /// Current wall-clock time (UTC).
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time since an unspecified epoch; never goes backwards.
    fn monotonic(&self) -> Duration;
}

/// Production clock backed by the operating system.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serializes a timestamp as unix microseconds for the pref store.
pub fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

/// Inverse of [`to_micros`]; values outside the representable range are
/// treated as absent.
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}
