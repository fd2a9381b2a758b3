//! Time provider abstraction
//!
//! Key creation timestamps, notification bodies and run reports all read the
//! time through a [`Clock`], so production code uses the system clock while
//! tests pin the time.
//!
//! # Example
//!
//! ```
//! use keyfleet::{Clock, SystemClock};
//!
//! let clock = SystemClock;
//! let rfc3339 = clock.now_rfc3339();
//! assert!(rfc3339.contains('T'));
//! ```

use std::fmt::Debug;

use chrono::{DateTime, Utc};

#[cfg(any(test, feature = "testing"))]
use std::sync::Mutex;

/// A time provider for getting current timestamps.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time as an RFC3339-formatted string.
    fn now_rfc3339(&self) -> String {
        self.now().to_rfc3339()
    }

    /// Get current time as seconds since Unix epoch.
    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Production clock using real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
///
/// ```ignore
/// use keyfleet::{Clock, FixedClock};
///
/// let clock = FixedClock::new(1_704_067_200_000);
/// assert_eq!(clock.now(), clock.now());
/// clock.advance(1_000);
/// assert!(clock.now_rfc3339().starts_with("2024-01-01T00:00:01"));
/// ```
#[cfg(any(test, feature = "testing"))]
pub struct FixedClock {
    millis: Mutex<i64>,
}

#[cfg(any(test, feature = "testing"))]
impl FixedClock {
    /// Create a new fixed clock at the given milliseconds since Unix epoch.
    pub fn new(millis: i64) -> Self {
        Self {
            millis: Mutex::new(millis),
        }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, ms: i64) {
        *self.millis.lock().unwrap() += ms;
    }

    /// Set the clock to a specific time in milliseconds.
    pub fn set(&self, ms: i64) {
        *self.millis.lock().unwrap() = ms;
    }

    /// Current value in milliseconds.
    pub fn get(&self) -> i64 {
        *self.millis.lock().unwrap()
    }
}

#[cfg(any(test, feature = "testing"))]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.get()).unwrap_or_default()
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for FixedClock {
    fn default() -> Self {
        // 2024-01-01 00:00:00 UTC
        Self::new(1_704_067_200_000)
    }
}

#[cfg(any(test, feature = "testing"))]
impl Debug for FixedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedClock")
            .field("millis", &self.get())
            .finish()
    }
}
