//! Provides the time sources used by all components.
//!
//! Every component which needs to know "now" (the cache to judge freshness, the limiter to roll
//! its windows over and the coalescer to detect stale groups) receives an `Arc<dyn Clock>` upon
//! construction. Time is measured as monotonic milliseconds since the clock was created. Wall
//! clock timestamps are only ever needed for output (e.g. when reporting the reset time of a rate
//! limit window) and are derived from the monotonic reading.
//!
//! In production a [MonotonicClock] is used. Tests mostly use a [ManualClock] which only moves
//! when told to, so that window boundaries and TTLs can be hit exactly.
//!
//! # Example
//! ```
//! # use userhub::clock::{Clock, ManualClock};
//! let clock = ManualClock::new();
//! assert_eq!(clock.now(), 0);
//!
//! clock.advance(1_500);
//! assert_eq!(clock.now(), 1_500);
//!
//! // The wall clock moves along...
//! assert_eq!(clock.wall_at(2_500) - clock.wall(), chrono::Duration::milliseconds(1_000));
//! ```
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Describes a source of monotonic time in milliseconds.
pub trait Clock: Send + Sync {
    /// Returns the number of milliseconds elapsed since this clock was created.
    ///
    /// Successive calls never yield a smaller value.
    fn now(&self) -> u64;

    /// Returns the wall clock time which corresponds to [now](Clock::now).
    fn wall(&self) -> DateTime<Utc>;

    /// Translates the given monotonic timestamp into wall clock time.
    fn wall_at(&self, timestamp: u64) -> DateTime<Utc> {
        let delta = timestamp as i64 - self.now() as i64;
        self.wall() + chrono::Duration::milliseconds(delta)
    }
}

/// Formats a wall clock time as ISO-8601 string with millisecond precision.
///
/// # Example
/// ```
/// # use chrono::TimeZone;
/// let date = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
/// assert_eq!(userhub::clock::format_timestamp(date), "2024-03-01T12:30:00.000Z");
/// ```
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Provides the production clock backed by [std::time::Instant].
pub struct MonotonicClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl MonotonicClock {
    /// Creates a new clock which starts counting at zero.
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall(&self) -> DateTime<Utc> {
        self.wall_origin + chrono::Duration::milliseconds(self.now() as i64)
    }
}

/// Provides a clock which only advances when instructed to.
pub struct ManualClock {
    millis: AtomicU64,
    wall_origin: DateTime<Utc>,
}

impl ManualClock {
    /// Creates a new clock which is set to zero.
    pub fn new() -> Self {
        ManualClock::starting_at(Utc::now())
    }

    /// Creates a new clock whose zero corresponds to the given wall clock time.
    pub fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        ManualClock {
            millis: AtomicU64::new(0),
            wall_origin,
        }
    }

    /// Moves the clock forward by the given number of milliseconds.
    pub fn advance(&self, millis: u64) {
        let _ = self.millis.fetch_add(millis, Ordering::AcqRel);
    }

    /// Sets the clock to the given reading.
    ///
    /// Setting a value smaller than the current one would break monotonicity and is ignored.
    pub fn set(&self, millis: u64) {
        let _ = self.millis.fetch_max(millis, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }

    fn wall(&self) -> DateTime<Utc> {
        self.wall_origin + chrono::Duration::milliseconds(self.now() as i64)
    }
}
