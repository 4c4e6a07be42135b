//! Provides a two tier fixed window rate limiter keyed by client identity.
//!
//! Each client is granted **minute_capacity** requests per minute and at most
//! **burst_capacity** requests within ten seconds. Both windows are fixed (not sliding): a window
//! starts with the first request after the previous one expired and lasts for its full length.
//!
//! The burst tier is always checked first. Therefore a client which exhausted both windows will
//! be told to retry once the burst window is over, which is the earliest moment a retry could
//! succeed for well-behaved clients.
//!
//! # Configuration
//! ```yaml
//! limiter:
//!     # Specifies the number of requests permitted per minute and client.
//!     minute_capacity: 10
//!     # Specifies the number of requests permitted per 10 seconds and client.
//!     burst_capacity: 5
//! ```
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use userhub::clock::ManualClock;
//! # use userhub::limiter::{Admission, RateLimiter, Tier};
//! let clock = Arc::new(ManualClock::new());
//! let limiter = RateLimiter::new(10, 5, clock.clone());
//!
//! for _ in 0..5 {
//!     assert!(matches!(limiter.admit("10.0.0.1"), Admission::Allowed(_)));
//! }
//!
//! clock.advance(2_500);
//! match limiter.admit("10.0.0.1") {
//!     Admission::Rejected(rejection) => {
//!         assert_eq!(rejection.tier, Tier::Burst);
//!         assert_eq!(rejection.retry_after_s, 8);
//!     }
//!     _ => panic!("Expected a rejection"),
//! }
//!
//! // Other clients are not affected...
//! assert!(matches!(limiter.admit("10.0.0.2"), Admission::Allowed(_)));
//! ```
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fnv::FnvHashMap;

use crate::clock::{format_timestamp, Clock};

/// Contains the length of the minute window in milliseconds.
pub const MINUTE_WINDOW_MS: u64 = 60_000;

/// Contains the length of the burst window in milliseconds.
pub const BURST_WINDOW_MS: u64 = 10_000;

/// Names the window which caused a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// The short burst window.
    Burst,
    /// The minute window.
    Minute,
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Burst => write!(f, "burst"),
            Tier::Minute => write!(f, "minute"),
        }
    }
}

/// Describes the state of a single window as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowStatus {
    /// Contains the capacity of the window.
    pub limit: u32,
    /// Contains the number of requests left in the current window.
    pub remaining: u32,
    /// Contains the monotonic timestamp at which the window resets.
    pub reset_at: u64,
    /// Contains the wall clock time at which the window resets (ISO-8601).
    pub reset: String,
}

/// Contains the limits reported along with an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Contains the state of the minute window.
    pub minute: WindowStatus,
    /// Contains the state of the burst window.
    pub burst: WindowStatus,
}

/// Describes why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Contains the exhausted window.
    pub tier: Tier,
    /// Contains the number of seconds after which a retry might succeed.
    pub retry_after_s: u64,
    /// Contains the capacity of the exhausted window.
    pub limit: u32,
}

/// Represents the decision of [RateLimiter::admit].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed.
    Allowed(RateLimitHeaders),
    /// The request has to be turned down.
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: u64,
}

impl Window {
    fn new(now: u64, length: u64) -> Self {
        Window {
            count: 0,
            reset_at: now + length,
        }
    }

    fn roll_over(&mut self, now: u64, length: u64) {
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = now + length;
        }
    }

    fn expired(&self, now: u64) -> bool {
        now >= self.reset_at
    }

    fn retry_after_s(&self, now: u64) -> u64 {
        let millis = self.reset_at.saturating_sub(now);
        (millis + 999) / 1000
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientWindows {
    minute: Window,
    burst: Window,
}

struct State {
    minute_capacity: u32,
    burst_capacity: u32,
    clients: FnvHashMap<String, ClientWindows>,
}

/// Keeps the request counters of all clients.
pub struct RateLimiter {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    burst_rejects: AtomicU64,
    minute_rejects: AtomicU64,
}

impl RateLimiter {
    /// Creates a new limiter with the given capacities (both are at least 1).
    pub fn new(minute_capacity: u32, burst_capacity: u32, clock: Arc<dyn Clock>) -> Self {
        RateLimiter {
            state: Mutex::new(State {
                minute_capacity: minute_capacity.max(1),
                burst_capacity: burst_capacity.max(1),
                clients: FnvHashMap::default(),
            }),
            clock,
            burst_rejects: AtomicU64::new(0),
            minute_rejects: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides if the given client may perform another request right now.
    pub fn admit(&self, client: &str) -> Admission {
        let now = self.clock.now();
        let mut state = self.lock();
        let minute_capacity = state.minute_capacity;
        let burst_capacity = state.burst_capacity;

        let windows = state
            .clients
            .entry(client.to_owned())
            .or_insert_with(|| ClientWindows {
                minute: Window::new(now, MINUTE_WINDOW_MS),
                burst: Window::new(now, BURST_WINDOW_MS),
            });

        windows.minute.roll_over(now, MINUTE_WINDOW_MS);
        windows.burst.roll_over(now, BURST_WINDOW_MS);

        if windows.burst.count >= burst_capacity {
            let _ = self.burst_rejects.fetch_add(1, Ordering::Relaxed);
            return Admission::Rejected(Rejection {
                tier: Tier::Burst,
                retry_after_s: windows.burst.retry_after_s(now),
                limit: burst_capacity,
            });
        }

        if windows.minute.count >= minute_capacity {
            let _ = self.minute_rejects.fetch_add(1, Ordering::Relaxed);
            return Admission::Rejected(Rejection {
                tier: Tier::Minute,
                retry_after_s: windows.minute.retry_after_s(now),
                limit: minute_capacity,
            });
        }

        windows.minute.count += 1;
        windows.burst.count += 1;
        let windows = *windows;
        drop(state);

        Admission::Allowed(RateLimitHeaders {
            minute: self.status(minute_capacity, windows.minute),
            burst: self.status(burst_capacity, windows.burst),
        })
    }

    fn status(&self, limit: u32, window: Window) -> WindowStatus {
        WindowStatus {
            limit,
            remaining: limit.saturating_sub(window.count),
            reset_at: window.reset_at,
            reset: format_timestamp(self.clock.wall_at(window.reset_at)),
        }
    }

    /// Forgets all clients whose windows are both expired.
    ///
    /// Returns the number of removed clients.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let size_before = state.clients.len();
        state
            .clients
            .retain(|_, windows| !(windows.minute.expired(now) && windows.burst.expired(now)));

        size_before - state.clients.len()
    }

    /// Returns the number of tracked clients.
    pub fn clients(&self) -> usize {
        self.lock().clients.len()
    }

    /// Returns the number of requests rejected by the given tier.
    pub fn rejects(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Burst => self.burst_rejects.load(Ordering::Relaxed),
            Tier::Minute => self.minute_rejects.load(Ordering::Relaxed),
        }
    }

    /// Returns the capacity of the minute and the burst window.
    pub fn capacities(&self) -> (u32, u32) {
        let state = self.lock();
        (state.minute_capacity, state.burst_capacity)
    }

    /// Applies new capacities.
    ///
    /// Existing windows keep their counts and reset times.
    pub fn reconfigure(&self, minute_capacity: u32, burst_capacity: u32) {
        let mut state = self.lock();
        let minute_capacity = minute_capacity.max(1);
        let burst_capacity = burst_capacity.max(1);

        if state.minute_capacity != minute_capacity || state.burst_capacity != burst_capacity {
            log::info!(
                "Updating the rate limits from {}/min ({} burst) to {}/min ({} burst).",
                state.minute_capacity,
                state.burst_capacity,
                minute_capacity,
                burst_capacity
            );
            state.minute_capacity = minute_capacity;
            state.burst_capacity = burst_capacity;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::limiter::{Admission, RateLimitHeaders, RateLimiter, Rejection, Tier};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::starting_at(
            chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let limiter = RateLimiter::new(10, 5, clock.clone());
        (clock, limiter)
    }

    fn allowed(admission: Admission) -> RateLimitHeaders {
        match admission {
            Admission::Allowed(headers) => headers,
            Admission::Rejected(rejection) => panic!("Unexpected rejection: {:?}", rejection),
        }
    }

    fn rejected(admission: Admission) -> Rejection {
        match admission {
            Admission::Rejected(rejection) => rejection,
            Admission::Allowed(headers) => panic!("Unexpected admission: {:?}", headers),
        }
    }

    #[test]
    fn reports_remaining_requests_and_resets() {
        let (_, limiter) = limiter();
        let headers = allowed(limiter.admit("a"));

        assert_eq!(headers.minute.limit, 10);
        assert_eq!(headers.minute.remaining, 9);
        assert_eq!(headers.minute.reset, "2024-03-01T12:01:00.000Z");
        assert_eq!(headers.burst.limit, 5);
        assert_eq!(headers.burst.remaining, 4);
        assert_eq!(headers.burst.reset, "2024-03-01T12:00:10.000Z");
    }

    #[test]
    fn the_sixth_rapid_request_hits_the_burst_limit() {
        let (clock, limiter) = limiter();
        for _ in 0..5 {
            let _ = allowed(limiter.admit("a"));
        }

        clock.advance(2_500);
        let rejection = rejected(limiter.admit("a"));
        assert_eq!(rejection.tier, Tier::Burst);
        assert_eq!(rejection.retry_after_s, 8);
        assert_eq!(limiter.rejects(Tier::Burst), 1);
        assert_eq!(limiter.rejects(Tier::Minute), 0);
    }

    #[test]
    fn windows_roll_over() {
        let (clock, limiter) = limiter();
        for _ in 0..5 {
            let _ = allowed(limiter.admit("a"));
        }
        clock.set(10_000);
        for _ in 0..5 {
            let _ = allowed(limiter.admit("a"));
        }

        clock.set(20_000);
        let rejection = rejected(limiter.admit("a"));
        assert_eq!(rejection.tier, Tier::Minute);
        assert_eq!(rejection.retry_after_s, 40);

        clock.set(60_001);
        let headers = allowed(limiter.admit("a"));
        assert_eq!(headers.minute.remaining, 9);
        assert_eq!(headers.burst.remaining, 4);
    }

    #[test]
    fn a_window_restarts_at_the_first_request_after_an_idle_gap() {
        let (clock, limiter) = limiter();
        let _ = allowed(limiter.admit("a"));

        clock.set(100_000);
        let headers = allowed(limiter.admit("a"));
        assert_eq!(headers.minute.reset_at, 160_000);
        assert_eq!(headers.minute.reset, "2024-03-01T12:02:40.000Z");
        assert_eq!(headers.burst.reset_at, 110_000);

        // Admitting doesn't move the reset...
        clock.set(130_000);
        let headers = allowed(limiter.admit("a"));
        assert_eq!(headers.minute.reset_at, 160_000);
        assert_eq!(headers.minute.remaining, 8);
    }

    #[test]
    fn burst_takes_precedence_over_minute() {
        let (clock, limiter) = limiter();
        limiter.reconfigure(5, 5);
        for _ in 0..5 {
            let _ = allowed(limiter.admit("a"));
        }

        clock.advance(1_000);
        let rejection = rejected(limiter.admit("a"));
        assert_eq!(rejection.tier, Tier::Burst);
        assert_eq!(rejection.retry_after_s, 9);
    }

    #[test]
    fn admitted_requests_never_exceed_the_limits() {
        let (clock, limiter) = limiter();
        let mut admitted = 0;
        for _ in 0..600 {
            if let Admission::Allowed(_) = limiter.admit("a") {
                admitted += 1;
            }
            clock.advance(100);
        }

        // 60 seconds contain exactly one minute window...
        assert_eq!(admitted, 10);
    }

    #[test]
    fn sweep_forgets_idle_clients() {
        let (clock, limiter) = limiter();
        let _ = allowed(limiter.admit("a"));
        clock.advance(30_000);
        let _ = allowed(limiter.admit("b"));
        assert_eq!(limiter.clients(), 2);

        clock.advance(30_000);
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.clients(), 1);
    }

    #[test]
    fn lowered_capacities_saturate() {
        let (_, limiter) = limiter();
        for _ in 0..3 {
            let _ = allowed(limiter.admit("a"));
        }

        limiter.reconfigure(4, 4);
        let headers = allowed(limiter.admit("a"));
        assert_eq!(headers.burst.remaining, 0);
        assert_eq!(rejected(limiter.admit("a")).tier, Tier::Burst);
        assert_eq!(limiter.capacities(), (4, 4));
    }
}
