//! Provides a lock free sliding average used to track response times.
//!
//! The cache keeps one of these to report the average time it took to answer a user lookup
//! (see [CacheStats](crate::lru::CacheStats)). As lookups are recorded from many handlers in
//! parallel, an [Average] is internally mutable and only relies on atomic loads and stores.
//!
//! # Example
//!
//! ```
//! # use userhub::average::Average;
//! let avg = Average::new();
//! avg.add(100);
//! avg.add(300);
//!
//! assert_eq!(avg.avg(), 200);
//! assert_eq!(avg.count(), 2);
//! ```
use std::sync::atomic::{AtomicU64, Ordering};

/// Once this many samples are aggregated, sum and count are halved before adding the next one.
const WINDOW: i32 = 100;

/// Computes a sliding average over roughly the last hundred values.
///
/// Sum and count of the window are packed into a single `u64` so that both are always read and
/// written together. A second counter keeps the total number of recorded values.
#[derive(Default)]
pub struct Average {
    sum_and_count: AtomicU64,
    count: AtomicU64,
}

impl Clone for Average {
    fn clone(&self) -> Self {
        Average {
            sum_and_count: AtomicU64::new(self.sum_and_count.load(Ordering::Relaxed)),
            count: AtomicU64::new(self.count.load(Ordering::Relaxed)),
        }
    }
}

impl Average {
    /// Creates a new and empty average.
    pub fn new() -> Average {
        Average::default()
    }

    fn unpack(&self) -> (i32, i32) {
        let packed = self.sum_and_count.load(Ordering::Relaxed);
        let sum = ((packed >> 32) & 0xFFFF_FFFF) as i32;
        let count = (packed & 0xFFFF_FFFF) as i32;

        (sum, count)
    }

    /// Records another value (most probably a duration in microseconds).
    ///
    /// If the window is full or the sum would overflow, the window is halved first. This keeps
    /// the value representative for recent samples while staying wait free.
    pub fn add(&self, value: i32) {
        let _ = self.count.fetch_add(1, Ordering::Relaxed);

        let (mut sum, mut count) = self.unpack();
        while count > WINDOW || sum as i64 + value as i64 > i32::MAX as i64 {
            sum = ((count / 2) as i64 * sum as i64 / count as i64) as i32;
            count /= 2;
        }

        sum += value;
        count += 1;

        let packed = (sum as u64 & 0xFFFF_FFFF) << 32 | (count as u64 & 0xFFFF_FFFF);
        self.sum_and_count.store(packed, Ordering::Relaxed);
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the sliding average or 0 if nothing was recorded yet.
    pub fn avg(&self) -> i32 {
        match self.unpack() {
            (0, _) | (_, 0) => 0,
            (sum, count) => sum / count,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::average::Average;

    #[test]
    fn an_empty_average_reports_zero() {
        let avg = Average::new();
        assert_eq!(avg.avg(), 0);
        assert_eq!(avg.count(), 0);
    }

    #[test]
    fn averages_a_handful_of_values() {
        let avg = Average::new();
        for i in 1..=10 {
            avg.add(i);
        }
        assert_eq!(avg.avg(), 5);
        assert_eq!(avg.count(), 10);
    }

    #[test]
    fn favours_recent_values_once_the_window_is_full() {
        let avg = Average::new();
        for _ in 0..500 {
            avg.add(10);
        }
        for _ in 0..500 {
            avg.add(1_000);
        }

        assert_eq!(avg.count(), 1_000);
        assert!(avg.avg() > 900);
    }

    #[test]
    fn survives_huge_values() {
        let avg = Average::new();
        avg.add(i32::MAX);
        avg.add(i32::MAX);
        assert_eq!(avg.avg(), i32::MAX);
    }
}
