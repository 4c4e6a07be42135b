//! Provides formatting helpers for durations as used in log messages and diagnostics.
use std::fmt::Write;
use std::time::Duration;

/// Formats a duration into a string like "1m 30s" as used when reporting config changes.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(userhub::fmt::format_duration(Duration::from_millis(200)), "200ms");
/// assert_eq!(userhub::fmt::format_duration(Duration::from_millis(10_000)), "10s");
/// assert_eq!(userhub::fmt::format_duration(Duration::from_millis(60_000)), "1m");
/// assert_eq!(userhub::fmt::format_duration(Duration::from_millis(90_250)), "1m 30s 250ms");
/// assert_eq!(userhub::fmt::format_duration(Duration::from_secs(2 * 60 * 60 + 5)), "2h 5s");
/// assert_eq!(userhub::fmt::format_duration(Duration::from_millis(0)), "0ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 4] = [
        (1000 * 60 * 60, "h"),
        (1000 * 60, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut result = String::new();
    let mut value = duration.as_millis();
    for (unit, suffix) in UNITS {
        let amount = value / unit;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, suffix);
            value %= unit;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}

/// Formats a number of milliseconds just like [format_duration].
pub fn format_millis(millis: u64) -> String {
    format_duration(Duration::from_millis(millis))
}
