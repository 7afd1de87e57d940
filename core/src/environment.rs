//! Environment traits injected into the engine.
//!
//! All time reads go through [`Clock`] so reservation expiry, lock lease
//! bookkeeping and sweeping can be driven deterministically in tests.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Clock trait - abstracts time operations for testability
///
/// # Examples
///
/// ```
/// use stockline_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let before = clock.now();
/// assert!(clock.now() >= before);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `from + after`, saturating at the maximum representable time.
#[must_use]
pub fn deadline(from: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds of a [`Duration`], saturating at `i64::MAX`.
#[must_use]
pub fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_adds_and_saturates() {
        let now = Utc::now();
        assert_eq!(
            deadline(now, Duration::from_secs(90)),
            now + chrono::Duration::seconds(90)
        );
        assert_eq!(
            deadline(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
