//! Drop-log throttling
//!
//! A live pipeline drops samples whenever a sink is not ready (encoder
//! unconfigured, session not live, muxer not started). Those drops are
//! expected and must be visible in logs without flooding them,
//! so each drop site logs through a [`DropLog`] that rate-limits per key
//! and reports how many occurrences were suppressed since the last line.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key rate limiter for repeated drop messages
pub struct DropLog {
    entries: Mutex<HashMap<&'static str, Entry>>,
    interval: Duration,
}

impl DropLog {
    /// Create a throttler with the given minimum interval between log
    /// lines for the same key
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Default throttler: one line per key every five seconds
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(5))
    }

    /// Record one occurrence for `key`.
    ///
    /// Returns `Some(suppressed)` when the caller should emit a log line,
    /// where `suppressed` counts occurrences swallowed since the previous
    /// line. Returns `None` when the occurrence was only counted.
    pub fn check(&self, key: &'static str) -> Option<u64> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) => {
                if now.duration_since(entry.last_logged) >= self.interval {
                    let suppressed = entry.suppressed;
                    entry.last_logged = now;
                    entry.suppressed = 0;
                    Some(suppressed)
                } else {
                    entry.suppressed += 1;
                    None
                }
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

impl Default for DropLog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Log a throttled debug line for a drop site.
///
/// The message is only emitted when the throttler allows it; the number of
/// suppressed occurrences since the last line is appended.
#[macro_export]
macro_rules! drop_logged {
    ($throttle:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttle.check($key) {
            if suppressed > 0 {
                tracing::debug!(suppressed, $($arg)*);
            } else {
                tracing::debug!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_logs() {
        let throttle = DropLog::with_defaults();
        assert_eq!(throttle.check("video_drop"), Some(0));
    }

    #[test]
    fn test_repeats_within_interval_suppressed() {
        let throttle = DropLog::with_defaults();
        assert!(throttle.check("video_drop").is_some());
        assert!(throttle.check("video_drop").is_none());
        assert!(throttle.check("video_drop").is_none());
    }

    #[test]
    fn test_suppressed_count_reported_after_interval() {
        let throttle = DropLog::new(Duration::from_millis(0));
        assert_eq!(throttle.check("audio_drop"), Some(0));
        // zero interval: every call logs, none suppressed
        assert_eq!(throttle.check("audio_drop"), Some(0));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttle = DropLog::with_defaults();
        assert!(throttle.check("a").is_some());
        assert!(throttle.check("b").is_some());
        assert!(throttle.check("a").is_none());
    }
}
