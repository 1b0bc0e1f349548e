//! Media timestamp clock
//!
//! Presentation timestamps are microseconds from a monotonic epoch. A
//! live-streaming pipeline anchors the epoch when the stream goes live; a
//! record-only pipeline anchors it at recording start so the file's
//! zero-time is its own start rather than device boot.

use std::time::Instant;

/// Monotonic microsecond clock with an explicit epoch
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    epoch: Instant,
}

impl MediaClock {
    /// Clock whose zero is now
    pub fn starting_now() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Clock anchored to an existing epoch
    pub fn with_epoch(epoch: Instant) -> Self {
        Self { epoch }
    }

    /// Microseconds elapsed since the epoch
    pub fn micros(&self) -> i64 {
        self.micros_at(Instant::now())
    }

    /// Microseconds between the epoch and `t`; instants before the epoch
    /// clamp to zero
    pub fn micros_at(&self, t: Instant) -> i64 {
        t.saturating_duration_since(self.epoch).as_micros() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_micros_at_is_relative_to_epoch() {
        let epoch = Instant::now();
        let clock = MediaClock::with_epoch(epoch);
        assert_eq!(clock.micros_at(epoch), 0);
        assert_eq!(clock.micros_at(epoch + Duration::from_millis(40)), 40_000);
    }

    #[test]
    fn test_pre_epoch_clamps_to_zero() {
        let epoch = Instant::now();
        let clock = MediaClock::with_epoch(epoch + Duration::from_secs(1));
        assert_eq!(clock.micros_at(epoch), 0);
    }
}
