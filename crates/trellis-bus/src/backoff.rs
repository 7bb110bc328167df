//! Reconnect backoff policy.

use std::time::Duration;

use trellis_core::constants::RECONNECT_INITIAL_DELAY;

/// Exponential backoff with a ceiling and an unbounded attempt count.
///
/// Transport implementations use this between reconnect attempts; the
/// process supervisor uses it between relaunches so a crash-looping
/// service does not spin.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Backoff starting at `initial`, doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The mesh default: start at 2 s, cap at 30 s.
    pub fn reconnect() -> Self {
        Self::new(RECONNECT_INITIAL_DELAY, Duration::from_secs(30))
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn reconnect_default_starts_at_two_seconds() {
        let mut backoff = Backoff::reconnect();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
