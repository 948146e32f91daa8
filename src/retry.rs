//! Reconnect backoff.

use std::time::Duration;

/// An attempt that stays up longer than this counts as having worked, which
/// resets the backoff. Connection time is the only success signal the
/// session has; it deliberately conflates "stayed connected a while" with
/// "did useful work".
pub const WORKED_THRESHOLD: Duration = Duration::from_secs(10);

/// Delay sequence between reconnect attempts.
///
/// Starts at 3 seconds and grows by half (integer arithmetic) after each
/// failed attempt, so consecutive fast failures sleep 3, 4, 6, 9, 13, 19,
/// 28, 42, 63 seconds. Growth stops being applied once the current delay
/// reaches 60. An attempt that worked resets the next delay to 2.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: u64,
}

impl Backoff {
    const INITIAL_SECS: u64 = 3;
    const RESET_SECS: u64 = 2;
    const CEILING_SECS: u64 = 60;

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL_SECS,
        }
    }

    /// The delay to sleep after an attempt. Growth applies after the delay
    /// is taken, so the first failure sleeps the initial 3 seconds.
    pub fn next_delay(&mut self, worked: bool) -> Duration {
        if worked {
            self.current = Self::RESET_SECS;
        }
        let delay = self.current;
        if self.current < Self::CEILING_SECS {
            self.current = self.current * 3 / 2;
        }
        Duration::from_secs(delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_failures_follow_the_published_sequence() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..11).map(|_| backoff.next_delay(false).as_secs()).collect();
        assert_eq!(delays, [3, 4, 6, 9, 13, 19, 28, 42, 63, 63, 63]);
    }

    #[test]
    fn a_worked_attempt_resets_to_two() {
        let mut backoff = Backoff::new();
        for _ in 0..8 {
            backoff.next_delay(false);
        }
        assert_eq!(backoff.next_delay(true).as_secs(), 2);
        // and growth resumes from there
        assert_eq!(backoff.next_delay(false).as_secs(), 3);
        assert_eq!(backoff.next_delay(false).as_secs(), 4);
    }

    #[test]
    fn growth_stops_at_the_ceiling() {
        let mut backoff = Backoff::new();
        for _ in 0..20 {
            backoff.next_delay(false);
        }
        assert_eq!(backoff.next_delay(false).as_secs(), 63);
    }
}
