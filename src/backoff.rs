//! Retry Backoff
//!
//! Bounded exponential backoff with jitter, used by the heartbeat and the
//! election loop when the coordination service is unreachable.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff between `base` and `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a new backoff
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Next delay without jitter
    fn next_raw(&mut self) -> Duration {
        let delay = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        delay.min(self.max)
    }

    /// Next delay, randomized into the upper half of the exponential step
    /// so contenders that failed together do not retry together
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_raw();
        let half = delay / 2;
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.next_raw(), Duration::from_millis(100));
        assert_eq!(backoff.next_raw(), Duration::from_millis(200));
        assert_eq!(backoff.next_raw(), Duration::from_millis(400));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_raw(), Duration::from_millis(100));
    }

    #[test]
    fn test_bounded() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..64 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let mut backoff = Backoff::new(Duration::from_millis(400), Duration::from_millis(400));
        for _ in 0..32 {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_max_never_below_base() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.next_raw(), Duration::from_secs(2));
    }
}
