//! Exponential backoff with jitter for transient-failure retries.

use std::time::Duration;

use rand::RngExt;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base_seconds: f64,
    pub max_seconds: f64,
}

impl RetryPolicy {
    pub fn new(base_seconds: f64, max_seconds: f64) -> Self {
        Self {
            base_seconds: base_seconds.max(0.0),
            max_seconds: max_seconds.max(0.0),
        }
    }

    /// Delay before attempt number `attempts + 1`, i.e. after `attempts`
    /// failures: `base * 2^(attempts-1)`, jittered by ±20% and capped.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let raw = self.base_seconds * 2f64.powi(exponent as i32);
        let jitter = rand::rng().random_range(0.8..=1.2);
        let seconds = (raw * jitter).min(self.max_seconds);
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(2.0, 60.0);
        let first = policy.delay(1);
        assert!(first >= Duration::from_secs_f64(1.6) && first <= Duration::from_secs_f64(2.4));

        let second = policy.delay(2);
        assert!(second >= Duration::from_secs_f64(3.2) && second <= Duration::from_secs_f64(4.8));

        // Deep attempts hit the cap regardless of jitter.
        let deep = policy.delay(10);
        assert!(deep <= Duration::from_secs(60));
    }

    #[test]
    fn zero_base_never_panics() {
        let policy = RetryPolicy::new(0.0, 10.0);
        assert_eq!(policy.delay(1), Duration::from_secs(0));
    }
}
