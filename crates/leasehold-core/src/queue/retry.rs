//! Retry policy: decides how long a failed task waits before it is claimable
//! again.

use std::time::Duration;

/// Exponential backoff: `base_delay * multiplier^(attempts - 1)`, capped at
/// `max_delay`.
///
/// With a zero `base_delay` every retry is immediate, which is the default.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay after the `attempts`-th failed attempt (1-indexed).
    ///
    /// Example with base_delay=2s, multiplier=2.0, max_delay=10s:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    /// - attempt 4: 10s (capped)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !delay_secs.is_finite() || delay_secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.next_delay(1), Duration::ZERO);
        assert_eq!(policy.next_delay(10), Duration::ZERO);
    }

    #[test]
    fn exponential_backoff_increases_then_caps() {
        let policy = RetryPolicy::exponential(Duration::from_secs(2), 2.0, Duration::from_secs(10));

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), 3.0, Duration::from_secs(60));
        assert_eq!(policy.next_delay(0), Duration::from_secs(1));
    }
}
