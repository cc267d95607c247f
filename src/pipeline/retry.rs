use std::time::Duration;

/// Bounded retries with exponential backoff for queued ingestion.
///
/// A document gets one run plus up to `max_retries` more. Before retry `n` (counting from
/// zero) the worker waits `base_delay * multiplier^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-runs allowed after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Queue policy: `max_retries` re-runs after 1 s, 4 s, 16 s, ...
    pub const fn queued(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            multiplier: 4,
        }
    }

    /// Single run, no retries (the inline mode).
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Whether another run is allowed after `retries_used` retries.
    pub fn allows(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }

    /// Wait before the retry that follows `retries_used` earlier retries.
    pub fn delay(&self, retries_used: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retries_used);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::queued(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_policy_backs_off_by_powers_of_four() {
        let policy = RetryPolicy::queued(3);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(16));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn inline_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.allows(0));
        assert_eq!(policy.delay(0), Duration::ZERO);
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::queued(u32::MAX);
        assert_eq!(
            policy.delay(200),
            Duration::from_secs(u64::from(u32::MAX))
        );
    }
}
