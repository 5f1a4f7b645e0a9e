//! Bounded exponential backoff for transient failures.

use std::time::Duration;

/// Retry budget and backoff curve shared by the embedding stage and the
/// dispatcher's re-dispatch loop.
///
/// Delays grow as `base_delay * 2^(attempt - 1)`, capped at `max_delay`, with
/// optional random jitter of up to half the computed delay so simultaneous
/// retries spread out.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Policy with no delay and no jitter, for tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt is allowed after `attempt` attempts have run.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay before the attempt following attempt number `attempt`
    /// (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        if !self.jitter || raw.is_zero() {
            return raw;
        }
        let jitter_ms = rand::random_range(0..=raw.as_millis() as u64 / 2);
        raw + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            Self::DEFAULT_BASE_DELAY,
            Self::DEFAULT_MAX_DELAY,
        )
    }
}
