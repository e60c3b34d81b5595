use std::time::Duration;

use rand::Rng;

/// How replay-safe requests are retried after a transient failure.
///
/// The delay before retry `n` (0-based) is `initial * 2^n`, capped at `cap`.
/// With `jitter` the actual delay is drawn from the upper half of that
/// window so that clients hitting the same outage spread out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub jitter: bool,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: true,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            cap: Duration::ZERO,
            jitter: false,
            max_attempts: 1,
        }
    }

    /// Deterministic delays, mostly for tests against a local server.
    pub fn fixed(initial: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            cap,
            jitter: false,
            max_attempts,
        }
    }

    /// Whether another attempt may follow failed attempt `attempt`.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self
            .initial
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.cap);
        if self.jitter && !ceiling.is_zero() {
            rng.gen_range(ceiling / 2..=ceiling)
        } else {
            ceiling
        }
    }
}
