//! Retry and timeout policy for one remote operation.
//!
//! A [`RetryPolicy`] is resolved from [`crate::config::CoordinatorConfig`]
//! per [`crate::types::OperationKind`] and handed to the supervisor. The
//! delay between attempts is pluggable through [`Backoff`]; the default is a
//! fixed delay.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * factor^(attempt - 1)`, capped at `max`. With `jitter` the delay
    /// is drawn uniformly from `[0, computed]`.
    Exponential {
        base: Duration,
        factor: u32,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Upper bound of the delay after failed attempt number `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential {
                base, factor, max, ..
            } => {
                let exp = attempt.saturating_sub(1).min(16);
                let multiplier = (*factor).max(1).saturating_pow(exp);
                base.saturating_mul(multiplier).min(*max)
            }
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        match self {
            Backoff::Exponential { jitter: true, .. } if !ceiling.is_zero() => {
                let ms = ceiling.as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
            }
            _ => ceiling,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, timeout: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
            backoff,
        }
    }

    /// One attempt, no retries. Used for manual direct submission.
    pub fn single(timeout: Duration) -> Self {
        Self::new(1, timeout, Backoff::Fixed(Duration::ZERO))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
