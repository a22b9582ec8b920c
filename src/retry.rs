//! Retry policy: decides between another attempt and the dead-letter store.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, HandlerError};

/// Smallest delay used when an open circuit reports no remaining cool-down.
const MIN_CIRCUIT_DELAY: Duration = Duration::from_secs(1);

fn circuit_wait(remaining: Duration) -> Duration {
    remaining.max(MIN_CIRCUIT_DELAY)
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt after `after`.
    Retry { after: Duration },
    /// Stop retrying; `kind` is recorded on the dead-letter entry.
    Terminal { kind: ErrorKind },
}

/// Pure function of (error kind, attempt) plus jitter. Holds no state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Decide what follows a failed attempt. `attempt` is 1 for the first
    /// execution, so a job that has already retried `n` times passes `n + 1`.
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        self.decide_with_rng(kind, attempt, None, &mut rand::thread_rng())
    }

    /// Like [`decide`](Self::decide) but honours the error's own
    /// `retry_after` (an open circuit's remaining cool-down).
    pub fn decide_for(&self, error: &HandlerError, attempt: u32) -> RetryDecision {
        self.decide_with_rng(error.kind, attempt, error.retry_after, &mut rand::thread_rng())
    }

    pub fn decide_with_rng<R: Rng + ?Sized>(
        &self,
        kind: ErrorKind,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::Terminal { kind };
        }
        if attempt > self.config.max_retries {
            return RetryDecision::Terminal {
                kind: ErrorKind::RetryBudgetExhausted,
            };
        }

        let base = match (kind, retry_after) {
            (ErrorKind::CircuitOpen, Some(remaining)) => circuit_wait(remaining),
            _ => self.base_delay(attempt),
        };

        RetryDecision::Retry {
            after: base + self.jitter(base, rng),
        }
    }

    /// How long to hold back a job the breaker refused: the remaining
    /// cool-down plus jitter. Deferrals are not charged to the budget.
    pub fn deferral(&self, error: &HandlerError) -> Duration {
        self.deferral_with_rng(error, &mut rand::thread_rng())
    }

    pub fn deferral_with_rng<R: Rng + ?Sized>(&self, error: &HandlerError, rng: &mut R) -> Duration {
        let base = circuit_wait(error.retry_after.unwrap_or_default());
        base + self.jitter(base, rng)
    }

    /// Scheduled delay before the retry following `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let schedule = &self.config.schedule;
        let index = (attempt.max(1) as usize - 1).min(schedule.len().saturating_sub(1));
        schedule.get(index).copied().unwrap_or_default()
    }

    fn jitter<R: Rng + ?Sized>(&self, base: Duration, rng: &mut R) -> Duration {
        if self.config.jitter_ratio <= 0.0 || base.is_zero() {
            return Duration::ZERO;
        }
        base.mul_f64(rng.gen_range(0.0..=self.config.jitter_ratio))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
