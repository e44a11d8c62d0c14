//! Retry policy for relay connection attempts.
//!
//! Retries only cover the phase before a relay handshake has succeeded.
//! Delays grow exponentially without jitter:
//! `initial_backoff * factor^(attempt - 1)`.

use std::time::Duration;

/// Default number of retries after the first failure.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

/// Default backoff multiplier.
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Whether failed attempts are retried at all.
    pub enabled: bool,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay for the given 1-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.factor.powi(exponent);

        Duration::try_from_secs_f64(secs).unwrap_or(if secs.is_sign_negative() {
            Duration::ZERO
        } else {
            Duration::MAX
        })
    }

    /// Decide whether attempt `attempt` (1-based, already failed) is retried.
    ///
    /// Returns the wait before the next attempt, or `None` when retries are
    /// disabled or exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.enabled && attempt <= self.max_retries {
            Some(self.delay(attempt))
        } else {
            None
        }
    }
}
