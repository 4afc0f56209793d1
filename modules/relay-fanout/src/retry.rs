use std::time::Duration;

use rand::Rng;
use relay_common::config::RetrySettings;

/// Bounded retry for one secondary adapter call.
///
/// Delay before attempt n+1 is `base * 2^(n-1)`, capped at `max_delay`, plus up
/// to `base / 2` of jitter. Every call is cut off after `call_timeout`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Policy with no sleeping between attempts. Useful in tests.
    pub fn immediate(max_attempts: u32, call_timeout: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout,
        }
    }

    /// Total attempts allowed, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sleep after the `failed`-th failed attempt (1-based).
    pub fn backoff(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay);
        delay + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let span = (self.base_delay.as_millis() / 2) as u64;
        if span == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=span))
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}
