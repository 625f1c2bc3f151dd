//! Backoff for ack/nack calls that fail in transit.
//!
//! A delivery whose resolution still fails once the retries run out is handed
//! back to the broker: the subscription closes its channel and the broker
//! redelivers the message.

use rand::Rng;
use std::time::Duration;

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// How often, and how patiently, a failed ack/nack is retried.
///
/// Delays double from `base_delay` up to `max_delay`; `jitter` spreads each
/// delay by up to that fraction in either direction.
///
/// ```rust
/// use peril_pubsub::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(50)).with_jitter(0.0);
/// let delays: Vec<Duration> = policy.delays().collect();
/// assert_eq!(
///     delays,
///     vec![
///         Duration::from_millis(50),
///         Duration::from_millis(100),
///         Duration::from_millis(200),
///     ]
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed call
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// One retry after roughly 100ms
    fn default() -> Self {
        Self::new(1, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY.max(base_delay),
            jitter: 0.25,
        }
    }

    /// Give up on the first failure
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2f64.powi(retry.min(30) as i32);
        let capped = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());

        let spread = capped * self.jitter;
        if spread <= 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let jittered = capped + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// One delay per permitted retry, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.retries).map(move |retry| self.delay_for(retry))
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
