//! Retry and polling backoff.

use crate::error::{ProviderError, ProviderResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default maximum number of attempts per provider call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default upper bound for a single delay, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            multiplier: 2,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before retrying after `error`.
    ///
    /// A server-requested delay wins over the computed backoff; both are
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        let backoff = self.backoff(retry);
        match error {
            ProviderError::Transient {
                retry_after_secs: Some(secs),
                ..
            } => Duration::from_secs(*secs).max(backoff).min(self.max_delay),
            _ => backoff,
        }
    }

    /// Runs `op`, retrying transient errors.
    ///
    /// Returns the result together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (ProviderResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        "{label}: {e}; retrying in {}ms (attempt {}/{max_attempts})",
                        delay.as_millis(),
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        debug!("{label}: giving up after {attempt} attempts");
                    }
                    return (Err(e), attempt);
                }
            }
        }
    }
}

/// Growing interval between status polls.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    next: Duration,
    max: Duration,
}

impl PollBackoff {
    /// Starts at `initial`, doubling up to `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial,
            max: max.max(initial),
        }
    }

    /// Returns the next interval and advances.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        current
    }
}
