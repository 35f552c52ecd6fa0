//! Bounded retry for board API calls.

use std::future::Future;
use std::time::Duration;

use crate::error::FetchError;
use crate::models::WatcherConfig;

/// How often and how patiently to retry a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Policy for catalog fetches.
    pub fn catalog(config: &WatcherConfig) -> Self {
        Self::new(
            config.catalog_attempts,
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        )
    }

    /// Policy for thread and image fetches.
    pub fn fetch(config: &WatcherConfig) -> Self {
        Self::new(
            config.thread_attempts,
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        )
    }

    /// Delay before retry number `retry` (0-based), doubling each time.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently or runs out of attempts.
///
/// Only [`FetchError::Transient`] is retried.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry + 1 < policy.attempts => {
                let delay = policy.delay_for(retry);
                log::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    context,
                    retry + 1,
                    policy.attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
