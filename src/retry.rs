//! Bounded exponential backoff for call sites known to be flaky.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Retry schedule: `max_retries` extra attempts after the first, sleeping
/// `initial_delay`, then `initial_delay * factor`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl Backoff {
    /// Delay slept before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(self.factor.saturating_pow(retry))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the schedule is exhausted. The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    label: &str,
    policy: Backoff,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.max_retries + 1;
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(err),
            Err(err) if retry >= policy.max_retries => {
                error!(%label, attempts, "giving up: {}", err);
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(retry);
                warn!(
                    %label,
                    attempt = retry + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}
