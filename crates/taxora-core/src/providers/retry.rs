//! Shared retry/backoff helper used by every HTTP adapter

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::failure::BackendFailure;

/// How many immediate retries an adapter performs before surfacing a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Upper bound on any single wait, including server-provided `retry-after`
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32, failure: &BackendFailure) -> Duration {
        let delay = failure
            .retry_after
            .unwrap_or_else(|| self.base_delay.saturating_mul(2u32.saturating_pow(attempt)));
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable failure, or the
/// policy's retry budget is spent. `op` receives the 0-based attempt number.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    backend: &str,
    mut op: F,
) -> Result<T, BackendFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendFailure>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                let retryable = failure.is_retryable();
                warn!(
                    "Backend {} failed (attempt {}/{}, retryable={}): {}",
                    backend,
                    attempt + 1,
                    policy.max_retries + 1,
                    retryable,
                    failure,
                );

                if !retryable || attempt >= policy.max_retries {
                    return Err(failure);
                }

                let delay = policy.delay_for(attempt, &failure);
                debug!("Backing off {:?} before retrying {}", delay, backend);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
