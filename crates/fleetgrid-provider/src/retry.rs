//! Deadlines and bounded retries around provider calls.

use std::future::Future;
use std::time::Duration;

use fleet_core::config::RetryConfig;
use tracing::{debug, warn};

use crate::classify::{classify, ErrorClass};
use crate::error::ProviderError;

/// Bounded exponential retry for `Retryable` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Deadline applied to each attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            timeout,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exp)
    }
}

/// Run `fut` under a deadline. An elapsed deadline is a [`ProviderError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

/// Call `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget runs out. The last error is returned.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match with_timeout(policy.timeout, op()).await {
            Ok(value) => return Ok(value),
            Err(e) if classify(&e) == ErrorClass::Retryable && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(operation, attempt, ?delay, error = %e, "retrying provider call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if classify(&e) == ErrorClass::Retryable {
                    warn!(operation, attempts = attempt, error = %e, "provider call retries exhausted");
                }
                return Err(e);
            }
        }
    }
}
