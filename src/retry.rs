//! Bounded retry with exponential backoff for transient failures.

use crate::error::{Error, ProviderError, Result};

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the given retry (1-based attempt that just failed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(exponent)
                .min(self.max_delay_ms),
        )
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the attempt budget is spent. Auth and validation failures are returned on
/// the first occurrence.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < attempts => {
                let delay =
                    requested_delay(&error).unwrap_or_else(|| policy.delay_for(attempt));
                tracing::warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "transient failure, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn requested_delay(error: &Error) -> Option<Duration> {
    match error {
        Error::Provider(ProviderError::Transient {
            retry_after_secs: Some(secs),
            ..
        }) => Some(Duration::from_secs((*secs).min(30))),
        _ => None,
    }
}
