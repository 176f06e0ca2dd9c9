//! Bounded exponential backoff for transient provider errors.

use std::future::Future;
use std::time::Duration;

use healer_cloud::CloudProviderError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry settings for provider reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling and capped.
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(retry - 1);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only errors for which [`CloudProviderError::is_transient`] holds are
    /// retried; the last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, CloudProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudProviderError>>,
    {
        let attempts = self.attempts.max(1);
        let mut retry = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry + 1 < attempts => {
                    retry += 1;
                    let delay = self.backoff_duration(retry);
                    warn!(
                        operation,
                        retry,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Transient provider error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
