//! Retry policy: bounded attempts with a fixed delay.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry policy for storage calls.
///
/// Every task-manager operation goes through [`RetryPolicy::retry`]; only
/// errors the caller classifies as retryable (lock conflicts) are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retry: u32,

    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry: u32, delay: Duration) -> Self {
        Self { max_retry, delay }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    ///
    /// # Example
    /// ```ignore
    /// let count = policy
    ///     .retry("count", || store.count(), StorageError::is_retryable)
    ///     .await?;
    /// ```
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_retry.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "retryable storage error; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100))
    }
}
