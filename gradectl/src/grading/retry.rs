//! Retry wrapper for provider calls.
//!
//! Transient failures are retried on a fixed backoff schedule; permanent
//! failures are re-raised immediately. The wrapper is applied independently
//! per ensemble run, so one model's retries never delay another's.

use std::future::Future;
use std::time::Duration;

use super::provider::ProviderError;

/// Bounded retry policy with a fixed backoff schedule.
///
/// Attempt `n` sleeps `backoff[min(n, len - 1)]` before retrying, so a
/// schedule shorter than `max_retries` repeats its last slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, for tests and the synthesis pass.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Vec::new(),
        }
    }

    fn slot(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(index).copied().unwrap_or(Duration::ZERO)
    }
}

/// Invoke `operation`, retrying transient failures per `policy`.
///
/// Permanent errors are returned unchanged after a single invocation. After
/// `max_retries` transient failures the last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    mut operation: F,
    policy: &RetryPolicy,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() => return Err(error),
            Err(error) => {
                if attempt >= policy.max_retries {
                    tracing::warn!(
                        attempt,
                        max_retries = policy.max_retries,
                        error = %error,
                        "retries exhausted"
                    );
                    return Err(error);
                }
                let delay = policy.slot(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing_then_ok(
        failures: u32,
        error: ProviderError,
        calls: Arc<AtomicU32>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, ProviderError>> + Send>>
    {
        move || {
            let calls = calls.clone();
            let error = error.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(error)
                } else {
                    Ok(42)
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_retries_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(
            failing_then_ok(1, ProviderError::Timeout, calls.clone()),
            &RetryPolicy::default(),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Waited exactly the first backoff slot.
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(
            failing_then_ok(10, ProviderError::Unauthorized, calls.clone()),
            &RetryPolicy::default(),
        )
        .await;

        assert!(matches!(result, Err(ProviderError::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_and_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(
            failing_then_ok(10, ProviderError::RateLimited, calls.clone()),
            &RetryPolicy::default(),
        )
        .await;

        assert!(matches!(result, Err(ProviderError::RateLimited)));
        // Initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(5 + 15 + 45));
    }

    #[tokio::test(start_paused = true)]
    async fn short_schedule_repeats_last_slot() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: vec![Duration::from_secs(2)],
        };
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(
            failing_then_ok(10, ProviderError::Timeout, calls.clone()),
            &policy,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn success_needs_no_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(
            failing_then_ok(0, ProviderError::Timeout, calls.clone()),
            &RetryPolicy::none(),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
