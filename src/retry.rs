//! Retry policy for calls to external collaborators.
//!
//! Only [`Error::is_retryable`] failures are retried, and only here at the
//! boundary. State transitions inside the store are never re-run.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::Error;

pub fn backoff(config: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_attempts)
        .with_jitter()
}

pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    f.retry(backoff(config))
        .when(|err: &Error| err.is_retryable())
        .notify(|err: &Error, delay: Duration| {
            warn!(
                operation,
                error = %err,
                backoff_ms = %delay.as_millis(),
                "external call failed, retrying after backoff"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn retries_dependency_failures_until_success() {
        let calls = AtomicUsize::new(0);

        let result = with_retry(&fast(), "flaky", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::PaymentGatewayFailed("unavailable".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), Error> = with_retry(&fast(), "down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::EvidenceStorageFailed("unavailable".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_business_failures() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), Error> = with_retry(&fast(), "rule", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::RejectionReasonRequired)
        })
        .await;

        assert_eq!(result.unwrap_err(), Error::RejectionReasonRequired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
