/// Retry logic for transient peer failures.
///
/// Transient errors (stream resets, timeouts, disconnected peers) are
/// retried with exponential backoff; validation, quota, and protocol
/// errors are surfaced immediately.
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ZapError, ZapResult};

/// Backoff schedule for retried operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry an operation on transient errors with exponential backoff.
/// Non-transient errors return immediately without further attempts.
pub async fn retry_async<F, Fut, T>(
    operation: F,
    config: RetryConfig,
    operation_name: &str,
) -> ZapResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ZapResult<T>>,
{
    let mut delay = config.initial_delay;
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt < config.max_attempts {
                    warn!(
                        "{} failed on attempt {}/{}, retrying in {:?}: {}",
                        operation_name, attempt, config.max_attempts, delay, e
                    );
                }
                last_error = Some(e);
                if attempt < config.max_attempts {
                    sleep(delay).await;
                    delay = std::cmp::min(
                        Duration::from_millis(
                            (delay.as_millis() as f64 * config.backoff_multiplier) as u64,
                        ),
                        config.max_delay,
                    );
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ZapError::RequestFailed("retry exhausted with no error".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_errors_retried_to_success() {
        let attempts = AtomicUsize::new(0);
        let result = retry_async(
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ZapError::Network("reset".into()))
                } else {
                    Ok(7)
                }
            },
            fast_config(),
            "test-op",
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_never_retried() {
        let attempts = AtomicUsize::new(0);
        let result: ZapResult<()> = retry_async(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ZapError::Validation(RejectReason::InvalidHash))
            },
            fast_config(),
            "test-op",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let result: ZapResult<()> = retry_async(
            || async { Err(ZapError::RequestFailed("down".into())) },
            fast_config(),
            "test-op",
        )
        .await;
        assert!(matches!(result, Err(ZapError::RequestFailed(_))));
    }
}
