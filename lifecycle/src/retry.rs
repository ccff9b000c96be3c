//! Opt-in retry helper for collaborator calls.
//!
//! The core never retries on its own; it only classifies errors. Callers that
//! want to retry transient chain-reader failures wrap the call in a
//! [`RetryStrategy`], which applies exponential backoff to `NetworkError`s.

use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, Result, RetryContext};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry strategy configuration
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Maximum retry delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl RetryStrategy {
    /// Create a retry strategy from lifecycle config
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            multiplier: config.retry_multiplier,
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Check if an error is retryable
    pub fn is_retryable(error: &LifecycleError) -> bool {
        error.is_retryable()
    }

    /// Execute an operation, retrying transient network errors
    pub async fn retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_with_predicate(operation, Self::is_retryable)
            .await
    }

    /// Execute an operation with a custom retry predicate
    pub async fn retry_with_predicate<F, Fut, T, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&LifecycleError) -> bool,
    {
        let mut backoff = self.create_backoff();
        let mut retry_ctx = RetryContext::new();

        loop {
            debug!(
                "Attempt {} of {}",
                retry_ctx.attempts + 1,
                self.max_retries + 1
            );

            let error = match operation().await {
                Ok(result) => {
                    if retry_ctx.attempts > 0 {
                        debug!(
                            "Operation succeeded after {} retries ({}ms waited)",
                            retry_ctx.attempts, retry_ctx.total_time_ms
                        );
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if !should_retry(&error) {
                warn!("Non-retryable error: {:?}", error);
                return Err(error);
            }

            if retry_ctx.attempts >= self.max_retries {
                warn!(
                    "Max retries ({}) exceeded. Last error: {:?}",
                    self.max_retries, error
                );
                return Err(LifecycleError::MaxRetriesExceeded(self.max_retries));
            }

            let Some(delay) = backoff.next_backoff() else {
                warn!("Backoff exhausted");
                return Err(LifecycleError::MaxRetriesExceeded(self.max_retries));
            };

            retry_ctx.record_attempt(&error.to_string(), delay.as_millis() as u64);
            warn!(
                "Attempt {} failed: {}. Retrying in {:?}",
                retry_ctx.attempts, error, delay
            );

            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::addr;
    use std::cell::{Cell, RefCell};
    use test_case::test_case;

    fn fast_strategy(max_retries: usize) -> RetryStrategy {
        RetryStrategy {
            max_retries,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_strategy_from_config() {
        let config = LifecycleConfig::mainnet(addr(1));
        let strategy = RetryStrategy::from_config(&config);
        assert_eq!(strategy.max_retries, config.max_retries);
        assert_eq!(
            strategy.initial_delay,
            Duration::from_millis(config.retry_initial_delay_ms)
        );
    }

    #[tokio::test]
    async fn test_retry_success_after_network_errors() {
        let calls = Cell::new(0);

        let result = fast_strategy(3)
            .retry(|| async {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(LifecycleError::NetworkError("reset".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_max_retries_exceeded() {
        let calls = Cell::new(0);

        let result: Result<()> = fast_strategy(2)
            .retry(|| async {
                calls.set(calls.get() + 1);
                Err(LifecycleError::NetworkError("down".to_string()))
            })
            .await;

        assert!(matches!(result, Err(LifecycleError::MaxRetriesExceeded(2))));
        assert_eq!(calls.get(), 3); // Initial + 2 retries
    }

    #[test_case(LifecycleError::NotFound("account".to_string()) ; "not found")]
    #[test_case(LifecycleError::UserRejected("declined".to_string()) ; "user rejected")]
    #[test_case(LifecycleError::InvalidTarget("threshold".to_string()) ; "invalid target")]
    fn test_non_retryable_error_returned_immediately(error: LifecycleError) {
        let calls = Cell::new(0);
        let error = RefCell::new(Some(error));

        let result: Result<()> = tokio_test::block_on(fast_strategy(3).retry(|| async {
            calls.set(calls.get() + 1);
            Err(error
                .borrow_mut()
                .take()
                .unwrap_or_else(|| LifecycleError::NetworkError("retried".to_string())))
        }));

        assert!(result.is_err());
        assert!(!matches!(result, Err(LifecycleError::MaxRetriesExceeded(_))));
        assert_eq!(calls.get(), 1);
    }
}
