//! Retry with exponential backoff, applied uniformly to gateway calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::error::{GatewayError, GatewayResult};
use crate::config::EngineConfig;

/// Bounded retry policy with a per-attempt timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Timeout of a single attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Idempotent call: transient errors and unknown outcomes are retried.
    pub async fn read<T, F, Fut>(&self, op: &str, f: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.run(op, f, |e| e.is_retryable() || e.is_unknown_outcome())
            .await
    }

    /// State-changing call: only errors that guarantee nothing happened are retried.
    /// An unknown outcome is returned to the caller to be reconciled later.
    pub async fn mutate<T, F, Fut>(&self, op: &str, f: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.run(op, f, GatewayError::is_retryable).await
    }

    async fn run<T, F, Fut, R>(&self, op: &str, mut f: F, should_retry: R) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
        R: Fn(&GatewayError) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::timeout(op, self.timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && should_retry(&e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Gateway call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(8), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_read_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .read("get_price", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Transient("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        tokio_test::assert_ok!(&result);
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = fast_policy()
            .read("get_balance", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Transient("503".into()))
            })
            .await;

        tokio_test::assert_err!(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mutation_does_not_retry_unknown_outcome() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = fast_policy()
            .mutate("place_order", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Unknown("HTTP 503".into()))
            })
            .await;

        assert!(result.unwrap_err().is_unknown_outcome());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = fast_policy()
            .mutate("place_order", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Rejected {
                    code: -1013,
                    message: "Filter failure: PRICE_FILTER".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out_as_unknown() {
        let result: GatewayResult<()> = fast_policy()
            .mutate("cancel_order", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_unknown_outcome());
    }
}
