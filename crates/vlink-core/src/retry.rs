//! Bounded retries through the circuit breaker.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::backoff::RetryConfig;
use crate::circuit_breaker::CircuitBreaker;
use crate::context::OpContext;
use crate::error::{LinkError, Result};

/// Runs operations with exponential backoff, each attempt going through a
/// shared [`CircuitBreaker`].
///
/// Every error counts as a failed attempt, [`LinkError::CircuitOpen`] and
/// [`LinkError::NotConnected`] included. Attempts for one call run strictly
/// one after another.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

impl RetryExecutor {
    /// Creates an executor over `breaker`.
    #[must_use]
    pub const fn new(config: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, breaker }
    }

    /// Retry policy.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The breaker every attempt goes through.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs `op` up to `max_retries + 1` times.
    ///
    /// The context is checked before every attempt and bounds both the
    /// attempts and the sleeps between them.
    ///
    /// # Errors
    ///
    /// Returns the context's error as soon as it is cancelled or times out,
    /// otherwise [`LinkError::RetryExhausted`] carrying the final failure once
    /// every attempt has failed.
    pub async fn retry<T, F, Fut>(&self, ctx: &OpContext, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = tracing::info_span!("retry", operation, op_id = %Uuid::new_v4());
        let attempts = self.config.total_attempts();

        async move {
            let mut attempt: u32 = 0;
            loop {
                ctx.check()?;

                let err = match self.breaker.call(|| ctx.run(op())).await {
                    Ok(value) => {
                        if attempt > 0 {
                            info!(attempts = attempt + 1, "operation succeeded after retries");
                        }
                        return Ok(value);
                    }
                    Err(err) => err,
                };

                if let Some(ctx_err) = ctx.err() {
                    return Err(ctx_err);
                }

                attempt += 1;
                if attempt >= attempts {
                    warn!(attempts, error = %err, "retry attempts exhausted");
                    return Err(LinkError::RetryExhausted {
                        operation: operation.to_owned(),
                        attempts,
                        source: Box::new(err),
                    });
                }

                let delay = self.config.delay_for_attempt(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "attempt failed, retrying"
                );
                ctx.sleep(delay).await?;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    fn executor(max_retries: u32) -> RetryExecutor {
        let config = RetryConfig::new()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(false);
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().with_max_failures(100));
        RetryExecutor::new(config, Arc::new(breaker))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = executor(3);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let value = executor
            .retry(&OpContext::background(), "flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LinkError::NotConnected)
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let executor = executor(2);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = executor
            .retry(&OpContext::background(), "get_state", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LinkError::InvalidResponse(format!("attempt {n}")))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            LinkError::RetryExhausted {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "get_state");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, LinkError::InvalidResponse(ref m) if m == "attempt 2"));
            }
            other => panic!("expected RetryExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_retries_makes_one_attempt() {
        let executor = executor(0);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = executor
            .retry(&OpContext::background(), "get_state", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LinkError::NotConnected)
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("failed after 1 attempts"));
    }

    #[tokio::test]
    async fn test_pre_cancelled_context_skips_attempts() {
        let executor = executor(3);
        let ctx = OpContext::background();
        ctx.cancel();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = executor
            .retry(&ctx, "get_state", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LinkError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_backoff_returns_timeout() {
        let config = RetryConfig::new()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_secs(1))
            .with_jitter(false);
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let executor = RetryExecutor::new(config, breaker);
        let ctx = OpContext::with_deadline_in(Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = executor
            .retry(&ctx, "get_state", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LinkError::NotConnected)
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_against_breaker() {
        let config = RetryConfig::new().with_max_retries(3).with_jitter(false);
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default().with_max_failures(1),
        ));
        let executor = RetryExecutor::new(config, Arc::clone(&breaker));
        let ctx = OpContext::with_deadline_in(Duration::from_millis(20));

        let err = executor
            .retry(&ctx, "get_state", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_consumes_attempts() {
        let config = RetryConfig::new()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default().with_max_failures(1),
        ));
        let executor = RetryExecutor::new(config, breaker);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = executor
            .retry(&OpContext::background(), "set_climate_on", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LinkError::NotConnected)
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_retry_exhausted());
        assert!(err.root_cause().is_circuit_open());
    }
}
