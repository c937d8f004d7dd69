//! # Resilience Pipeline
//!
//! One named composition per outbound operation:
//!
//! ```text
//! circuit breaker → retry → operation → fallback
//! ```
//!
//! The breaker sits outside the retry loop on purpose: when the circuit
//! is open, the pipeline fails fast without burning the retry budget, and
//! retry exhaustion charges the breaker exactly once. Fallbacks are
//! functions of the error (or fixed values via a closure); an absent
//! fallback re-raises.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, ShoalError};
use crate::resilience::breaker::CircuitBreaker;
use crate::resilience::retry::{retry_with, RetryPolicy};

/// A reusable, named failure-handling composition.
#[derive(Clone)]
pub struct ResiliencePipeline {
    name: String,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryPolicy>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ResiliencePipeline {
    /// A bare pipeline: just the operation, no protection.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            breaker: None,
            retry: None,
            shutdown: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Wires a shutdown signal into the retry sleeps.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `op` through the configured layers. No fallback: failures
    /// re-raise to the caller.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retried = |mut op: F| async move {
            match &self.retry {
                Some(policy) => {
                    retry_with(
                        policy,
                        ShoalError::is_retryable,
                        self.shutdown.clone(),
                        op,
                    )
                    .await
                }
                None => op(1).await,
            }
        };

        match &self.breaker {
            Some(breaker) => breaker.call(|| retried(op)).await,
            None => retried(op).await,
        }
    }

    /// Runs `op` through the layers; on failure hands the error to
    /// `fallback` for a substitute result.
    pub async fn execute_with_fallback<T, F, Fut, FB>(&self, op: F, fallback: FB) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(&ShoalError) -> Result<T>,
    {
        match self.execute(op).await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(pipeline = %self.name, error = %e, "operation failed, running fallback");
                fallback(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::breaker::{CircuitBreakerConfig, CircuitState};
    use crate::resilience::retry::BackoffStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            strategy: BackoffStrategy::Fixed,
        }
    }

    #[tokio::test]
    async fn retry_inside_breaker_charges_once_per_exhaustion() {
        let breaker = Arc::new(CircuitBreaker::new(
            "dep",
            CircuitBreakerConfig {
                failure_threshold: 2,
                retry_timeout: Duration::from_secs(30),
            },
        ));
        let pipeline = ResiliencePipeline::named("op")
            .with_breaker(Arc::clone(&breaker))
            .with_retry(fast_retry());

        let calls = Arc::new(AtomicU32::new(0));

        // First pipeline run: 3 attempts inside, one breaker failure.
        let counter = Arc::clone(&calls);
        let result: Result<()> = pipeline
            .execute(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ShoalError::unavailable("down"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Second run trips the breaker.
        let counter = Arc::clone(&calls);
        let _: Result<()> = pipeline
            .execute(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ShoalError::unavailable("down"))
                }
            })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Third run fails fast: the operation never executes.
        let counter = Arc::clone(&calls);
        let result: Result<()> = pipeline
            .execute(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(ShoalError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn fallback_substitutes_on_failure() {
        let pipeline = ResiliencePipeline::named("op").with_retry(fast_retry());
        let value = pipeline
            .execute_with_fallback(
                |_| async { Err::<&str, _>(ShoalError::unavailable("down")) },
                |_| Ok("cached"),
            )
            .await
            .unwrap();
        assert_eq!(value, "cached");
    }

    #[tokio::test]
    async fn missing_fallback_reraises() {
        let pipeline = ResiliencePipeline::named("op").with_retry(fast_retry());
        let result: Result<()> = pipeline
            .execute(|_| async { Err(ShoalError::unavailable("down")) })
            .await;
        assert!(matches!(result, Err(ShoalError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn bare_pipeline_runs_once() {
        let pipeline = ResiliencePipeline::named("op");
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = pipeline
            .execute(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ShoalError::unavailable("down"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
