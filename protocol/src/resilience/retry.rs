//! # Retry with Backoff
//!
//! Classified retry for transient failures. The policy decides how many
//! attempts and how the delay grows; the classifier decides which errors
//! are worth another attempt (by default, whatever the taxonomy marks
//! retryable). Permanent errors short-circuit immediately: retrying an
//! `InvalidArgument` five times produces five identical failures, slower.
//!
//! Backoff sleeps observe an optional shutdown signal, so a node tearing
//! down never sits out a 30-second exponential delay first.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, ShoalError};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `initial × attempt`.
    Linear,
    /// `initial × 2^(attempt-1)`.
    Exponential,
    /// Exponential with ±25% jitter, so a fleet of retrying peers does
    /// not re-converge on the same instant.
    #[default]
    ExponentialJitter,
}

/// Retry tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. 1 means "no retries".
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            strategy: BackoffStrategy::ExponentialJitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given 1-based `attempt` just
    /// failed. Clamped into `[initial_backoff, max_backoff]`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let raw = match self.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => {
                initial.saturating_mul(1u64 << (attempt - 1).min(32))
            }
            BackoffStrategy::ExponentialJitter => {
                let base = initial.saturating_mul(1u64 << (attempt - 1).min(32));
                let jitter_span = base / 4;
                if jitter_span == 0 {
                    base
                } else {
                    let offset = rand::thread_rng().gen_range(0..=jitter_span * 2);
                    base.saturating_add(offset).saturating_sub(jitter_span)
                }
            }
        };
        Duration::from_millis(raw.clamp(initial, self.max_backoff.as_millis() as u64))
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Runs `op` under `policy`, retrying errors the taxonomy marks
/// retryable.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(policy, ShoalError::is_retryable, None, op).await
}

/// Runs `op` under `policy` with a custom retryability `classifier` and
/// an optional shutdown signal.
///
/// The closure receives the 1-based attempt number. Cancellation is
/// checked between attempts and interrupts backoff sleeps; a cancelled
/// retry returns `Timeout`.
pub async fn retry_with<T, F, Fut, C>(
    policy: &RetryPolicy,
    classifier: C,
    mut shutdown: Option<watch::Receiver<bool>>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&ShoalError) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        if is_cancelled(&mut shutdown) {
            return Err(ShoalError::Timeout("retry cancelled by shutdown".into()));
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if classifier(&e) && attempt < attempts => {
                let delay = policy.delay_after(attempt);
                debug!(attempt, ?delay, error = %e, "retryable failure, backing off");
                last_err = Some(e);

                match &mut shutdown {
                    None => tokio::time::sleep(delay).await,
                    Some(rx) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = rx.changed() => {
                                return Err(ShoalError::Timeout(
                                    "retry cancelled by shutdown".into(),
                                ));
                            }
                        }
                    }
                }
            }
            Err(e) => {
                if attempt == attempts {
                    warn!(attempt, error = %e, "retries exhausted");
                } else {
                    debug!(attempt, error = %e, "non-retryable failure");
                }
                return Err(e);
            }
        }
    }

    // Unreachable with attempts ≥ 1; kept for totality.
    Err(last_err.unwrap_or_else(|| ShoalError::Internal("retry loop fell through".into())))
}

fn is_cancelled(shutdown: &mut Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(20),
            strategy,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_sleeping() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(&fast_policy(BackoffStrategy::Fixed), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ShoalError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(&fast_policy(BackoffStrategy::ExponentialJitter), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ShoalError::unavailable("flaky"))
                } else {
                    Ok("finally")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "finally");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&fast_policy(BackoffStrategy::Fixed), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ShoalError::InvalidArgument("never valid".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ShoalError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry(&fast_policy(BackoffStrategy::Linear), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ShoalError::Timeout("still down".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ShoalError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn shutdown_cancels_between_attempts() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result: Result<()> = retry_with(
            &fast_policy(BackoffStrategy::Fixed),
            ShoalError::is_retryable,
            Some(rx),
            |_| async { Err(ShoalError::unavailable("down")) },
        )
        .await;
        assert!(matches!(result, Err(ShoalError::Timeout(_))));
    }

    #[test]
    fn delay_growth_per_strategy() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            strategy: BackoffStrategy::Fixed,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(4), Duration::from_millis(100));

        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            ..policy
        };
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));

        let policy = RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            ..policy
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        // Clamped at the ceiling.
        assert_eq!(policy.delay_after(20), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            strategy: BackoffStrategy::ExponentialJitter,
        };
        for _ in 0..200 {
            let d = policy.delay_after(3).as_millis() as u64; // base 400
            assert!((300..=500).contains(&d), "jittered delay {d} out of band");
        }
    }
}
