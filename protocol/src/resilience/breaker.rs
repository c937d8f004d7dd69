//! # Circuit Breaker
//!
//! Failure isolation for an outbound dependency. The breaker counts
//! failures while CLOSED; at the threshold it OPENs and every call fails
//! fast with `CircuitOpen` until the retry window elapses. Then exactly
//! one probe call passes through HALF_OPEN: success closes the circuit,
//! failure re-opens it and restarts the window.
//!
//! State lives in atomics and every transition is a compare-and-swap, so
//! concurrent callers agree on who runs the probe without a lock around
//! the guarded operation.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::now_ms;
use crate::error::{Result, ShoalError};

/// Breaker states. Encoded as u8 for atomic storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays OPEN before allowing a probe.
    pub retry_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            retry_timeout: Duration::from_secs(30),
        }
    }
}

type FailurePredicate = dyn Fn(&ShoalError) -> bool + Send + Sync;

/// A named circuit breaker guarding one dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    opened_at_ms: AtomicU64,
    /// Which errors count toward the threshold. Default: everything.
    failure_predicate: Box<FailurePredicate>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            failure_predicate: Box::new(|_| true),
        }
    }

    /// Restricts which errors count toward tripping. Errors outside the
    /// predicate still fail the call, they just do not charge the breaker.
    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ShoalError) -> bool + Send + Sync + 'static,
    {
        self.failure_predicate = Box::new(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Runs `op` behind the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if (self.failure_predicate)(&e) {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Runs `op`; on any failure (including fail-fast rejection) runs the
    /// fallback with the error.
    pub async fn execute_with_fallback<T, F, Fut, FB>(&self, op: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(&ShoalError) -> Result<T>,
    {
        match self.call(op).await {
            Ok(value) => Ok(value),
            Err(e) => fallback(&e),
        }
    }

    /// Gate: decides whether a call may proceed, transitioning
    /// OPEN → HALF_OPEN when the retry window has elapsed. Only the caller
    /// that wins the CAS becomes the probe; everyone else keeps failing
    /// fast until the probe reports.
    fn admit(&self) -> Result<()> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(self.open_error()),
            CircuitState::Open => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                let elapsed = now_ms().saturating_sub(opened);
                if elapsed < self.config.retry_timeout.as_millis() as u64 {
                    return Err(self.open_error());
                }
                let won = self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if won {
                    debug!(breaker = %self.name, "probe admitted, circuit half-open");
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    fn open_error(&self) -> ShoalError {
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        let window = self.config.retry_timeout.as_millis() as u64;
        let remaining = window.saturating_sub(now_ms().saturating_sub(opened));
        ShoalError::CircuitOpen {
            retry_after_ms: remaining,
        }
    }

    fn record_success(&self) {
        let prev = self.state.swap(CircuitState::Closed as u8, Ordering::AcqRel);
        self.failures.store(0, Ordering::Release);
        if prev != CircuitState::Closed as u8 {
            info!(breaker = %self.name, "circuit closed");
        }
    }

    fn record_failure(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                // Failed probe: straight back to OPEN with a fresh window.
                self.trip();
            }
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self) {
        self.opened_at_ms.store(now_ms(), Ordering::Release);
        let prev = self.state.swap(CircuitState::Open as u8, Ordering::AcqRel);
        if prev != CircuitState::Open as u8 {
            warn!(
                breaker = %self.name,
                retry_timeout = ?self.config.retry_timeout,
                "circuit opened"
            );
        }
    }
}
