//! # Resilience Module
//!
//! Failure handling for outbound calls: retry with backoff, circuit
//! breaking, and the per-operation pipeline that composes them with a
//! fallback. Everything here is policy around an operation the caller
//! supplies; nothing opens sockets itself.
//!
//! ```text
//! retry.rs    — backoff strategies and classified retry
//! breaker.rs  — CLOSED / OPEN / HALF_OPEN state machine
//! pipeline.rs — breaker → retry → operation → fallback composition
//! ```

pub mod breaker;
pub mod pipeline;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use pipeline::ResiliencePipeline;
pub use retry::{retry, retry_with, BackoffStrategy, RetryPolicy};
