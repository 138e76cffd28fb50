//! Resilience patterns for routewise-runtime.
//!
//! This module provides:
//! - Per-provider circuit breakers
//! - Retry with exponential backoff
//! - Per-attempt timeouts
//! - A last-resort degraded target

mod circuit_breaker;
mod degradation;
pub mod retry;
mod timeout;

pub use circuit_breaker::{
    Admission, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitPermit, CircuitSnapshot,
    CircuitState,
};
pub use degradation::DegradationPolicy;
pub use retry::{RetryOutcome, RetryPolicy};
pub use timeout::TimeoutConfig;
