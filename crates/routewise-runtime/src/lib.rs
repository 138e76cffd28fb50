//! # routewise-runtime
//!
//! Resilient execution of routed LLM requests.
//!
//! `routewise-core` decides which (provider, model) pairs a request should
//! try and in which order. This crate tries them:
//!
//! - a two-tier response cache answers repeated queries without a call
//! - per-provider circuit breakers skip providers that keep failing
//! - retries with exponential backoff absorb transient failures
//! - per-attempt timeouts bound slow providers
//! - an optional degraded target is tried when everything else failed
//!
//! The provider call itself is opaque: anything implementing
//! [`ProviderCaller`], including a plain async closure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use routewise_core::{Catalog, RequestContext};
//! use routewise_runtime::{ResilienceOrchestrator, RuntimeConfig};
//!
//! let orchestrator = ResilienceOrchestrator::builder()
//!     .catalog(Catalog::from_yaml_file("catalog.yaml")?)
//!     .config(RuntimeConfig::from_yaml_file("runtime.yaml")?)
//!     .build()?;
//!
//! let routed = orchestrator
//!     .handle(&RequestContext::new("Summarize this ticket"), &providers)
//!     .await?;
//! println!("{} via {:?}", routed.response.content, routed.source);
//! ```

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod providers;
pub mod resilience;
pub mod usage;

pub use cache::{CacheConfig, CacheStatsSnapshot, CacheTier, ResponseCache};
pub use config::{ConfigError, RuntimeConfig};
pub use events::{EngineEvent, EventBus};
pub use orchestrator::{
    AttemptFailure, FailureReason, ResilienceOrchestrator, ResilienceOrchestratorBuilder,
    ResponseSource, RoutedResponse,
};
pub use providers::{
    CompletionResponse, ErrorCategory, LlmProvider, ProviderCaller, ProviderError, TokenUsage,
};
pub use resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, DegradationPolicy, RetryPolicy,
    TimeoutConfig,
};
pub use usage::{
    BudgetLimits, CostControl, CostViolation, RequestEstimate, TokenLimits, UsageSnapshot,
    UsageTracker, WindowSpend,
};

use routewise_core::RoutingError;

/// Errors surfaced to callers of the orchestrator.
///
/// Individual provider failures never escape on their own: they are
/// collected as [`AttemptFailure`]s and reported together once the whole
/// chain has been tried.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No provider available: {0}")]
    NoProviderAvailable(String),

    #[error("All providers exhausted after {} attempts", .attempts.len())]
    AllProvidersExhausted { attempts: Vec<AttemptFailure> },

    /// Refused before any provider was called
    #[error("Cost limit exceeded: {0}")]
    CostLimitExceeded(#[from] CostViolation),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<RoutingError> for RuntimeError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NoProviderAvailable(reason) => RuntimeError::NoProviderAvailable(reason),
        }
    }
}
