//! Provider abstractions for routewise-runtime.
//!
//! The orchestrator never talks to an SDK directly. It invokes a
//! [`ProviderCaller`] for each (provider, model) attempt and treats the call
//! as opaque: it either returns a [`CompletionResponse`] or a
//! [`ProviderError`] whose [`ErrorCategory`] decides whether it is retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use routewise_core::{RequestContext, Target};

mod factory;

pub use factory::{ProviderFactory, ProviderRegistry, ProviderSet, ProviderSpec};

/// Coarse classification of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Connection,
    RateLimited,
    ServerError,
    Authentication,
    InvalidRequest,
    Parse,
    NotConfigured,
}

impl ErrorCategory {
    /// Whether failures of this kind may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
        )
    }
}

/// Errors from LLM providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// HTTP status associated with the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::ApiError { status, .. } => Some(*status),
            ProviderError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Connection(_) => ErrorCategory::Connection,
            ProviderError::RateLimited { .. } => ErrorCategory::RateLimited,
            ProviderError::ApiError { status, .. } => match *status {
                401 | 403 => ErrorCategory::Authentication,
                408 => ErrorCategory::Timeout,
                429 => ErrorCategory::RateLimited,
                500..=599 => ErrorCategory::ServerError,
                _ => ErrorCategory::InvalidRequest,
            },
            ProviderError::ParseError(_) => ErrorCategory::Parse,
            ProviderError::AuthError(_) => ErrorCategory::Authentication,
            ProviderError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            ProviderError::Timeout(_) => ErrorCategory::Timeout,
            ProviderError::NotConfigured(_) => ErrorCategory::NotConfigured,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category().is_transient()
    }
}

/// Configuration for a completion request.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Model to use
    pub model: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature
    pub temperature: f32,
}

impl CompletionConfig {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

/// A chat message for LLM completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,

    /// Token usage
    #[serde(default)]
    pub usage: TokenUsage,

    /// Model used
    pub model: String,

    /// Stop reason
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl CompletionResponse {
    pub fn text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: TokenUsage::default(),
            model: model.into(),
            stop_reason: Some("stop".to_string()),
        }
    }

    /// Rough in-memory footprint, used for cache size accounting.
    pub fn estimated_size(&self) -> usize {
        self.content.len()
            + self.model.len()
            + self.stop_reason.as_ref().map_or(0, |s| s.len())
            + std::mem::size_of::<Self>()
    }
}

/// Token usage from a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A chat-completion backend for one provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Execute a chat completion.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Provider name as it appears in the catalog.
    fn name(&self) -> &str;
}

/// The operation the orchestrator wraps with breakers and retries.
///
/// Implemented by [`ProviderSet`] and by any
/// `Fn(Target, RequestContext) -> impl Future<Output = Result<..>>`.
#[async_trait]
pub trait ProviderCaller: Send + Sync {
    async fn call(
        &self,
        target: &Target,
        context: &RequestContext,
    ) -> Result<CompletionResponse, ProviderError>;
}

#[async_trait]
impl<F, Fut> ProviderCaller for F
where
    F: Fn(Target, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CompletionResponse, ProviderError>> + Send,
{
    async fn call(
        &self,
        target: &Target,
        context: &RequestContext,
    ) -> Result<CompletionResponse, ProviderError> {
        (self)(target.clone(), context.clone()).await
    }
}
