//! Request-scoped types shared by the selector and the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default endpoint used when a request does not name one.
pub const DEFAULT_ENDPOINT: &str = "/v1/chat";

/// Coarse difficulty bucket used to match queries to models.
///
/// Ordering is meaningful: `Simple < Medium < Complex`. The selector relies
/// on it when falling back to the nearest lower tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl ComplexityTier {
    /// All tiers, lowest first.
    pub const ALL: [ComplexityTier; 3] = [
        ComplexityTier::Simple,
        ComplexityTier::Medium,
        ComplexityTier::Complex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Medium => "medium",
            ComplexityTier::Complex => "complex",
        }
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the selector trades cost against quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostMode {
    /// Cheapest blended cost first
    CostOptimized,

    /// Quality discounted by normalized cost
    #[default]
    Balanced,

    /// Highest quality score first
    QualityOptimized,
}

impl CostMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostMode::CostOptimized => "cost_optimized",
            CostMode::Balanced => "balanced",
            CostMode::QualityOptimized => "quality_optimized",
        }
    }
}

impl fmt::Display for CostMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CostMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cost_optimized" | "cost" => Ok(CostMode::CostOptimized),
            "balanced" => Ok(CostMode::Balanced),
            "quality_optimized" | "quality" => Ok(CostMode::QualityOptimized),
            other => Err(format!(
                "unknown cost mode '{}' (expected cost_optimized, balanced or quality_optimized)",
                other
            )),
        }
    }
}

/// A concrete (provider, model) pair to attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub provider: String,
    pub model: String,
}

impl Target {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// One inbound call, created per request and discarded after the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// The user query text
    pub query: String,

    /// Agent persona handling the request
    #[serde(default)]
    pub agent_name: String,

    /// Endpoint the request arrived on (cache scoping and TTL lookup)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Provider explicitly requested by the caller
    #[serde(default)]
    pub requested_provider: Option<String>,

    /// Model explicitly requested by the caller
    #[serde(default)]
    pub requested_model: Option<String>,

    /// Cost/quality trade-off
    #[serde(default)]
    pub cost_mode: CostMode,

    /// Streaming responses bypass the cache
    #[serde(default)]
    pub streaming: bool,

    /// Upper bound on completion tokens, if the caller set one
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl RequestContext {
    /// Create a context for a query with all other fields defaulted.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            agent_name: String::new(),
            endpoint: default_endpoint(),
            requested_provider: None,
            requested_model: None,
            cost_mode: CostMode::default(),
            streaming: false,
            max_tokens: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = agent.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.requested_provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.requested_model = Some(model.into());
        self
    }

    pub fn with_cost_mode(mut self, mode: CostMode) -> Self {
        self.cost_mode = mode;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Ordered list of attempts produced by the selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlan {
    /// Complexity the query was classified as
    pub complexity: ComplexityTier,

    /// Candidates in the order they should be tried (never empty)
    pub targets: Vec<Target>,

    /// True when nothing in the catalog matched and the default pair was used
    pub used_default: bool,
}

impl RoutePlan {
    /// The first candidate of the chain.
    pub fn head(&self) -> Option<&Target> {
        self.targets.first()
    }
}
