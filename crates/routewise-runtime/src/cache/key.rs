//! Cache keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use routewise_core::{normalize_query, RequestContext};

/// Placeholder for a provider or model the caller left to the router.
pub const AUTO: &str = "auto";

/// The `endpoint|agent|provider|model` part of a request.
///
/// Semantic matches are only considered between entries of the same scope,
/// so a cached answer never crosses agents or explicit model choices. Each
/// component is length-prefixed, so a `|` inside caller-supplied text cannot
/// shift a component boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheScope(String);

impl CacheScope {
    pub fn from_context(ctx: &RequestContext) -> Self {
        let provider = ctx.requested_provider.as_deref().unwrap_or(AUTO);
        let model = ctx.requested_model.as_deref().unwrap_or(AUTO);
        let parts = [ctx.endpoint.as_str(), ctx.agent_name.as_str(), provider, model];
        let encoded: Vec<String> = parts
            .iter()
            .map(|part| format!("{}:{}", part.len(), part))
            .collect();
        Self(encoded.join("|"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// SHA-256 over scope and normalized query, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(scope: &CacheScope, normalized_query: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scope.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(normalized_query.as_bytes());
        CacheKey(format!("{:x}", hasher.finalize()))
    }

    /// Key and scope for a request.
    pub fn for_context(ctx: &RequestContext) -> (Self, CacheScope) {
        let scope = CacheScope::from_context(ctx);
        let key = Self::derive(&scope, &normalize_query(&ctx.query));
        (key, scope)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs
        f.write_str(&self.0[..16.min(self.0.len())])
    }
}
