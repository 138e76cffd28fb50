//! Last-resort degraded target.

use serde::{Deserialize, Serialize};

use routewise_core::Target;

/// A cheap (provider, model) tried once after every chain candidate failed.
///
/// The forced attempt neither consults nor updates the provider's circuit
/// and is not retried. Its response is tagged as degraded and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationPolicy {
    pub provider: String,
    pub model: String,
}

impl DegradationPolicy {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.provider.clone(), self.model.clone())
    }
}
