//! Per-attempt timeouts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use routewise_core::Target;

/// Timeout for a single provider attempt. The most specific setting wins:
/// model, then provider, then the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "crate::config::duration_str")]
    pub default: Duration,

    /// Keyed by provider name
    #[serde(with = "crate::config::duration_map")]
    pub per_provider: BTreeMap<String, Duration>,

    /// Keyed by model name
    #[serde(with = "crate::config::duration_map")]
    pub per_model: BTreeMap<String, Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(60),
            per_provider: BTreeMap::new(),
            per_model: BTreeMap::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn for_target(&self, target: &Target) -> Duration {
        self.per_model
            .get(&target.model)
            .or_else(|| self.per_provider.get(&target.provider))
            .copied()
            .unwrap_or(self.default)
    }
}
