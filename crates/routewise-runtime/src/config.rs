//! Runtime configuration.
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration. Durations are written in human form ("250ms", "30s").
//!
//! ```yaml
//! circuit_breaker:
//!   failure_threshold: 5
//!   recovery_timeout: 60s
//! retry:
//!   max_attempts: 3
//!   initial_delay: 1s
//! cache:
//!   default_ttl: 1h
//!   per_endpoint_ttl:
//!     /v1/stream: 0s
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use routewise_core::SelectorConfig;

use crate::cache::CacheConfig;
use crate::resilience::{CircuitBreakerConfig, DegradationPolicy, RetryPolicy, TimeoutConfig};
use crate::usage::CostControl;

/// Errors from loading or validating runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Breaker thresholds applied to every provider
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-provider breaker thresholds
    pub circuit_breaker_overrides: BTreeMap<String, CircuitBreakerConfig>,

    /// Retry policy applied to every provider
    pub retry: RetryPolicy,

    /// Per-provider retry policies
    pub retry_overrides: BTreeMap<String, RetryPolicy>,

    pub timeouts: TimeoutConfig,

    pub cache: CacheConfig,

    pub selector: SelectorConfig,

    /// Last-resort target tried after the chain is exhausted
    pub degradation: Option<DegradationPolicy>,

    pub cost_control: CostControl,
}

impl RuntimeConfig {
    /// Parse and validate configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Retry policy for a provider, falling back to the shared policy.
    pub fn retry_policy_for(&self, provider: &str) -> &RetryPolicy {
        self.retry_overrides.get(provider).unwrap_or(&self.retry)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let breakers = std::iter::once(("default", &self.circuit_breaker)).chain(
            self.circuit_breaker_overrides
                .iter()
                .map(|(name, cfg)| (name.as_str(), cfg)),
        );
        for (name, cfg) in breakers {
            cfg.validate()
                .map_err(|e| ConfigError::Invalid(format!("circuit_breaker[{}]: {}", name, e)))?;
        }

        let policies = std::iter::once(("default", &self.retry)).chain(
            self.retry_overrides
                .iter()
                .map(|(name, policy)| (name.as_str(), policy)),
        );
        for (name, policy) in policies {
            policy
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("retry[{}]: {}", name, e)))?;
        }

        self.cache
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("cache: {}", e)))?;

        let classifier = &self.selector.classifier;
        if classifier.simple_max_tokens >= classifier.complex_min_tokens {
            return Err(ConfigError::Invalid(format!(
                "selector: simple_max_tokens ({}) must be below complex_min_tokens ({})",
                classifier.simple_max_tokens, classifier.complex_min_tokens
            )));
        }

        self.cost_control
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("cost_control: {}", e)))?;

        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<std::time::Duration, String> {
        match self {
            RawDuration::Seconds(secs) => Ok(std::time::Duration::from_secs(secs)),
            RawDuration::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|e| format!("invalid duration '{}': {}", text, e)),
        }
    }
}

/// Serde helper: a duration as "1m 30s", or a bare number of seconds.
pub(crate) mod duration_str {
    use super::RawDuration;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(D::Error::custom)
    }
}

/// Serde helper: a name-to-duration map in the same format.
pub(crate) mod duration_map {
    use super::RawDuration;
    use serde::{de::Error, ser::SerializeMap, Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn serialize<S>(map: &BTreeMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, duration) in map {
            out.serialize_entry(key, &humantime::format_duration(*duration).to_string())?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, RawDuration>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, raw)| {
                raw.into_duration()
                    .map(|duration| (key, duration))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
