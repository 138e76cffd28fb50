//! Provider catalog parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::schema::validate_catalog_schema;
use crate::types::{ComplexityTier, Target};

/// Errors that can occur when loading a catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Catalog does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Catalog validation failed: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Relative weights used to blend input and output prices into one number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    pub input: f64,
    pub output: f64,
}

impl Default for CostWeights {
    /// Chat traffic is input-heavy; three input tokens per output token.
    fn default() -> Self {
        Self {
            input: 3.0,
            output: 1.0,
        }
    }
}

/// Pricing and capability metadata for one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelProfile {
    /// Model identifier as understood by the provider
    pub name: String,

    /// USD per million input tokens
    pub input_cost_per_m_tok: f64,

    /// USD per million output tokens
    pub output_cost_per_m_tok: f64,

    /// Quality on a 0-10 scale
    pub quality_score: f64,

    /// Tier of queries this model is meant for
    pub complexity_tier: ComplexityTier,
}

impl ModelProfile {
    /// Weighted average of input and output price, USD per million tokens.
    pub fn blended_cost(&self, weights: &CostWeights) -> f64 {
        let total = weights.input + weights.output;
        if total <= 0.0 {
            return (self.input_cost_per_m_tok + self.output_cost_per_m_tok) / 2.0;
        }
        (self.input_cost_per_m_tok * weights.input + self.output_cost_per_m_tok * weights.output)
            / total
    }

    /// Estimated USD cost of a call with the given token counts.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m_tok
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m_tok
    }
}

/// A provider and the models it serves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProfile {
    /// Provider identifier (e.g. "openai")
    pub name: String,

    /// Tie-break rank, lower is preferred
    #[serde(default)]
    pub priority: u32,

    /// Disabled providers never take part in automatic selection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Models in declaration order
    #[serde(default)]
    pub models: Vec<ModelProfile>,

    /// Providers to try next, in order
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ProviderProfile {
    /// Look up a model by name.
    pub fn model(&self, name: &str) -> Option<&ModelProfile> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Models serving `tier`, or the nearest lower tier this provider has.
    ///
    /// Returns an empty list when the provider only has models above `tier`.
    pub fn models_for_tier(&self, tier: ComplexityTier) -> Vec<&ModelProfile> {
        let nearest = self
            .models
            .iter()
            .map(|m| m.complexity_tier)
            .filter(|t| *t <= tier)
            .max();

        match nearest {
            Some(t) => self.models.iter().filter(|m| m.complexity_tier == t).collect(),
            None => Vec::new(),
        }
    }
}

/// The pair used when nothing in the catalog matches a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultTarget {
    pub provider: String,
    pub model: String,
}

impl Default for DefaultTarget {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl DefaultTarget {
    pub fn to_target(&self) -> Option<Target> {
        if self.provider.trim().is_empty() || self.model.trim().is_empty() {
            None
        } else {
            Some(Target::new(&self.provider, &self.model))
        }
    }
}

/// The provider catalog: immutable once loaded, replaced as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Catalog {
    /// Catalog format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Providers in declaration order
    #[serde(default)]
    pub providers: Vec<ProviderProfile>,

    /// Fallback pair for requests nothing else can serve
    #[serde(default)]
    pub default: DefaultTarget,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Catalog {
    /// A catalog with no providers, only the default pair.
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            providers: Vec::new(),
            default: DefaultTarget::default(),
        }
    }

    /// Build a catalog from profiles, validating it.
    pub fn from_providers(providers: Vec<ProviderProfile>) -> Result<Self, CatalogError> {
        let catalog = Self {
            providers,
            ..Self::empty()
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse a catalog from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, CatalogError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a catalog from JSON string.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a catalog from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a catalog from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse from a file, choosing the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, CatalogError> {
        validate_catalog_schema(&value).map_err(CatalogError::SchemaError)?;
        let catalog: Catalog = serde_json::from_value(value)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Look up a provider by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderProfile> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Look up a model of a provider.
    pub fn model(&self, provider: &str, model: &str) -> Option<&ModelProfile> {
        self.provider(provider).and_then(|p| p.model(model))
    }

    /// Providers that take part in automatic selection.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderProfile> {
        self.providers.iter().filter(|p| p.enabled)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Validate the catalog structure.
    fn validate(&self) -> Result<(), CatalogError> {
        let mut names = HashSet::new();

        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(CatalogError::MissingField("providers[].name".to_string()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(CatalogError::ValidationError(format!(
                    "Duplicate provider: {}",
                    provider.name
                )));
            }
            self.validate_models(provider)?;
        }

        // Fallback chains can only be checked once every name is known.
        for provider in &self.providers {
            for fallback in &provider.fallback_chain {
                if fallback == &provider.name {
                    return Err(CatalogError::ValidationError(format!(
                        "Provider {} lists itself as a fallback",
                        provider.name
                    )));
                }
                if !names.contains(fallback.as_str()) {
                    return Err(CatalogError::ValidationError(format!(
                        "Provider {} falls back to unknown provider {}",
                        provider.name, fallback
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_models(&self, provider: &ProviderProfile) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();

        for model in &provider.models {
            if model.name.trim().is_empty() {
                return Err(CatalogError::MissingField(format!(
                    "providers[{}].models[].name",
                    provider.name
                )));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(CatalogError::ValidationError(format!(
                    "Duplicate model {} in provider {}",
                    model.name, provider.name
                )));
            }
            if !(0.0..=10.0).contains(&model.quality_score) {
                return Err(CatalogError::ValidationError(format!(
                    "Model {}/{} has quality score {} outside 0-10",
                    provider.name, model.name, model.quality_score
                )));
            }
            let prices = [model.input_cost_per_m_tok, model.output_cost_per_m_tok];
            if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(CatalogError::ValidationError(format!(
                    "Model {}/{} has an invalid price",
                    provider.name, model.name
                )));
            }
        }

        Ok(())
    }
}
