//! Named provider factories and the provider set they build.
//!
//! Adapters register a [`ProviderFactory`] under a type name. A list of
//! [`ProviderSpec`]s (one per catalog provider) is then turned into a
//! [`ProviderSet`], which the orchestrator drives through [`ProviderCaller`].
//!
//! ```ignore
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(MyHttpFactory));
//!
//! let providers = registry.build(&specs)?;
//! let routed = orchestrator.handle(ctx, &providers).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use routewise_core::{RequestContext, Target};

use super::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderCaller, ProviderError,
};

/// Builds provider instances of one type from JSON configuration.
pub trait ProviderFactory: Send + Sync {
    /// Type name this factory is registered under, e.g. "openai-compatible".
    fn provider_type(&self) -> &'static str;

    /// Create a provider instance named `name`.
    fn create(&self, name: &str, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError>;

    /// Check configuration without creating a provider.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    fn description(&self) -> &'static str {
        "LLM Provider"
    }
}

/// One provider instance to build: catalog name, factory type, settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider name as used in the catalog
    pub name: String,

    /// Registered factory type
    #[serde(rename = "type")]
    pub kind: String,

    /// Factory-specific settings
    #[serde(default)]
    pub config: JsonValue,
}

/// Registry of available provider factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A factory with the same type is replaced.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    fn factory(&self, kind: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(kind).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                kind,
                self.available_types()
            ))
        })
    }

    /// Create a single provider.
    pub fn create(&self, spec: &ProviderSpec) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.factory(&spec.kind)?.create(&spec.name, &spec.config)
    }

    pub fn validate(&self, spec: &ProviderSpec) -> Result<(), ProviderError> {
        self.factory(&spec.kind)?.validate_config(&spec.config)
    }

    /// Build every spec into a [`ProviderSet`]. Fails on the first bad spec.
    pub fn build(&self, specs: &[ProviderSpec]) -> Result<ProviderSet, ProviderError> {
        let mut set = ProviderSet::new();
        for spec in specs {
            self.validate(spec)?;
            set.insert(self.create(spec)?);
        }
        Ok(set)
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_type(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.available_types())
            .finish()
    }
}

/// Provider instances keyed by catalog name.
#[derive(Default, Clone)]
pub struct ProviderSet {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider under its own name.
    pub fn insert(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn LlmProvider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("providers", &self.names())
            .finish()
    }
}

#[async_trait]
impl ProviderCaller for ProviderSet {
    async fn call(
        &self,
        target: &Target,
        context: &RequestContext,
    ) -> Result<CompletionResponse, ProviderError> {
        let provider = self.get(&target.provider).ok_or_else(|| {
            ProviderError::NotConfigured(format!("No provider instance for '{}'", target.provider))
        })?;

        let messages = vec![ChatMessage::user(context.query.clone())];
        provider
            .complete(messages, &CompletionConfig::for_model(&target.model))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ErrorCategory, TokenUsage};

    struct EchoProvider {
        name: String,
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn complete(
            &self,
            messages: Vec<ChatMessage>,
            config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(CompletionResponse {
                content: format!("{}: {}", self.name, last),
                usage: TokenUsage::new(10, 5),
                model: config.model.clone(),
                stop_reason: Some("stop".to_string()),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct EchoFactory;

    impl ProviderFactory for EchoFactory {
        fn provider_type(&self) -> &'static str {
            "echo"
        }

        fn create(
            &self,
            name: &str,
            _config: &JsonValue,
        ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
            Ok(Arc::new(EchoProvider {
                name: name.to_string(),
            }))
        }

        fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
            if config.get("reject").is_some() {
                return Err(ProviderError::InvalidRequest("rejected".to_string()));
            }
            Ok(())
        }
    }

    fn spec(name: &str, kind: &str) -> ProviderSpec {
        ProviderSpec {
            name: name.to_string(),
            kind: kind.to_string(),
            config: serde_json::json!({}),
        }
    }

    #[test]
    fn test_registry_build() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EchoFactory));

        let set = registry
            .build(&[spec("openai", "echo"), spec("anthropic", "echo")])
            .unwrap();
        assert_eq!(set.names(), vec!["anthropic", "openai"]);
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = ProviderRegistry::new();
        match registry.build(&[spec("openai", "http")]) {
            Err(ProviderError::NotConfigured(msg)) => {
                assert!(msg.contains("Unknown provider type"));
            }
            other => panic!("Expected NotConfigured error, got {:?}", other),
        }
    }

    #[test]
    fn test_registry_validates_before_create() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EchoFactory));

        let mut bad = spec("openai", "echo");
        bad.config = serde_json::json!({"reject": true});
        assert!(registry.build(&[bad]).is_err());
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = "name: openai\ntype: echo\nconfig:\n  base_url: http://localhost\n";
        let spec: ProviderSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind, "echo");
        assert_eq!(spec.config["base_url"], "http://localhost");
    }

    #[tokio::test]
    async fn test_set_dispatches_by_provider_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EchoFactory));
        let set = registry.build(&[spec("openai", "echo")]).unwrap();

        let response = set
            .call(&Target::new("openai", "gpt-4o-mini"), &RequestContext::new("hi"))
            .await
            .unwrap();
        assert_eq!(response.content, "openai: hi");
        assert_eq!(response.model, "gpt-4o-mini");

        let missing = set
            .call(&Target::new("mistral", "small"), &RequestContext::new("hi"))
            .await
            .unwrap_err();
        assert_eq!(missing.category(), ErrorCategory::NotConfigured);
    }
}
