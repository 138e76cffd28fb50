//! Resilience orchestrator.
//!
//! The orchestrator is the single entry point for a routed request:
//! - Cache lookup first; a hit touches no provider, breaker or retry
//! - Route selection over the current catalog snapshot
//! - Token and budget limits, checked before any provider is called
//! - For each target: breaker gate, then retries around a timed call
//! - Successful responses are recorded for usage and written to the cache
//! - An optional degraded target is tried once the chain is exhausted

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use routewise_core::{
    estimate_tokens, Catalog, ComplexityTier, RequestContext, RoutePlan, Selector, Target,
};

use crate::cache::{CacheStatsSnapshot, CacheTier, Embedder, HashingEmbedder, ResponseCache};
use crate::config::RuntimeConfig;
use crate::events::{EngineEvent, EventBus};
use crate::providers::{CompletionResponse, ErrorCategory, ProviderCaller, ProviderError};
use crate::resilience::{retry, CircuitBreakerRegistry, RetryPolicy};
use crate::usage::{RequestEstimate, UsageSnapshot, UsageTracker};
use crate::RuntimeError;

/// Why one target in the chain did not produce a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The breaker refused the call; nothing went out
    CircuitOpen,

    /// The provider failed after `attempts` tries
    Provider {
        error: String,
        category: ErrorCategory,
        attempts: u32,
    },
}

/// One failed target, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    pub target: Target,
    #[serde(flatten)]
    pub reason: FailureReason,
}

impl AttemptFailure {
    pub fn circuit_open(target: &Target) -> Self {
        Self {
            target: target.clone(),
            reason: FailureReason::CircuitOpen,
        }
    }

    pub fn provider(target: &Target, error: &ProviderError, attempts: u32) -> Self {
        Self {
            target: target.clone(),
            reason: FailureReason::Provider {
                error: error.to_string(),
                category: error.category(),
                attempts,
            },
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FailureReason::CircuitOpen => write!(f, "{}: circuit open", self.target),
            FailureReason::Provider {
                error, attempts, ..
            } => write!(f, "{}: {} (after {} attempts)", self.target, error, attempts),
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseSource {
    Cache { tier: CacheTier },
    Provider,
    /// The degraded target, after every chain target failed
    Degraded,
}

/// A response plus how it was obtained.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: Arc<CompletionResponse>,

    pub source: ResponseSource,

    /// Target that answered; `None` for cache hits
    pub target: Option<Target>,

    /// Query complexity; `None` for cache hits, which skip selection
    pub complexity: Option<ComplexityTier>,

    /// Targets that failed before this response was obtained
    pub failures: Vec<AttemptFailure>,
}

impl RoutedResponse {
    pub fn is_degraded(&self) -> bool {
        self.source == ResponseSource::Degraded
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.source, ResponseSource::Cache { .. })
    }
}

/// Routes requests across providers with breakers, retries and caching.
///
/// All shared state (breakers, cache, usage) is owned here and synchronised
/// per provider or per cache operation, so one orchestrator serves any
/// number of concurrent requests.
pub struct ResilienceOrchestrator {
    /// Swapped whole on reload; requests keep the snapshot they started with
    catalog: RwLock<Arc<Catalog>>,

    selector: Selector,

    breakers: Arc<CircuitBreakerRegistry>,

    cache: ResponseCache,

    usage: UsageTracker,

    config: RuntimeConfig,

    events: EventBus,
}

impl ResilienceOrchestrator {
    /// Create an orchestrator with the built-in hashing embedder.
    pub fn new(catalog: Catalog, config: RuntimeConfig) -> Self {
        let embedder = Arc::new(HashingEmbedder::new(config.cache.semantic.dimensions));
        Self::assemble(catalog, config, embedder)
    }

    pub fn builder() -> ResilienceOrchestratorBuilder {
        ResilienceOrchestratorBuilder::new()
    }

    fn assemble(catalog: Catalog, config: RuntimeConfig, embedder: Arc<dyn Embedder>) -> Self {
        let events = EventBus::default();
        let breakers = Arc::new(CircuitBreakerRegistry::with_overrides(
            config.circuit_breaker.clone(),
            config.circuit_breaker_overrides.clone(),
            events.clone(),
        ));
        register_providers(&breakers, &catalog);

        let cache = ResponseCache::with_embedder(config.cache.clone(), embedder, events.clone());

        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            selector: Selector::new(config.selector.clone()),
            breakers,
            cache,
            usage: UsageTracker::with_reset_hour(config.cost_control.budget.reset_hour),
            config,
            events,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The catalog new requests are routed against.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// Replace the catalog in one step.
    ///
    /// Requests already in flight finish against the catalog they started
    /// with. Breaker state of providers present in both catalogs is kept.
    pub fn reload_catalog(&self, catalog: Catalog) {
        register_providers(&self.breakers, &catalog);
        let providers = catalog.providers.len();
        *self.catalog.write() = Arc::new(catalog);
        tracing::info!(providers, "Catalog reloaded");
    }

    /// Close every circuit and clear its counters.
    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    /// Receive breaker, cache and degradation events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The chain a request would try right now, after the cost guard.
    ///
    /// Fails with [`RuntimeError::CostLimitExceeded`] when the request is
    /// over a token or budget limit.
    pub fn plan(&self, ctx: &RequestContext) -> Result<RoutePlan, RuntimeError> {
        self.plan_with(ctx, &self.catalog())
    }

    /// Token counts and cost of a request, priced at the plan's first target.
    pub fn estimate(
        &self,
        ctx: &RequestContext,
        plan: &RoutePlan,
        catalog: &Catalog,
    ) -> RequestEstimate {
        let input_tokens = estimate_tokens(&ctx.query) as u64;
        let output_tokens = u64::from(
            ctx.max_tokens
                .unwrap_or(self.config.cost_control.expected_output_tokens),
        );
        let cost_usd = plan
            .head()
            .and_then(|head| catalog.model(&head.provider, &head.model))
            .map_or(0.0, |model| model.estimate_cost(input_tokens, output_tokens));

        RequestEstimate {
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }

    fn plan_with(&self, ctx: &RequestContext, catalog: &Catalog) -> Result<RoutePlan, RuntimeError> {
        let mode = self
            .config
            .cost_control
            .effective_mode(ctx.cost_mode, self.usage.spend_usd());

        let plan = if mode == ctx.cost_mode {
            self.selector.select_chain(ctx, catalog)?
        } else {
            let downgraded = ctx.clone().with_cost_mode(mode);
            self.selector.select_chain(&downgraded, catalog)?
        };

        if plan.targets.is_empty() {
            return Err(RuntimeError::NoProviderAvailable(
                "route selection produced no targets".to_string(),
            ));
        }

        let estimate = self.estimate(ctx, &plan, catalog);
        self.config
            .cost_control
            .admit(&estimate, &self.usage.window_spend())?;
        Ok(plan)
    }

    /// Serve one request.
    ///
    /// Returns a cached response when there is one. Otherwise checks the
    /// cost limits, then tries each target of the chain in order, skipping
    /// providers whose circuit is open, and returns the first success. Provider failures never surface
    /// individually: once every target (and the degraded target, if
    /// configured) has failed, they are returned together in
    /// [`RuntimeError::AllProvidersExhausted`].
    ///
    /// Dropping the returned future mid-call reports a failure to the
    /// breaker of the provider being called.
    pub async fn handle<C>(
        &self,
        ctx: &RequestContext,
        caller: &C,
    ) -> Result<RoutedResponse, RuntimeError>
    where
        C: ProviderCaller + ?Sized,
    {
        if let Some(hit) = self.cache.lookup(ctx).await {
            return Ok(RoutedResponse {
                response: hit.response,
                source: ResponseSource::Cache { tier: hit.tier },
                target: None,
                complexity: None,
                failures: Vec::new(),
            });
        }

        let catalog = self.catalog();
        let plan = self.plan_with(ctx, &catalog)?;
        let mut failures = Vec::new();

        for target in &plan.targets {
            let Some(permit) = self.breakers.try_acquire_registered(&target.provider) else {
                tracing::debug!(
                    provider = %target.provider,
                    model = %target.model,
                    "Circuit open, skipping target"
                );
                failures.push(AttemptFailure::circuit_open(target));
                continue;
            };

            let policy = self.config.retry_policy_for(&target.provider);
            let (result, attempts) = self.attempt(target, ctx, caller, policy).await;
            match result {
                Ok(response) => {
                    permit.succeed();
                    let response = Arc::new(response);
                    self.record_usage(&catalog, target, &response);
                    self.cache.store(ctx, Arc::clone(&response)).await;

                    if !failures.is_empty() {
                        tracing::info!(
                            provider = %target.provider,
                            model = %target.model,
                            skipped = failures.len(),
                            "Served by fallback target"
                        );
                    }
                    return Ok(RoutedResponse {
                        response,
                        source: ResponseSource::Provider,
                        target: Some(target.clone()),
                        complexity: Some(plan.complexity),
                        failures,
                    });
                }
                Err(err) => {
                    permit.fail();
                    tracing::warn!(
                        provider = %target.provider,
                        model = %target.model,
                        attempts,
                        error = %err,
                        "Target failed, advancing chain"
                    );
                    failures.push(AttemptFailure::provider(target, &err, attempts));
                }
            }
        }

        if let Some(policy) = &self.config.degradation {
            let target = policy.target();
            tracing::warn!(
                provider = %target.provider,
                model = %target.model,
                failed = failures.len(),
                "Chain exhausted, trying degraded target"
            );

            let (result, attempts) = self
                .attempt(&target, ctx, caller, &RetryPolicy::no_retry())
                .await;
            match result {
                Ok(response) => {
                    let response = Arc::new(response);
                    self.record_usage(&catalog, &target, &response);
                    self.events.emit(EngineEvent::Degraded {
                        target: target.clone(),
                    });
                    return Ok(RoutedResponse {
                        response,
                        source: ResponseSource::Degraded,
                        target: Some(target),
                        complexity: Some(plan.complexity),
                        failures,
                    });
                }
                Err(err) => {
                    failures.push(AttemptFailure::provider(&target, &err, attempts));
                }
            }
        }

        tracing::error!(attempts = failures.len(), "All providers exhausted");
        Err(RuntimeError::AllProvidersExhausted { attempts: failures })
    }

    /// Retried, timed calls to one target.
    async fn attempt<C>(
        &self,
        target: &Target,
        ctx: &RequestContext,
        caller: &C,
        policy: &RetryPolicy,
    ) -> (Result<CompletionResponse, ProviderError>, u32)
    where
        C: ProviderCaller + ?Sized,
    {
        let limit = self.config.timeouts.for_target(target);
        let span = tracing::info_span!(
            "provider_call",
            provider = %target.provider,
            model = %target.model
        );

        let outcome = retry::execute(policy, move || async move {
            call_with_timeout(caller, target, ctx, limit).await
        })
        .instrument(span)
        .await;

        (outcome.result, outcome.attempts)
    }

    fn record_usage(&self, catalog: &Catalog, target: &Target, response: &CompletionResponse) {
        let cost = self.usage.record(
            target,
            &response.usage,
            catalog.model(&target.provider, &target.model),
        );
        tracing::debug!(
            provider = %target.provider,
            model = %target.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            cost_usd = cost,
            "Recorded usage"
        );
    }
}

/// Catalog providers, and the default pair's provider, get a lasting circuit.
/// Anything else a caller pins is called without one.
fn register_providers(breakers: &CircuitBreakerRegistry, catalog: &Catalog) {
    breakers.register(catalog.providers.iter().map(|p| p.name.as_str()));
    if let Some(default) = catalog.default.to_target() {
        breakers.register([default.provider.as_str()]);
    }
}

async fn call_with_timeout<C>(
    caller: &C,
    target: &Target,
    ctx: &RequestContext,
    limit: Duration,
) -> Result<CompletionResponse, ProviderError>
where
    C: ProviderCaller + ?Sized,
{
    match tokio::time::timeout(limit, caller.call(target, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}

/// Builder for [`ResilienceOrchestrator`].
pub struct ResilienceOrchestratorBuilder {
    catalog: Option<Catalog>,
    config: RuntimeConfig,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ResilienceOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            catalog: None,
            config: RuntimeConfig::default(),
            embedder: None,
        }
    }

    /// Set the catalog. Without one, only the built-in default pair is routed to.
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the embedder backing the semantic cache tier.
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Validate the configuration and build the orchestrator.
    pub fn build(self) -> Result<ResilienceOrchestrator, RuntimeError> {
        self.config.validate()?;

        let catalog = self.catalog.unwrap_or_else(Catalog::empty);
        let embedder = self.embedder.unwrap_or_else(|| {
            Arc::new(HashingEmbedder::new(self.config.cache.semantic.dimensions))
        });
        Ok(ResilienceOrchestrator::assemble(catalog, self.config, embedder))
    }
}

impl Default for ResilienceOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TokenUsage;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, DegradationPolicy};
    use crate::usage::{BudgetLimits, CostControl, CostViolation, TokenLimits};
    use routewise_core::CostMode;
    use std::collections::HashSet;

    const CATALOG: &str = r#"
version: "1"
default:
  provider: a
  model: a-small
providers:
  - name: a
    priority: 1
    fallbackChain: [b]
    models:
      - name: a-small
        inputCostPerMTok: 0.1
        outputCostPerMTok: 0.5
        qualityScore: 6
        complexityTier: simple
  - name: b
    priority: 2
    models:
      - name: b-small
        inputCostPerMTok: 0.15
        outputCostPerMTok: 0.6
        qualityScore: 6
        complexityTier: simple
"#;

    const SIMPLE: &str = "What time is it?";

    fn catalog() -> Catalog {
        Catalog::from_yaml(CATALOG).unwrap()
    }

    /// Cache off, so every request reaches the chain.
    fn uncached() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.cache.enabled = false;
        config
    }

    fn trip(orch: &ResilienceOrchestrator, provider: &str) {
        let breakers = orch.breakers();
        for _ in 0..breakers.config_for(provider).failure_threshold {
            let admission = breakers.allow(provider).unwrap();
            breakers.record_failure(provider, admission);
        }
        assert_eq!(breakers.state(provider), CircuitState::Open);
    }

    fn orchestrator(config: RuntimeConfig) -> ResilienceOrchestrator {
        ResilienceOrchestrator::builder()
            .catalog(catalog())
            .config(config)
            .build()
            .unwrap()
    }

    /// Fake provider layer: named providers fail with a fixed error, the
    /// rest answer. Every call is logged.
    struct Scripted {
        failing: parking_lot::Mutex<HashSet<String>>,
        hanging: HashSet<String>,
        error: ProviderError,
        calls: parking_lot::Mutex<Vec<Target>>,
    }

    impl Scripted {
        fn healthy() -> Self {
            Self::failing(&[])
        }

        fn failing(providers: &[&str]) -> Self {
            Self {
                failing: parking_lot::Mutex::new(providers.iter().map(|p| p.to_string()).collect()),
                hanging: HashSet::new(),
                error: ProviderError::ApiError {
                    status: 503,
                    message: "overloaded".into(),
                },
                calls: parking_lot::Mutex::new(Vec::new()),
            }
        }

        fn with_error(mut self, error: ProviderError) -> Self {
            self.error = error;
            self
        }

        fn hanging(mut self, provider: &str) -> Self {
            self.hanging.insert(provider.to_string());
            self
        }

        fn recover(&self, provider: &str) {
            self.failing.lock().remove(provider);
        }

        fn calls_to(&self, provider: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|t| t.provider == provider)
                .count()
        }
    }

    #[async_trait::async_trait]
    impl ProviderCaller for Scripted {
        async fn call(
            &self,
            target: &Target,
            ctx: &RequestContext,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.lock().push(target.clone());
            if self.hanging.contains(&target.provider) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing.lock().contains(&target.provider) {
                return Err(self.error.clone());
            }
            Ok(CompletionResponse {
                usage: TokenUsage::new(1000, 1000),
                ..CompletionResponse::text(&target.model, format!("{} says: {}", target, ctx.query))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_skipped_for_fallback() {
        let orch = orchestrator(uncached());
        let caller = Scripted::healthy();

        // Trip A's breaker directly.
        trip(&orch, "a");

        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();

        assert_eq!(routed.target, Some(Target::new("b", "b-small")));
        assert_eq!(routed.source, ResponseSource::Provider);
        assert_eq!(routed.failures, vec![AttemptFailure::circuit_open(&Target::new("a", "a-small"))]);
        assert_eq!(caller.calls_to("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_trip_breaker() {
        let orch = orchestrator(uncached());
        let caller = Scripted::failing(&["a"]);
        let mut events = orch.subscribe();

        for i in 0..5 {
            let routed = orch
                .handle(&RequestContext::new(format!("question {}", i)), &caller)
                .await
                .unwrap();
            assert_eq!(routed.target, Some(Target::new("b", "b-small")));
        }
        // Three attempts per request under the default policy.
        assert_eq!(caller.calls_to("a"), 15);
        assert_eq!(orch.breakers().state("a"), CircuitState::Open);

        let routed = orch.handle(&RequestContext::new("question 6"), &caller).await.unwrap();
        assert_eq!(caller.calls_to("a"), 15);
        assert!(matches!(routed.failures[0].reason, FailureReason::CircuitOpen));

        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            EngineEvent::CircuitTransition { ref provider, to: CircuitState::Open, .. } if provider == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_count_as_one_breaker_failure() {
        let orch = orchestrator(uncached());
        let caller = Scripted::failing(&["a"]);

        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();

        assert_eq!(caller.calls_to("a"), 3);
        assert_eq!(orch.breakers().snapshot("a").consecutive_failures, 1);
        assert_eq!(
            routed.failures[0].reason,
            FailureReason::Provider {
                error: "API error: 503 - overloaded".to_string(),
                category: ErrorCategory::ServerError,
                attempts: 3,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_skips_retries() {
        let orch = orchestrator(uncached());
        let caller = Scripted::failing(&["a"]).with_error(ProviderError::AuthError("bad key".into()));

        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();

        assert_eq!(caller.calls_to("a"), 1);
        assert_eq!(routed.target, Some(Target::new("b", "b-small")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let mut config = uncached();
        config.retry.initial_delay = Duration::from_millis(100);
        let orch = orchestrator(config);

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let attempts = &attempts;
        let caller = move |target: Target, _ctx: RequestContext| async move {
            if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                Err(ProviderError::Connection("reset".into()))
            } else {
                Ok(CompletionResponse::text(target.model, "third time lucky"))
            }
        };

        let started = tokio::time::Instant::now();
        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();

        assert_eq!(routed.target, Some(Target::new("a", "a-small")));
        assert_eq!(routed.response.content, "third time lucky");
        assert!(routed.failures.is_empty());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

        // ~100ms + ~200ms of backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(295) && waited <= Duration::from_millis(305));
        assert_eq!(orch.breakers().snapshot("a").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chain_reports_every_target() {
        let orch = orchestrator(uncached());
        let caller = Scripted::failing(&["a", "b"]);

        let err = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap_err();
        match err {
            RuntimeError::AllProvidersExhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].target, Target::new("a", "a-small"));
                assert_eq!(attempts[1].target, Target::new("b", "b-small"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_cost_optimized_ranks_cheaper_first() {
        let yaml = CATALOG.replace("complexityTier: simple", "complexityTier: medium");
        let orch = ResilienceOrchestrator::new(Catalog::from_yaml(&yaml).unwrap(), uncached());
        let ctx = RequestContext::new(
            "Summarize the main differences between optimistic and pessimistic locking.",
        )
        .with_cost_mode(CostMode::CostOptimized);

        let plan = orch.plan(&ctx).unwrap();
        assert_eq!(plan.complexity, ComplexityTier::Medium);
        assert_eq!(
            plan.targets,
            vec![Target::new("a", "a-small"), Target::new("b", "b-small")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_is_served_from_cache() {
        let orch = orchestrator(RuntimeConfig::default());
        let caller = Scripted::healthy();

        let first = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();
        let second = orch
            .handle(&RequestContext::new("  what TIME is it? "), &caller)
            .await
            .unwrap();

        assert_eq!(first.source, ResponseSource::Provider);
        assert_eq!(second.source, ResponseSource::Cache { tier: CacheTier::Exact });
        assert!(second.is_cached());
        assert_eq!(second.response, first.response);
        assert_eq!(caller.calls.lock().len(), 1);
        assert_eq!(orch.cache_stats().exact_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_request_bypasses_cache() {
        let orch = orchestrator(RuntimeConfig::default());
        let caller = Scripted::healthy();
        let ctx = RequestContext::new(SIMPLE).streaming(true);

        orch.handle(&ctx, &caller).await.unwrap();
        orch.handle(&ctx, &caller).await.unwrap();

        assert_eq!(caller.calls.lock().len(), 2);
        assert!(orch.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_target_is_tagged_and_not_cached() {
        let mut config = RuntimeConfig::default();
        config.degradation = Some(DegradationPolicy::new("c", "c-tiny"));
        let orch = orchestrator(config);
        let caller = Scripted::failing(&["a", "b"]);
        let mut events = orch.subscribe();

        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();

        assert!(routed.is_degraded());
        assert_eq!(routed.target, Some(Target::new("c", "c-tiny")));
        assert_eq!(routed.failures.len(), 2);
        assert_eq!(caller.calls_to("c"), 1);
        assert!(orch.cache().is_empty());
        assert_eq!(orch.breakers().snapshot("c").consecutive_failures, 0);

        let mut saw_degraded = false;
        while let Ok(event) = events.try_recv() {
            saw_degraded |= matches!(event, EngineEvent::Degraded { .. });
        }
        assert!(saw_degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_failure_is_reported() {
        let mut config = uncached();
        config.degradation = Some(DegradationPolicy::new("c", "c-tiny"));
        let orch = orchestrator(config);
        let caller = Scripted::failing(&["a", "b", "c"]);

        let err = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AllProvidersExhausted { ref attempts } if attempts.len() == 3));
        // Degraded target is tried once, never retried.
        assert_eq!(caller.calls_to("c"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out_and_falls_through() {
        let mut config = uncached();
        config.timeouts.per_provider.insert("a".to_string(), Duration::from_secs(5));
        config.retry_overrides.insert("a".to_string(), RetryPolicy::no_retry());
        let orch = orchestrator(config);
        let caller = Scripted::healthy().hanging("a");

        let started = tokio::time::Instant::now();
        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();

        assert_eq!(routed.target, Some(Target::new("b", "b-small")));
        assert!(matches!(
            routed.failures[0].reason,
            FailureReason::Provider { category: ErrorCategory::Timeout, attempts: 1, .. }
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_reports_failure() {
        let mut config = uncached();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let orch = orchestrator(config);
        let caller = Scripted::healthy().hanging("a");

        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            orch.handle(&RequestContext::new(SIMPLE), &caller),
        )
        .await;

        assert!(cancelled.is_err());
        assert_eq!(caller.calls_to("a"), 1);
        assert_eq!(orch.breakers().state("a"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let mut config = uncached();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        };
        config.retry = RetryPolicy::no_retry();
        let orch = orchestrator(config);
        let caller = Scripted::failing(&["a"]);

        orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();
        assert_eq!(orch.breakers().state("a"), CircuitState::Open);

        caller.recover("a");
        tokio::time::advance(Duration::from_secs(10)).await;
        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();
        assert_eq!(routed.target, Some(Target::new("b", "b-small")));

        tokio::time::advance(Duration::from_secs(21)).await;
        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();
        assert_eq!(routed.target, Some(Target::new("a", "a-small")));
        assert_eq!(orch.breakers().state("a"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reload_swaps_catalog() {
        let orch = orchestrator(uncached());
        let ctx = RequestContext::new(SIMPLE);
        assert_eq!(orch.plan(&ctx).unwrap().head(), Some(&Target::new("a", "a-small")));

        let yaml = CATALOG.replace(
            "name: a\n    priority: 1",
            "name: a\n    priority: 1\n    enabled: false",
        );
        orch.reload_catalog(Catalog::from_yaml(&yaml).unwrap());

        assert_eq!(orch.plan(&ctx).unwrap().head(), Some(&Target::new("b", "b-small")));
        assert!(!orch.catalog().provider("a").unwrap().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_breakers() {
        let orch = orchestrator(uncached());
        trip(&orch, "a");
        orch.reset_breakers();

        let caller = Scripted::healthy();
        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();
        assert_eq!(routed.target, Some(Target::new("a", "a-small")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spend_limit_downgrades_quality_requests() {
        // B is pricier but better.
        let yaml = CATALOG.replace(
            "outputCostPerMTok: 0.6\n        qualityScore: 6",
            "outputCostPerMTok: 0.6\n        qualityScore: 9",
        );
        let mut config = uncached();
        config.cost_control = CostControl {
            downgrade_after_usd: Some(0.0005),
            ..Default::default()
        };
        let orch = ResilienceOrchestrator::builder()
            .catalog(Catalog::from_yaml(&yaml).unwrap())
            .config(config)
            .build()
            .unwrap();
        let caller = Scripted::healthy();
        let ctx = RequestContext::new(SIMPLE).with_cost_mode(CostMode::QualityOptimized);

        let first = orch.handle(&ctx, &caller).await.unwrap();
        assert_eq!(first.target, Some(Target::new("b", "b-small")));

        // 1000 * $0.15/MTok + 1000 * $0.6/MTok = $0.00075
        let usage = orch.usage();
        assert!((usage.total.estimated_cost_usd - 0.00075).abs() < 1e-9);

        let second = orch.handle(&ctx, &caller).await.unwrap();
        assert_eq!(second.target, Some(Target::new("a", "a-small")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests() {
        let orch = orchestrator(RuntimeConfig::default());
        let caller = Scripted::healthy();

        let contexts: Vec<RequestContext> = (0..20)
            .map(|i| RequestContext::new(format!("ping {}", i)))
            .collect();
        let results =
            futures::future::join_all(contexts.iter().map(|ctx| orch.handle(ctx, &caller))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(orch.usage().total.calls, 20);
        assert_eq!(orch.cache().len(), 20);
    }

    #[tokio::test]
    async fn test_empty_catalog_routes_to_default_pair() {
        let orch = ResilienceOrchestrator::builder().build().unwrap();
        let caller = Scripted::healthy();

        let routed = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();
        assert_eq!(routed.target, Some(Target::new("openai", "gpt-4o-mini")));
        assert_eq!(orch.usage().per_target[0].usage.estimated_cost_usd, 0.0);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = RuntimeConfig::default();
        config.retry.max_attempts = 0;
        let err = ResilienceOrchestrator::builder().config(config).build();
        assert!(matches!(err, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_failure_serializes_with_kind() {
        let failure = AttemptFailure::provider(
            &Target::new("a", "a-small"),
            &ProviderError::Timeout(Duration::from_secs(5)),
            3,
        );
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "provider");
        assert_eq!(json["category"], "timeout");
        assert_eq!(json["attempts"], 3);
        assert_eq!(json["target"]["provider"], "a");
    }

    #[tokio::test]
    async fn test_request_over_per_request_limit_is_refused() {
        let mut config = uncached();
        config.cost_control.budget = BudgetLimits {
            per_request_usd: Some(0.1),
            ..Default::default()
        };
        let orch = orchestrator(config);
        let caller = Scripted::healthy();

        // a-small: 1M output tokens at $0.5/MTok
        let ctx = RequestContext::new(SIMPLE).with_max_tokens(1_000_000);
        let err = orch.handle(&ctx, &caller).await.unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::CostLimitExceeded(CostViolation::PerRequest { limit_usd, .. }) if limit_usd == 0.1
        ));
        assert!(caller.calls.lock().is_empty());

        let small = RequestContext::new(SIMPLE).with_max_tokens(100);
        assert!(orch.handle(&small, &caller).await.is_ok());
    }

    #[tokio::test]
    async fn test_daily_budget_stops_requests() {
        let mut config = uncached();
        config.cost_control.budget.daily_usd = Some(0.001);
        let orch = orchestrator(config);
        let caller = Scripted::healthy();

        // Each answer costs 1000 * $0.1/MTok + 1000 * $0.5/MTok = $0.0006
        orch.handle(&RequestContext::new("first"), &caller).await.unwrap();
        orch.handle(&RequestContext::new("second"), &caller).await.unwrap();

        let err = orch
            .handle(&RequestContext::new("third"), &caller)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::CostLimitExceeded(CostViolation::Daily { .. })
        ));
        assert_eq!(caller.calls.lock().len(), 2);
        assert!((orch.usage().window.daily_usd - 0.0012).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_token_limit_refuses_plan() {
        let mut config = uncached();
        config.cost_control.token_limits = TokenLimits {
            max_input_tokens: Some(2),
            ..Default::default()
        };
        let orch = orchestrator(config);

        let err = orch.plan(&RequestContext::new(SIMPLE)).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::CostLimitExceeded(CostViolation::InputTokens { tokens: 4, limit: 2 })
        ));
        assert!(orch.plan(&RequestContext::new("hi")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_answer_served_over_budget() {
        let mut config = RuntimeConfig::default();
        config.cost_control.budget.daily_usd = Some(0.0005);
        let orch = orchestrator(config);
        let caller = Scripted::healthy();

        orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();

        let cached = orch.handle(&RequestContext::new(SIMPLE), &caller).await.unwrap();
        assert!(cached.is_cached());

        let err = orch
            .handle(&RequestContext::new("Something new entirely"), &caller)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CostLimitExceeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pins_outside_catalog_leave_no_circuit() {
        let orch = orchestrator(uncached());
        let caller = Scripted::failing(&["ghost-0", "ghost-1", "ghost-2"]);

        for i in 0..3 {
            let ctx = RequestContext::new(SIMPLE)
                .with_provider(format!("ghost-{}", i))
                .with_model("m");
            let err = orch.handle(&ctx, &caller).await.unwrap_err();
            assert!(matches!(err, RuntimeError::AllProvidersExhausted { .. }));
        }

        let known: Vec<_> = orch
            .breakers()
            .snapshots()
            .into_iter()
            .map(|s| s.provider)
            .collect();
        assert_eq!(known, vec!["a", "b"]);
    }
}
