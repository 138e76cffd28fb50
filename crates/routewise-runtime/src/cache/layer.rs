//! Two-tier response cache.
//!
//! Lookups try an exact key match first and then, if enabled, the most
//! similar stored query in the same scope. The cache fails open: an
//! embedding failure is logged and treated as a miss.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use routewise_core::{normalize_query, RequestContext};

use super::key::CacheKey;
use super::semantic::{Embedder, EmbeddingMemo, HashingEmbedder};
use super::store::{EntryStore, EvictionPolicy, InsertOutcome, Lookup, NewEntry};
use crate::events::{EngineEvent, EventBus};
use crate::providers::CompletionResponse;

/// Semantic tier settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub enabled: bool,

    /// Minimum cosine similarity for a semantic hit
    pub similarity_threshold: f32,

    /// Query embeddings kept in memory
    pub memo_capacity: u64,

    /// Vector size of the built-in hashing embedder
    pub dimensions: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: 0.85,
            memo_capacity: 10_000,
            dimensions: 256,
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    #[serde(with = "crate::config::duration_str")]
    pub default_ttl: Duration,

    /// TTL by agent name; wins over the endpoint TTL
    #[serde(with = "crate::config::duration_map")]
    pub per_agent_ttl: BTreeMap<String, Duration>,

    /// TTL by endpoint; `0s` disables caching for the endpoint
    #[serde(with = "crate::config::duration_map")]
    pub per_endpoint_ttl: BTreeMap<String, Duration>,

    pub max_entries: usize,

    /// Estimated byte budget for stored entries
    pub max_size_bytes: usize,

    pub eviction_policy: EvictionPolicy,

    pub semantic: SemanticConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(3600),
            per_agent_ttl: BTreeMap::new(),
            per_endpoint_ttl: BTreeMap::new(),
            max_entries: 10_000,
            max_size_bytes: 500 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            semantic: SemanticConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be at least 1".to_string());
        }
        let threshold = self.semantic.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(format!(
                "similarity_threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if self.semantic.dimensions == 0 {
            return Err("semantic dimensions must be at least 1".to_string());
        }
        Ok(())
    }

    /// TTL for a request: agent, then endpoint, then the default.
    pub fn ttl_for(&self, ctx: &RequestContext) -> Duration {
        self.per_agent_ttl
            .get(&ctx.agent_name)
            .or_else(|| self.per_endpoint_ttl.get(&ctx.endpoint))
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Exact,
    Semantic,
}

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: Arc<CompletionResponse>,
    pub tier: CacheTier,
    pub key: CacheKey,
    /// Similarity to the stored query, for semantic hits
    pub similarity: Option<f32>,
}

#[derive(Debug, Default)]
struct CacheStats {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    bypasses: AtomicU64,
    embedding_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Cache counters at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub bypasses: u64,
    pub embedding_failures: u64,
    pub entries: usize,
    pub size_bytes: usize,
}

impl CacheStatsSnapshot {
    /// Hits over lookups that reached the cache. Zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.exact_hits + self.semantic_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Process-local response cache.
pub struct ResponseCache {
    config: CacheConfig,
    store: EntryStore,
    memo: Option<EmbeddingMemo>,
    stats: CacheStats,
    events: EventBus,
}

impl ResponseCache {
    /// Cache using the built-in hashing embedder for the semantic tier.
    pub fn new(config: CacheConfig) -> Self {
        let embedder = Arc::new(HashingEmbedder::new(config.semantic.dimensions));
        Self::with_embedder(config, embedder, EventBus::default())
    }

    pub fn with_embedder(
        config: CacheConfig,
        embedder: Arc<dyn Embedder>,
        events: EventBus,
    ) -> Self {
        let store = EntryStore::new(
            config.eviction_policy,
            config.max_entries,
            config.max_size_bytes,
        );
        let memo = config
            .semantic
            .enabled
            .then(|| EmbeddingMemo::new(embedder, config.semantic.memo_capacity));

        Self {
            config,
            store,
            memo,
            stats: CacheStats::default(),
            events,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Streaming requests, zero-TTL endpoints and a disabled cache skip
    /// both lookup and store.
    pub fn bypasses(&self, ctx: &RequestContext) -> bool {
        !self.config.enabled || ctx.streaming || self.config.ttl_for(ctx).is_zero()
    }

    async fn embedding(&self, ctx: &RequestContext) -> Option<Arc<[f32]>> {
        let memo = self.memo.as_ref()?;
        match memo.embed(&normalize_query(&ctx.query)).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                bump(&self.stats.embedding_failures, 1);
                tracing::warn!(error = %e, "Embedding failed, skipping semantic tier");
                None
            }
        }
    }

    /// Find a cached response for a request.
    pub async fn lookup(&self, ctx: &RequestContext) -> Option<CacheHit> {
        if self.bypasses(ctx) {
            bump(&self.stats.bypasses, 1);
            return None;
        }

        let (key, scope) = CacheKey::for_context(ctx);
        match self.store.get(&key) {
            Lookup::Hit(entry) => {
                bump(&self.stats.exact_hits, 1);
                tracing::debug!(key = %key, "Exact cache hit");
                return Some(self.hit(key, entry.response(), CacheTier::Exact, None));
            }
            Lookup::Expired => {
                bump(&self.stats.expirations, 1);
                tracing::debug!(key = %key, "Cache entry expired");
            }
            Lookup::Miss => {}
        }

        if let Some(embedding) = self.embedding(ctx).await {
            let threshold = self.config.semantic.similarity_threshold;
            if let Some((entry, similarity)) = self.store.semantic_best(&scope, &embedding, threshold)
            {
                bump(&self.stats.semantic_hits, 1);
                tracing::debug!(
                    key = %key,
                    matched = %entry.key(),
                    similarity,
                    "Semantic cache hit"
                );
                return Some(self.hit(
                    entry.key().clone(),
                    entry.response(),
                    CacheTier::Semantic,
                    Some(similarity),
                ));
            }
        }

        bump(&self.stats.misses, 1);
        tracing::debug!(key = %key, "Cache miss");
        self.events.emit(EngineEvent::CacheMiss {
            key: key.as_str().to_string(),
        });
        None
    }

    fn hit(
        &self,
        key: CacheKey,
        response: Arc<CompletionResponse>,
        tier: CacheTier,
        similarity: Option<f32>,
    ) -> CacheHit {
        self.events.emit(EngineEvent::CacheHit {
            key: key.as_str().to_string(),
            tier,
        });
        CacheHit {
            response,
            tier,
            key,
            similarity,
        }
    }

    /// Store a response for a request. Returns whether it was stored.
    pub async fn store(&self, ctx: &RequestContext, response: Arc<CompletionResponse>) -> bool {
        if self.bypasses(ctx) {
            return false;
        }

        let (key, scope) = CacheKey::for_context(ctx);
        let embedding = self.embedding(ctx).await;
        let outcome = self.store.insert(NewEntry {
            key,
            scope,
            response,
            embedding,
            ttl: self.config.ttl_for(ctx),
        });

        if outcome.stored {
            bump(&self.stats.stores, 1);
        }
        self.record_evictions(&outcome);
        outcome.stored
    }

    fn record_evictions(&self, outcome: &InsertOutcome) {
        bump(&self.stats.expirations, outcome.expired as u64);
        bump(&self.stats.evictions, outcome.evicted.len() as u64);
        for key in &outcome.evicted {
            self.events.emit(EngineEvent::CacheEviction {
                key: key.as_str().to_string(),
                policy: self.store.policy(),
            });
        }
    }

    /// Enforce size limits. Returns how many entries were evicted.
    pub fn evict_if_needed(&self) -> usize {
        let outcome = self.store.evict_if_needed();
        self.record_evictions(&outcome);
        outcome.evicted.len()
    }

    pub fn purge_expired(&self) -> usize {
        let purged = self.store.purge_expired();
        bump(&self.stats.expirations, purged as u64);
        purged
    }

    /// Drop every entry and memoised embedding. Counters are kept.
    pub fn clear(&self) -> usize {
        if let Some(memo) = &self.memo {
            memo.invalidate_all();
        }
        self.store.clear()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            exact_hits: load(&self.stats.exact_hits),
            semantic_hits: load(&self.stats.semantic_hits),
            misses: load(&self.stats.misses),
            stores: load(&self.stats.stores),
            evictions: load(&self.stats.evictions),
            expirations: load(&self.stats.expirations),
            bypasses: load(&self.stats.bypasses),
            embedding_failures: load(&self.stats.embedding_failures),
            entries: self.store.len(),
            size_bytes: self.store.size_bytes(),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("store", &self.store)
            .field("semantic", &self.memo.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingError;
    use async_trait::async_trait;

    /// Maps known queries to fixed unit vectors.
    struct FixedEmbedder {
        vectors: BTreeMap<String, Vec<f32>>,
    }

    impl FixedEmbedder {
        fn at_similarity(pairs: &[(&str, f32)]) -> Arc<Self> {
            let vectors = pairs
                .iter()
                .map(|(text, cos)| (text.to_string(), vec![*cos, (1.0 - cos * cos).sqrt()]))
                .collect();
            Arc::new(Self { vectors })
        }
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| EmbeddingError::Backend(format!("unknown text '{}'", text)))
        }
    }

    fn response(content: &str) -> Arc<CompletionResponse> {
        Arc::new(CompletionResponse::text("gpt-4o-mini", content))
    }

    fn semantic_config() -> CacheConfig {
        CacheConfig {
            semantic: SemanticConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_then_lookup_until_expiry() {
        let cache = ResponseCache::new(CacheConfig {
            default_ttl: Duration::from_secs(60),
            ..Default::default()
        });
        let ctx = RequestContext::new("What is Rust?");

        assert!(cache.lookup(&ctx).await.is_none());
        assert!(cache.store(&ctx, response("A language")).await);

        let hit = cache.lookup(&ctx).await.unwrap();
        assert_eq!(hit.tier, CacheTier::Exact);
        assert_eq!(hit.response.content, "A language");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.lookup(&ctx).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.exact_hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_normalised_query_hits_exact_tier() {
        let cache = ResponseCache::default();
        cache
            .store(&RequestContext::new("What is Rust?"), response("A language"))
            .await;

        let hit = cache
            .lookup(&RequestContext::new("  what IS   rust? "))
            .await
            .unwrap();
        assert_eq!(hit.tier, CacheTier::Exact);
    }

    #[tokio::test]
    async fn test_semantic_threshold_boundary() {
        let epsilon = 0.001;
        let embedder = FixedEmbedder::at_similarity(&[
            ("stored question", 1.0),
            ("close question", 0.85 + epsilon),
            ("distant question", 0.85 - epsilon),
        ]);
        let cache = ResponseCache::with_embedder(semantic_config(), embedder, EventBus::default());

        cache
            .store(&RequestContext::new("stored question"), response("cached"))
            .await;

        let hit = cache
            .lookup(&RequestContext::new("close question"))
            .await
            .unwrap();
        assert_eq!(hit.tier, CacheTier::Semantic);
        assert_eq!(hit.response.content, "cached");
        assert!(hit.similarity.unwrap() >= 0.85);

        assert!(cache
            .lookup(&RequestContext::new("distant question"))
            .await
            .is_none());
        assert_eq!(cache.stats().semantic_hits, 1);
    }

    #[tokio::test]
    async fn test_semantic_hit_with_hashing_embedder() {
        let cache = ResponseCache::new(CacheConfig {
            semantic: SemanticConfig {
                enabled: true,
                similarity_threshold: 0.8,
                ..Default::default()
            },
            ..Default::default()
        });
        cache
            .store(
                &RequestContext::new("how do I reset my password please"),
                response("Use the reset link"),
            )
            .await;

        let hit = cache
            .lookup(&RequestContext::new("please, how do I reset my password?"))
            .await
            .unwrap();
        assert_eq!(hit.tier, CacheTier::Semantic);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_open() {
        let embedder = FixedEmbedder::at_similarity(&[("known", 1.0)]);
        let cache = ResponseCache::with_embedder(semantic_config(), embedder, EventBus::default());

        // Stored without an embedding, still served by the exact tier
        assert!(cache.store(&RequestContext::new("unknown"), response("x")).await);
        assert!(cache.lookup(&RequestContext::new("unknown")).await.is_some());
        assert!(cache.lookup(&RequestContext::new("other")).await.is_none());
        assert_eq!(cache.stats().embedding_failures, 2);
    }

    #[tokio::test]
    async fn test_streaming_and_zero_ttl_bypass() {
        let mut config = CacheConfig::default();
        config
            .per_endpoint_ttl
            .insert("/v1/stream".to_string(), Duration::ZERO);
        let cache = ResponseCache::new(config);

        let streaming = RequestContext::new("hi").streaming(true);
        assert!(!cache.store(&streaming, response("x")).await);
        assert!(cache.lookup(&streaming).await.is_none());

        let zero_ttl = RequestContext::new("hi").with_endpoint("/v1/stream");
        assert!(!cache.store(&zero_ttl, response("x")).await);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().bypasses, 1);
    }

    #[test]
    fn test_ttl_resolution_order() {
        let mut config = CacheConfig::default();
        config
            .per_endpoint_ttl
            .insert("/v1/chat".into(), Duration::from_secs(600));
        config
            .per_agent_ttl
            .insert("support".into(), Duration::from_secs(60));

        assert_eq!(
            config.ttl_for(&RequestContext::new("q").with_agent("support")),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.ttl_for(&RequestContext::new("q").with_agent("sales")),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.ttl_for(&RequestContext::new("q").with_endpoint("/v2/chat")),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn test_eviction_events() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let cache = ResponseCache::with_embedder(
            CacheConfig {
                max_entries: 1,
                ..Default::default()
            },
            Arc::new(HashingEmbedder::default()),
            events,
        );

        cache.store(&RequestContext::new("first"), response("1")).await;
        cache.store(&RequestContext::new("second"), response("2")).await;

        let (first_key, _) = CacheKey::for_context(&RequestContext::new("first"));
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::CacheEviction {
                key: first_key.as_str().to_string(),
                policy: EvictionPolicy::Lru,
            }
        );
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_clear_and_hit_rate() {
        let cache = ResponseCache::default();
        let ctx = RequestContext::new("q");
        assert_eq!(cache.stats().hit_rate(), 0.0);

        cache.lookup(&ctx).await;
        cache.store(&ctx, response("a")).await;
        cache.lookup(&ctx).await;
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);

        assert_eq!(cache.clear(), 1);
        assert!(cache.lookup(&ctx).await.is_none());
    }

    #[test]
    fn test_threshold_out_of_range_is_invalid() {
        let mut config = semantic_config();
        config.semantic.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
