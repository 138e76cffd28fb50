//! Response caching for routewise-runtime.
//!
//! - `key`: request-derived cache keys and semantic scopes
//! - `store`: bounded entry map with LRU/LFU/FIFO eviction and TTLs
//! - `semantic`: embeddings and similarity for the semantic tier
//! - `layer`: the two-tier [`ResponseCache`] the orchestrator uses

mod key;
mod layer;
mod semantic;
mod store;

pub use key::{CacheKey, CacheScope, AUTO};
pub use layer::{CacheConfig, CacheHit, CacheStatsSnapshot, CacheTier, ResponseCache, SemanticConfig};
pub use semantic::{cosine_similarity, Embedder, EmbeddingError, EmbeddingMemo, HashingEmbedder};
pub use store::{CacheEntry, EntryStore, EvictionPolicy, InsertOutcome, Lookup, NewEntry};
