//! Query embeddings for the semantic cache tier.

use async_trait::async_trait;
use lazy_static::lazy_static;
use moka::future::Cache;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

lazy_static! {
    /// Word tokens for feature hashing
    static ref WORD: Regex = Regex::new(r"[\p{L}\p{N}]+").unwrap();
}

/// Errors from computing an embedding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Embedding backend failed: {0}")]
    Backend(String),

    #[error("Embedding backend returned an empty vector")]
    Empty,
}

/// Turns query text into a vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Deterministic bag-of-words embedder.
///
/// Each word is hashed into one of `dimensions` buckets with a hash-derived
/// sign, and the result is L2-normalised. Texts sharing most of their words
/// land close together; it needs no model and no network.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in WORD.find_iter(&text.to_lowercase()) {
            let mut hasher = DefaultHasher::new();
            word.as_str().hash(&mut hasher);
            let hash = hasher.finish();

            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }
}

/// Cosine similarity in [-1, 1]. Zero when either vector is zero or the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Bounded memo of query embeddings in front of an [`Embedder`].
pub struct EmbeddingMemo {
    embedder: Arc<dyn Embedder>,
    cache: Cache<String, Arc<[f32]>>,
}

impl EmbeddingMemo {
    pub fn new(embedder: Arc<dyn Embedder>, capacity: u64) -> Self {
        Self {
            embedder,
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Embedding of already-normalised query text. Concurrent requests for
    /// the same text share one computation; failures are not memoised.
    pub async fn embed(&self, text: &str) -> Result<Arc<[f32]>, EmbeddingError> {
        let embedder = Arc::clone(&self.embedder);
        let owned = text.to_string();

        self.cache
            .try_get_with(text.to_string(), async move {
                let vector = embedder.embed(&owned).await?;
                if vector.is_empty() {
                    return Err(EmbeddingError::Empty);
                }
                Ok(Arc::<[f32]>::from(vector))
            })
            .await
            .map_err(|e| (*e).clone())
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl std::fmt::Debug for EmbeddingMemo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingMemo")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
