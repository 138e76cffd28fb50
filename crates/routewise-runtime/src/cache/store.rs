//! Bounded entry store behind the response cache.
//!
//! Entries are shared as `Arc<CacheEntry>`: a reader keeps its entry alive
//! even if it is evicted in the meantime. Access metadata is atomic, so a
//! hit only needs the read lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::key::{CacheKey, CacheScope};
use super::semantic::cosine_similarity;
use crate::providers::CompletionResponse;

/// Which entry to drop when the store is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed
    #[default]
    Lru,
    /// Fewest accesses, oldest insert first among equals
    Lfu,
    /// Oldest insert
    Fifo,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Fifo => "fifo",
        })
    }
}

/// A stored response and its access metadata.
#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    scope: CacheScope,
    response: Arc<CompletionResponse>,
    embedding: Option<Arc<[f32]>>,
    created_at: Instant,
    ttl: Duration,
    seq: u64,
    last_access: AtomicU64,
    access_count: AtomicU64,
    size_bytes: usize,
}

impl CacheEntry {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn scope(&self) -> &CacheScope {
        &self.scope
    }

    pub fn response(&self) -> Arc<CompletionResponse> {
        Arc::clone(&self.response)
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Logical time of the last access; larger is more recent.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    fn rank(&self, policy: EvictionPolicy) -> (u64, u64) {
        match policy {
            EvictionPolicy::Lru => (self.last_access(), self.seq),
            EvictionPolicy::Lfu => (self.access_count(), self.seq),
            EvictionPolicy::Fifo => (self.seq, self.seq),
        }
    }
}

/// A response to be stored.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub key: CacheKey,
    pub scope: CacheScope,
    pub response: Arc<CompletionResponse>,
    pub embedding: Option<Arc<[f32]>>,
    pub ttl: Duration,
}

impl NewEntry {
    fn size_bytes(&self) -> usize {
        self.response.estimated_size()
            + self.key.as_str().len()
            + self.scope.as_str().len()
            + self.embedding.as_ref().map_or(0, |e| e.len() * std::mem::size_of::<f32>())
    }
}

/// Result of an exact lookup.
#[derive(Debug)]
pub enum Lookup {
    Hit(Arc<CacheEntry>),
    /// Present but past its TTL; it has been removed
    Expired,
    Miss,
}

/// Result of an insert.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    pub stored: bool,
    pub evicted: Vec<CacheKey>,
    pub expired: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Arc<CacheEntry>>,
    bytes: usize,
}

impl Inner {
    fn remove(&mut self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<CacheKey> {
        self.entries
            .values()
            .min_by_key(|e| e.rank(policy))
            .map(|e| e.key.clone())
    }
}

/// Bounded map of cache entries.
pub struct EntryStore {
    inner: RwLock<Inner>,
    policy: EvictionPolicy,
    max_entries: usize,
    max_bytes: usize,
    clock: AtomicU64,
    seq: AtomicU64,
}

impl EntryStore {
    pub fn new(policy: EvictionPolicy, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            policy,
            max_entries: max_entries.max(1),
            max_bytes,
            clock: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn touch(&self, entry: &CacheEntry) {
        entry.last_access.store(self.tick(), Ordering::Relaxed);
        entry.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Exact lookup. Expired entries are removed and reported as such.
    pub fn get(&self, key: &CacheKey) -> Lookup {
        let now = Instant::now();
        {
            let inner = self.inner.read();
            match inner.entries.get(key) {
                None => return Lookup::Miss,
                Some(entry) if !entry.is_expired(now) => {
                    self.touch(entry);
                    return Lookup::Hit(Arc::clone(entry));
                }
                Some(_) => {}
            }
        }

        let mut inner = self.inner.write();
        // Re-check: a fresh entry may have replaced it meanwhile
        match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.remove(key);
                Lookup::Expired
            }
            Some(entry) => {
                self.touch(entry);
                Lookup::Hit(Arc::clone(entry))
            }
            None => Lookup::Miss,
        }
    }

    /// Store an entry, evicting first if it would not fit.
    ///
    /// An entry larger than the byte limit on its own is not stored.
    pub fn insert(&self, new: NewEntry) -> InsertOutcome {
        let size = new.size_bytes();
        if size > self.max_bytes {
            tracing::debug!(key = %new.key, size, "Entry exceeds cache byte limit, not stored");
            return InsertOutcome::default();
        }

        let mut inner = self.inner.write();
        inner.remove(&new.key);

        let mut outcome = self.make_room(&mut inner, 1, size);

        let entry = CacheEntry {
            key: new.key.clone(),
            scope: new.scope,
            response: new.response,
            embedding: new.embedding,
            created_at: Instant::now(),
            ttl: new.ttl,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            last_access: AtomicU64::new(self.tick()),
            access_count: AtomicU64::new(0),
            size_bytes: size,
        };
        inner.bytes += size;
        inner.entries.insert(new.key, Arc::new(entry));

        outcome.stored = true;
        outcome
    }

    /// Evict until `incoming` more entries of `incoming_bytes` would fit.
    /// Expired entries go first, then victims chosen by policy.
    fn make_room(&self, inner: &mut Inner, incoming: usize, incoming_bytes: usize) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let over = |inner: &Inner| {
            inner.entries.len() + incoming > self.max_entries
                || inner.bytes + incoming_bytes > self.max_bytes
        };

        if !over(&*inner) {
            return outcome;
        }
        outcome.expired = inner.purge_expired(Instant::now());

        while over(&*inner) {
            let Some(victim) = inner.victim(self.policy) else {
                break;
            };
            inner.remove(&victim);
            tracing::debug!(key = %victim, policy = %self.policy, "Evicted cache entry");
            outcome.evicted.push(victim);
        }
        outcome
    }

    /// Enforce the entry and byte limits on the current contents.
    pub fn evict_if_needed(&self) -> InsertOutcome {
        let mut inner = self.inner.write();
        self.make_room(&mut inner, 0, 0)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.write().purge_expired(Instant::now())
    }

    /// Best unexpired entry in `scope` whose embedding is at least
    /// `threshold` similar to `embedding`. Equal similarities go to the most
    /// recently accessed entry. The winner counts as accessed.
    pub fn semantic_best(
        &self,
        scope: &CacheScope,
        embedding: &[f32],
        threshold: f32,
    ) -> Option<(Arc<CacheEntry>, f32)> {
        let now = Instant::now();
        let inner = self.inner.read();

        let mut best: Option<(&Arc<CacheEntry>, f32)> = None;
        for entry in inner.entries.values() {
            if &entry.scope != scope || entry.is_expired(now) {
                continue;
            }
            let Some(stored) = entry.embedding() else {
                continue;
            };
            let similarity = cosine_similarity(embedding, stored);
            if similarity < threshold {
                continue;
            }

            let better = match best {
                None => true,
                Some((current, score)) => {
                    similarity > score
                        || (similarity == score && entry.last_access() > current.last_access())
                }
            };
            if better {
                best = Some((entry, similarity));
            }
        }

        best.map(|(entry, similarity)| {
            self.touch(entry);
            (Arc::clone(entry), similarity)
        })
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.write().remove(key).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.bytes = 0;
        count
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated bytes held.
    pub fn size_bytes(&self) -> usize {
        self.inner.read().bytes
    }
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("policy", &self.policy)
            .field("max_entries", &self.max_entries)
            .field("max_bytes", &self.max_bytes)
            .field("len", &self.len())
            .finish()
    }
}
