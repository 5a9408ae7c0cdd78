//! Leaf certificate caching
//!
//! Entries are keyed by the signing root's fingerprint plus the sorted host
//! set, so a regenerated root never sees leaves issued by its predecessor.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::ca::LeafCertificate;

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

struct CacheEntry {
    leaf: Arc<LeafCertificate>,
    created_at: Instant,
}

/// LRU cache of issued leaves
pub struct LeafCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl LeafCache {
    /// Create a new leaf cache
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of leaves to keep
    /// * `ttl` - How long a cached leaf may be reused
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(DEFAULT_CAPACITY);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Cache key for a host set under a given root.
    pub fn key(root_fingerprint: &str, hosts: &[String]) -> String {
        let mut sorted: Vec<&str> = hosts.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        format!("{}|{}", root_fingerprint, sorted.join(","))
    }

    /// Get a leaf if present and not expired
    pub fn get(&self, key: &str) -> Option<Arc<LeafCertificate>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = cache.get(key) {
            if entry.created_at.elapsed() < self.ttl {
                return Some(entry.leaf.clone());
            }
            cache.pop(key);
        }

        None
    }

    pub fn put(&self, key: String, leaf: Arc<LeafCertificate>) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.put(
            key,
            CacheEntry {
                leaf,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for LeafCache {
    fn default() -> Self {
        // 1000 host sets, 12 hour TTL
        Self::new(DEFAULT_CAPACITY.get(), Duration::from_secs(12 * 60 * 60))
    }
}
