//! Time-bounded response cache keyed by normalized request signature.
//!
//! Entries are never evicted before their TTL and never served after it.
//! There is no size bound: growth is limited by which requests callers choose
//! to cache. Expired entries are dropped lazily on lookup, by
//! [`ResponseCache::purge_expired`], or by [`ResponseCache::clear`].

use crate::types::{HttpResponse, RequestDescriptor};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Default time-to-live for cached responses.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// A cached value with its storage time.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Cache key.
    pub key: String,
    /// Cached value.
    pub value: V,
    /// When the value was stored.
    pub stored_at: Instant,
    /// How long the value stays fresh.
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// Thread-safe TTL cache.
///
/// All operations serialize on one mutex, so readers never observe a
/// partially written entry.
#[derive(Debug)]
pub struct ResponseCache<V = HttpResponse> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone> ResponseCache<V> {
    /// Creates an empty cache with the given default TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Gets the default TTL.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the value for `key` if present and fresh.
    ///
    /// An expired entry is removed as a side effect.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                tracing::debug!(key = %key, "Cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Stores `value` under `key`, replacing any existing entry.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            stored_at: Instant::now(),
            ttl,
        };
        self.entries.lock().insert(key, entry);
    }

    /// Stores `value` under `key` with the default TTL.
    pub fn put_default(&self, key: impl Into<String>, value: V) {
        self.put(key, value, self.default_ttl);
    }

    /// Returns true if a fresh entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.is_fresh(now))
            .unwrap_or(false)
    }

    /// Removes the entry for `key`, returning its value if it was fresh.
    pub fn remove(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.entries
            .lock()
            .remove(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value)
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V: Clone> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

/// Computes the stable cache key of a request.
///
/// The key is the hex SHA-256 of the method, the normalized URL (lower-case
/// scheme and host, default port, fragment and query removed) and the sorted
/// union of URL query pairs and descriptor params. Requests that differ only
/// in parameter order or host case share a key.
pub fn cache_key(request: &RequestDescriptor) -> String {
    let (base, mut pairs) = normalize_url(&request.url);
    pairs.extend(request.params.iter().cloned());
    pairs.sort();

    let query = serde_urlencoded::to_string(&pairs).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(base.as_bytes());
    hasher.update(b"\n");
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_url(raw: &str) -> (String, Vec<(String, String)>) {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            let pairs = url.query_pairs().into_owned().collect();
            url.set_query(None);
            url.set_fragment(None);
            let base = url.as_str().trim_end_matches('/').to_string();
            (base, pairs)
        }
        Err(_) => (raw.trim().trim_end_matches('/').to_string(), Vec::new()),
    }
}
