//! TTL-keyed store of successful idempotent responses.
//!
//! Expiry is checked on every read, so an expired entry is invisible even
//! before the periodic [`sweep`](ResponseCache::sweep) removes it.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use rallypoint_transport::Method;
use tokio::time::Instant;

/// Identifies a request for caching: method, target and payload hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub target: String,
    pub payload_hash: u64,
}

impl CacheKey {
    pub fn new(method: Method, target: &str, payload: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        Self {
            method,
            target: target.to_string(),
            payload_hash: hasher.finish(),
        }
    }
}

/// One cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub key: CacheKey,
    /// The request payload the entry was stored for. Compared on lookup so
    /// two payloads with colliding hashes never share an entry.
    pub request_payload: Vec<u8>,
    pub payload: Vec<u8>,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Expired once strictly more than `ttl` has passed since storing.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

/// Concurrent response cache.
#[derive(Debug)]
pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, CachedEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached payload for `key` if present and unexpired.
    pub fn get(&self, key: &CacheKey, request_payload: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        let found = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|entry| !entry.is_expired(now) && entry.request_payload == request_payload)
            .map(|entry| entry.payload.clone());

        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Stores a response under the default TTL.
    pub fn insert(&self, key: CacheKey, request_payload: Vec<u8>, payload: Vec<u8>) {
        self.insert_with_ttl(key, request_payload, payload, self.default_ttl);
    }

    pub fn insert_with_ttl(
        &self,
        key: CacheKey,
        request_payload: Vec<u8>,
        payload: Vec<u8>,
        ttl: Duration,
    ) {
        let entry = CachedEntry {
            key: key.clone(),
            request_payload,
            payload,
            stored_at: Instant::now(),
            ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    /// Drops one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(target: &str, payload: &[u8]) -> CacheKey {
        CacheKey::new(Method::Get, target, payload)
    }

    #[test]
    fn test_cache_key_distinguishes_method_target_and_payload() {
        let base = key("profile", b"a");
        assert_eq!(base, key("profile", b"a"));
        assert_ne!(base, key("profile", b"b"));
        assert_ne!(base, key("inventory", b"a"));
        assert_ne!(base, CacheKey::new(Method::Head, "profile", b"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_entry_within_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.insert(key("profile", b"q"), b"q".to_vec(), b"answer".to_vec());

        tokio::time::advance(Duration::from_secs(250)).await;
        assert_eq!(cache.get(&key("profile", b"q"), b"q"), Some(b"answer".to_vec()));
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_invisible_before_sweep() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.insert(key("profile", b"q"), b"q".to_vec(), b"answer".to_vec());

        tokio::time::advance(Duration::from_secs(400)).await;
        assert_eq!(cache.get(&key("profile", b"q"), b"q"), None);
        assert_eq!(cache.len(), 1, "still stored until swept");
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.insert_with_ttl(key("short", b""), Vec::new(), b"1".to_vec(), Duration::from_secs(10));
        cache.insert(key("long", b""), Vec::new(), b"2".to_vec());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("long", b""), b"").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_rejects_payload_mismatch_under_same_key() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let k = key("profile", b"original");
        cache.insert(k.clone(), b"original".to_vec(), b"answer".to_vec());
        assert_eq!(cache.get(&k, b"different"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.insert(key("a", b""), Vec::new(), b"1".to_vec());
        cache.insert(key("b", b""), Vec::new(), b"2".to_vec());

        assert!(cache.invalidate(&key("a", b"")));
        assert!(!cache.invalidate(&key("a", b"")));
        cache.clear();
        assert!(cache.is_empty());
    }
}
