//! Egress response cache
//!
//! Opt-in per domain via the allowlist `cache_ttl` column. Only
//! unauthenticated GETs are cached, keyed by method+host+path+query, with
//! LRU eviction by both item count and total bytes.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A cached upstream response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

struct Slot {
    response: CachedResponse,
    stored_at: Instant,
    ttl: Duration,
}

/// The cache. Shared behind the proxy.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, Slot>>,
    max_bytes: u64,
    total_bytes: Mutex<u64>,
}

impl ResponseCache {
    #[must_use]
    pub fn new(max_items: usize, max_bytes: u64) -> Self {
        let cap = NonZeroUsize::new(max_items.max(1)).expect("nonzero capacity");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            max_bytes,
            total_bytes: Mutex::new(0),
        }
    }

    /// Cache key for a request.
    #[must_use]
    pub fn key(method: &str, host: &str, path: &str, query: Option<&str>) -> String {
        format!("{method} {host}{path}?{}", query.unwrap_or(""))
    }

    /// Look up a fresh entry.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().expect("net cache poisoned");
        let slot = entries.get(key)?;
        if slot.stored_at.elapsed() > slot.ttl {
            let removed = entries.pop(key);
            if let Some(slot) = removed {
                *self.total_bytes.lock().expect("net cache poisoned") -=
                    slot.response.body.len() as u64;
            }
            return None;
        }
        Some(slot.response.clone())
    }

    /// Store a response with a TTL.
    pub fn put(&self, key: String, response: CachedResponse, ttl: Duration) {
        let size = response.body.len() as u64;
        if size > self.max_bytes {
            return;
        }
        let mut entries = self.entries.lock().expect("net cache poisoned");
        let mut total = self.total_bytes.lock().expect("net cache poisoned");

        if let Some(old) = entries.pop(&key) {
            *total -= old.response.body.len() as u64;
        }
        // Item-count eviction happens inside LruCache::push; byte eviction
        // here.
        while *total + size > self.max_bytes {
            match entries.pop_lru() {
                Some((_, slot)) => *total -= slot.response.body.len() as u64,
                None => break,
            }
        }
        if let Some((_, evicted)) = entries.push(key, Slot { response, stored_at: Instant::now(), ttl }) {
            *total -= evicted.response.body.len() as u64;
        }
        *total += size;
    }

    /// Drop everything (admin endpoint).
    pub fn clear(&self) {
        self.entries.lock().expect("net cache poisoned").clear();
        *self.total_bytes.lock().expect("net cache poisoned") = 0;
    }

    /// (items, bytes) for status endpoints.
    pub fn stats(&self) -> (usize, u64) {
        (
            self.entries.lock().expect("net cache poisoned").len(),
            *self.total_bytes.lock().expect("net cache poisoned"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(body: &[u8]) -> CachedResponse {
        CachedResponse { status: 200, headers: vec![], body: body.to_vec() }
    }

    #[test]
    fn test_put_get() {
        let cache = ResponseCache::new(8, 1024);
        let key = ResponseCache::key("GET", "api.x.com", "/v1", None);
        cache.put(key.clone(), resp(b"data"), Duration::from_secs(30));
        assert_eq!(cache.get(&key).unwrap().body, b"data");
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ResponseCache::new(8, 1024);
        let key = ResponseCache::key("GET", "api.x.com", "/v1", None);
        cache.put(key.clone(), resp(b"data"), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().1, 0);
    }

    #[test]
    fn test_byte_eviction() {
        let cache = ResponseCache::new(8, 100);
        cache.put("a".into(), resp(&[0; 60]), Duration::from_secs(60));
        cache.put("b".into(), resp(&[0; 60]), Duration::from_secs(60));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.stats().1 <= 100);
    }

    #[test]
    fn test_query_in_key() {
        let a = ResponseCache::key("GET", "h", "/p", Some("x=1"));
        let b = ResponseCache::key("GET", "h", "/p", Some("x=2"));
        assert_ne!(a, b);
    }
}
