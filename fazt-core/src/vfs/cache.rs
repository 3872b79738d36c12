//! Byte-weighted LRU cache over VFS entries
//!
//! Bounded by `limits.storage.max_vfs` in bytes rather than entry count.
//! A cache floor protects each app's recently served `index.html` for 60 s
//! after its last hit, so landing pages survive bursts of large-asset
//! traffic that would otherwise churn them out.

use lru::LruCache;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a hit shields an `index.html` entry from eviction.
const INDEX_FLOOR: Duration = Duration::from_secs(60);

/// How many protected entries an eviction pass will skip over before
/// giving up and letting the cache run over budget temporarily.
const MAX_PROTECTED_SKIPS: usize = 8;

/// Cached file bytes plus content type.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
}

#[derive(Debug)]
struct Slot {
    file: CachedFile,
    last_hit: Instant,
}

/// The cache proper. Callers wrap it in a mutex; all methods take `&mut`.
pub struct ByteCache {
    entries: LruCache<(String, String), Slot>,
    total_bytes: u64,
    budget: u64,
}

impl ByteCache {
    /// Create with a byte budget.
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            budget,
        }
    }

    /// Look up and promote an entry.
    pub fn get(&mut self, app_id: &str, path: &str) -> Option<CachedFile> {
        let key = (app_id.to_string(), path.to_string());
        let slot = self.entries.get_mut(&key)?;
        slot.last_hit = Instant::now();
        Some(slot.file.clone())
    }

    /// Insert an entry, evicting as needed. Entries larger than the whole
    /// budget are not cached at all.
    pub fn insert(&mut self, app_id: &str, path: &str, file: CachedFile) {
        let size = file.bytes.len() as u64;
        if size > self.budget {
            return;
        }
        let key = (app_id.to_string(), path.to_string());
        if let Some(old) = self.entries.pop(&key) {
            self.total_bytes -= old.file.bytes.len() as u64;
        }
        self.total_bytes += size;
        self.entries.push(key, Slot { file, last_hit: Instant::now() });
        self.evict();
    }

    /// Drop every entry belonging to an app (deploy, delete).
    pub fn invalidate_app(&mut self, app_id: &str) {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|((app, _), _)| app == app_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(slot) = self.entries.pop(&key) {
                self.total_bytes -= slot.file.bytes.len() as u64;
            }
        }
    }

    /// Current byte usage.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        let mut skipped = Vec::new();
        while self.total_bytes > self.budget && skipped.len() < MAX_PROTECTED_SKIPS {
            let Some((key, slot)) = self.entries.pop_lru() else {
                break;
            };
            if is_protected(&key.1, &slot) {
                skipped.push((key, slot));
                continue;
            }
            self.total_bytes -= slot.file.bytes.len() as u64;
        }
        // Protected entries return as most-recent, which also shields them
        // from the next pass.
        for (key, slot) in skipped {
            self.entries.push(key, slot);
        }
    }
}

fn is_protected(path: &str, slot: &Slot) -> bool {
    (path == "index.html" || path.ends_with("/index.html"))
        && slot.last_hit.elapsed() < INDEX_FLOOR
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: usize) -> CachedFile {
        CachedFile {
            bytes: Arc::new(vec![0u8; size]),
            mime_type: "application/octet-stream".to_string(),
        }
    }

    #[test]
    fn test_get_after_insert() {
        let mut cache = ByteCache::new(1024);
        cache.insert("app", "a.txt", file(10));
        assert!(cache.get("app", "a.txt").is_some());
        assert!(cache.get("app", "b.txt").is_none());
    }

    #[test]
    fn test_evicts_lru_when_over_budget() {
        let mut cache = ByteCache::new(100);
        cache.insert("app", "a.bin", file(60));
        cache.insert("app", "b.bin", file(60));
        // a.bin was least recent and unprotected.
        assert!(cache.get("app", "a.bin").is_none());
        assert!(cache.get("app", "b.bin").is_some());
        assert!(cache.total_bytes() <= 100);
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let mut cache = ByteCache::new(50);
        cache.insert("app", "big.bin", file(51));
        assert!(cache.get("app", "big.bin").is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_index_floor_survives_pressure() {
        let mut cache = ByteCache::new(100);
        cache.insert("app", "index.html", file(40));
        // A hit arms the floor.
        assert!(cache.get("app", "index.html").is_some());
        cache.insert("app", "big.bin", file(80));
        assert!(cache.get("app", "index.html").is_some());
    }

    #[test]
    fn test_replace_updates_accounting() {
        let mut cache = ByteCache::new(1000);
        cache.insert("app", "a.txt", file(100));
        cache.insert("app", "a.txt", file(20));
        assert_eq!(cache.total_bytes(), 20);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_app() {
        let mut cache = ByteCache::new(1000);
        cache.insert("app1", "a.txt", file(10));
        cache.insert("app2", "b.txt", file(10));
        cache.invalidate_app("app1");
        assert!(cache.get("app1", "a.txt").is_none());
        assert!(cache.get("app2", "b.txt").is_some());
        assert_eq!(cache.total_bytes(), 10);
    }
}
