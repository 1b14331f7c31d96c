use lru::LruCache;
use std::sync::Mutex;

/// Byte-bounded LRU cache for chunk bodies, keyed by chunk id. Holds exactly
/// what a chunk server would return (post-encryption bytes), so hits skip the
/// network entirely.
pub struct ChunkCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    lru: LruCache<String, Vec<u8>>,
    total_bytes: usize,
    capacity_bytes: usize,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub capacity_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl ChunkCache {
    pub fn new(capacity_mb: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                total_bytes: 0,
                capacity_bytes: capacity_mb * 1024 * 1024,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Insert a chunk, evicting strictly least-recently-used entries until it
    /// fits. Oversized payloads are not cached at all.
    pub fn put(&self, chunk_id: &str, data: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if data.len() > inner.capacity_bytes {
            return false;
        }
        if let Some(old) = inner.lru.pop(chunk_id) {
            inner.total_bytes -= old.len();
        }
        while inner.total_bytes + data.len() > inner.capacity_bytes {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.total_bytes -= evicted.len(),
                None => break,
            }
        }
        inner.total_bytes += data.len();
        inner.lru.push(chunk_id.to_string(), data);
        true
    }

    /// Fetch and promote. Counts a hit or a miss.
    pub fn get(&self, chunk_id: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.lru.get(chunk_id).cloned() {
            Some(data) => {
                inner.hits += 1;
                Some(data)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Membership test without promoting or counting.
    pub fn contains(&self, chunk_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.lru.contains(chunk_id)
    }

    pub fn remove(&self, chunk_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.lru.pop(chunk_id) {
            inner.total_bytes -= old.len();
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.clear();
        inner.total_bytes = 0;
    }

    /// Resize the byte budget, evicting LRU entries down to the new cap.
    pub fn set_capacity_mb(&self, capacity_mb: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity_bytes = capacity_mb * 1024 * 1024;
        while inner.total_bytes > inner.capacity_bytes {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.total_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entries: inner.lru.len(),
            total_bytes: inner.total_bytes,
            capacity_bytes: inner.capacity_bytes,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_bytes(capacity_bytes: usize) -> ChunkCache {
        let cache = ChunkCache::new(0);
        cache.inner.lock().unwrap().capacity_bytes = capacity_bytes;
        cache
    }

    #[test]
    fn hit_and_miss_counters() {
        let cache = ChunkCache::new(1);
        cache.put("a", vec![1, 2, 3]);

        assert_eq!(cache.get("a"), Some(vec![1, 2, 3]));
        assert!(cache.get("b").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = cache_with_bytes(30);
        cache.put("a", vec![0; 10]);
        cache.put("b", vec![0; 10]);
        cache.put("c", vec![0; 10]);

        // Touch `a`; `b` becomes the LRU entry.
        assert!(cache.get("a").is_some());

        cache.put("d", vec![0; 10]);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn reinsert_replaces_and_adjusts_size() {
        let cache = cache_with_bytes(30);
        cache.put("a", vec![0; 20]);
        cache.put("a", vec![0; 5]);

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 5);
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let cache = cache_with_bytes(10);
        assert!(!cache.put("big", vec![0; 11]));
        assert!(!cache.contains("big"));
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[test]
    fn shrink_evicts_down_to_new_capacity() {
        let cache = cache_with_bytes(2 * 1024 * 1024);
        cache.put("a", vec![0; 1024 * 1024]);
        cache.put("b", vec![0; 1024 * 1024]);

        cache.set_capacity_mb(1);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn remove_and_clear() {
        let cache = cache_with_bytes(100);
        cache.put("a", vec![0; 10]);
        cache.remove("a");
        assert_eq!(cache.stats().total_bytes, 0);

        cache.put("b", vec![0; 10]);
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }
}
