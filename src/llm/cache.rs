use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub const DEFAULT_CACHE_CAPACITY: usize = 4096;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounded fingerprint cache with a TTL. Entries evict oldest-first once the
/// capacity is reached; losing an entry only costs a repeated provider call.
pub struct FingerprintCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl FingerprintCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache poisoned");
        match inner.entries.get(fingerprint) {
            Some(inserted) if inserted.elapsed() < self.ttl => true,
            Some(_) => {
                inner.entries.remove(fingerprint);
                false
            }
            None => false,
        }
    }

    pub fn insert(&self, fingerprint: String) {
        let mut inner = self.inner.lock().expect("cache poisoned");
        if inner.entries.insert(fingerprint.clone(), Instant::now()).is_none() {
            inner.order.push_back(fingerprint);
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

/// Stable content fingerprint over the fields the model would see.
pub fn content_fingerprint(bucket_id: &str, event_id: i64, text: &str, image: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bucket_id.as_bytes());
    hasher.update(event_id.to_le_bytes());
    hasher.update(text.as_bytes());
    if let Some(image) = image {
        hasher.update(image.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_eviction_drops_oldest() {
        let cache = FingerprintCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_string());
        cache.insert("b".to_string());
        cache.insert("c".to_string());
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = FingerprintCache::new(8, Duration::from_millis(0));
        cache.insert("a".to_string());
        assert!(!cache.contains("a"));
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let a = content_fingerprint("win", 1, "text", None);
        let b = content_fingerprint("win", 1, "text", None);
        let c = content_fingerprint("win", 2, "text", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
