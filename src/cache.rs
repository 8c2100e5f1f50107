//! TTL cache for computed reports
//!
//! Entries are immutable once written: `set` swaps in a new `Arc`'d entry, so a
//! reader racing a writer sees either the old entry or the new one, never a mix.
//! Expired entries are dropped lazily by the `get` that finds them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Millisecond clock, injectable for tests
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Monotonic milliseconds since the clock was created
pub fn monotonic_clock() -> Clock {
    let start = Instant::now();
    Arc::new(move || start.elapsed().as_millis() as u64)
}

struct CacheEntry<V> {
    data: Arc<V>,
    written_at_ms: u64,
    ttl_ms: u64,
}

/// A cache hit; `is_stale` once 80% of the TTL has elapsed
#[derive(Debug)]
pub struct CacheHit<V> {
    pub data: Arc<V>,
    pub is_stale: bool,
    pub age: Duration,
}

impl<V> CacheHit<V> {
    pub fn age_seconds(&self) -> u64 {
        self.age.as_secs()
    }
}

pub struct CacheManager<V> {
    entries: RwLock<HashMap<String, Arc<CacheEntry<V>>>>,
    clock: Clock,
}

impl<V> Default for CacheManager<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheManager<V> {
    pub fn new() -> Self {
        Self::new_with_clock(monotonic_clock())
    }

    pub fn new_with_clock(clock: Clock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheHit<V>> {
        let now = (self.clock)();
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;

        let age_ms = now.saturating_sub(entry.written_at_ms);
        if age_ms > entry.ttl_ms {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            // Only drop the entry we judged expired, not a fresh one written since
            if entries.get(key).map(|e| Arc::ptr_eq(e, &entry)).unwrap_or(false) {
                entries.remove(key);
                log::debug!("🗑️  Cache entry {} expired after {} ms", key, age_ms);
            }
            return None;
        }

        Some(CacheHit {
            data: entry.data.clone(),
            // age > 0.8 * ttl, in integers
            is_stale: age_ms.saturating_mul(5) > entry.ttl_ms.saturating_mul(4),
            age: Duration::from_millis(age_ms),
        })
    }

    pub fn set(&self, key: &str, data: V, ttl: Duration) -> Arc<V> {
        let data = Arc::new(data);
        let entry = Arc::new(CacheEntry {
            data: data.clone(),
            written_at_ms: (self.clock)(),
            ttl_ms: ttl.as_millis() as u64,
        });

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);

        data
    }

    /// Number of stored entries, expired ones included until next touched
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lets at most one background refresh run per key
#[derive(Clone, Default)]
pub struct RefreshCoalescer {
    inflight: Arc<Mutex<HashSet<String>>>,
}

/// Held by the running refresh; releases the key on drop
pub struct RefreshGuard {
    key: String,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl RefreshCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a refresh for `key` is already running
    pub fn try_begin(&self, key: &str) -> Option<RefreshGuard> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if !inflight.insert(key.to_string()) {
            return None;
        }

        Some(RefreshGuard {
            key: key.to_string(),
            inflight: self.inflight.clone(),
        })
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn manual_clock() -> (Arc<AtomicU64>, Clock) {
        let now = Arc::new(AtomicU64::new(10_000));
        let handle = now.clone();
        (now, Arc::new(move || handle.load(Ordering::SeqCst)))
    }

    #[test]
    fn test_ttl_boundary() {
        let (now, clock) = manual_clock();
        let cache = CacheManager::new_with_clock(clock);
        cache.set("countries", 42u32, Duration::from_millis(1000));

        now.fetch_add(999, Ordering::SeqCst);
        let hit = cache.get("countries").unwrap();
        assert_eq!(*hit.data, 42);
        // still served, though well past the staleness threshold
        assert!(hit.is_stale);

        now.fetch_add(2, Ordering::SeqCst);
        assert!(cache.get("countries").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fresh_entry_is_not_stale() {
        let (now, clock) = manual_clock();
        let cache = CacheManager::new_with_clock(clock);
        cache.set("k", "v".to_string(), Duration::from_millis(1000));

        now.fetch_add(500, Ordering::SeqCst);
        let hit = cache.get("k").unwrap();
        assert!(!hit.is_stale);
        assert_eq!(hit.age, Duration::from_millis(500));

        now.fetch_add(300, Ordering::SeqCst);
        assert!(!cache.get("k").unwrap().is_stale);
    }

    #[test]
    fn test_stale_past_eighty_percent() {
        let (now, clock) = manual_clock();
        let cache = CacheManager::new_with_clock(clock);
        cache.set("k", 1u8, Duration::from_millis(1000));

        now.fetch_add(850, Ordering::SeqCst);
        let hit = cache.get("k").unwrap();
        assert!(hit.is_stale);
        assert_eq!(*hit.data, 1);
    }

    #[test]
    fn test_set_replaces_entry_and_resets_age() {
        let (now, clock) = manual_clock();
        let cache = CacheManager::new_with_clock(clock);
        cache.set("k", 1u8, Duration::from_millis(1000));

        now.fetch_add(900, Ordering::SeqCst);
        cache.set("k", 2u8, Duration::from_millis(1000));

        now.fetch_add(200, Ordering::SeqCst);
        let hit = cache.get("k").unwrap();
        assert_eq!(*hit.data, 2);
        assert_eq!(hit.age, Duration::from_millis(200));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_coalescer_admits_one_refresh_per_key() {
        let coalescer = RefreshCoalescer::new();

        let guard = coalescer.try_begin("summary").unwrap();
        assert!(coalescer.try_begin("summary").is_none());
        assert!(coalescer.try_begin("countries").is_some());
        assert!(coalescer.is_refreshing("summary"));

        drop(guard);
        assert!(!coalescer.is_refreshing("summary"));
        assert!(coalescer.try_begin("summary").is_some());
    }
}
