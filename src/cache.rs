//! Time-to-live cache keyed by query text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL_SECONDS: u64 = 300;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|p| p.into_inner());
        *elapsed += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = *self.elapsed.lock().unwrap_or_else(|p| p.into_inner());
        self.origin + elapsed
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Entries are valid strictly before `inserted_at + ttl`.
///
/// Readers share the lock; two callers missing the same key at once may both
/// recompute it, and the later insert wins.
pub struct TtlCache<V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.into(), CacheEntry { value, expires_at });
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.remove(key).is_some()
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(clock: &Arc<ManualClock>) -> TtlCache<u32> {
        TtlCache::with_clock(Duration::from_secs(DEFAULT_TTL_SECONDS), clock.clone())
    }

    #[test]
    fn entry_is_served_until_ttl_elapses() {
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&clock);
        cache.insert("SELECT 1", 7);

        clock.advance(Duration::from_secs(299));
        assert_eq!(cache.get("SELECT 1"), Some(7));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("SELECT 1"), None);
    }

    #[test]
    fn reinsert_after_expiry_replaces_entry() {
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&clock);
        cache.insert("q", 1);
        clock.advance(Duration::from_secs(301));
        cache.insert("q", 2);

        assert_eq!(cache.get("q"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_are_exact_text() {
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&clock);
        cache.insert("SELECT 1", 1);
        assert_eq!(cache.get("SELECT  1"), None);
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let clock = Arc::new(ManualClock::new());
        let cache = cache(&clock);
        cache.insert("old", 1);
        clock.advance(Duration::from_secs(200));
        cache.insert("new", 2);
        clock.advance(Duration::from_secs(150));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get("new"), Some(2));
        assert!(cache.invalidate("new"));
        assert!(cache.is_empty());
    }
}
