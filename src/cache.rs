//! Peer Cache
//!
//! Concurrent address -> connection map with a sliding TTL. Reads treat a
//! lapsed entry as absent right away; a janitor task removes lapsed entries
//! from memory on a much slower cadence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Default sliding TTL (15 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Default janitor sweep interval (24 hours)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

struct CacheEntry<V> {
    value: V,
    last_touch: Instant,
}

/// Result of a lookup that does not refresh the TTL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Entry is present and within its TTL
    Live(V),
    /// Entry is still in memory but its TTL has lapsed
    Expired(V),
    /// No entry
    Absent,
}

/// Address-keyed cache with sliding expiration
pub struct PeerCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl<V: Clone> PeerCache<V> {
    /// Create a cache with the default TTL and sweep interval
    pub fn new() -> Self {
        Self::with_config(DEFAULT_TTL, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a cache with custom TTL and sweep interval
    pub fn with_config(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweep_interval,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `key` to `value`, replacing any previous binding
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.entries().insert(
            key.into(),
            CacheEntry {
                value,
                last_touch: Instant::now(),
            },
        );
    }

    /// Live value for `key`; refreshes its TTL
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        let now = Instant::now();
        if now.duration_since(entry.last_touch) >= self.ttl {
            return None;
        }
        entry.last_touch = now;
        Some(entry.value.clone())
    }

    /// Look up `key` without touching its TTL
    pub fn get_without_refresh(&self, key: &str) -> Lookup<V> {
        let entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.last_touch.elapsed() < self.ttl => {
                Lookup::Live(entry.value.clone())
            }
            Some(entry) => Lookup::Expired(entry.value.clone()),
            None => Lookup::Absent,
        }
    }

    /// Remove `key` unconditionally
    pub fn delete(&self, key: &str) -> Option<V> {
        self.entries().remove(key).map(|e| e.value)
    }

    /// Remove `key` only while it is still bound to a value matching `pred`.
    ///
    /// Keeps a binding that a newer session re-registered in the meantime.
    pub fn delete_if<F>(&self, key: &str, pred: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if pred(&entry.value) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Physically remove every lapsed entry, returns how many went
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.last_touch) < self.ttl);
        before - entries.len()
    }

    /// Number of entries in memory, lapsed ones included
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Keys currently held, lapsed ones included
    pub fn keys(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }
}

impl<V: Clone + Send + 'static> PeerCache<V> {
    /// Run the janitor until `cancel` fires
    pub async fn run_janitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        tracing::debug!("Peer cache janitor removed {} expired entries", removed);
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

impl<V: Clone> Default for PeerCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let cache = PeerCache::new();
        cache.put("10.0.0.2", 7u32);
        assert_eq!(cache.get("10.0.0.2"), Some(7));
        assert_eq!(cache.get("10.0.0.3"), None);
        assert_eq!(cache.get_without_refresh("10.0.0.3"), Lookup::Absent);
    }

    #[test]
    fn test_get_refreshes_ttl() {
        let cache = PeerCache::with_config(Duration::from_millis(120), DEFAULT_SWEEP_INTERVAL);
        cache.put("A", 1u32);

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(cache.get("A"), Some(1));
        }
        assert!(matches!(cache.get_without_refresh("A"), Lookup::Live(1)));
    }

    #[test]
    fn test_entry_expires_without_use() {
        let cache = PeerCache::with_config(Duration::from_millis(40), DEFAULT_SWEEP_INTERVAL);
        cache.put("A", 1u32);
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.get_without_refresh("A"), Lookup::Expired(1));
        assert_eq!(cache.get("A"), None);
        // Lapsed but not yet swept
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get_without_refresh("A"), Lookup::Absent);
    }

    #[test]
    fn test_put_overwrites_and_delete_if() {
        let cache = PeerCache::new();
        cache.put("fd00::2", 1u32);
        cache.put("fd00::2", 2u32);
        assert_eq!(cache.get("fd00::2"), Some(2));

        assert!(!cache.delete_if("fd00::2", |v| *v == 1));
        assert_eq!(cache.get("fd00::2"), Some(2));
        assert!(cache.delete_if("fd00::2", |v| *v == 2));
        assert!(cache.is_empty());
        assert_eq!(cache.delete("fd00::2"), None);
    }

    #[test]
    fn test_concurrent_churn() {
        let cache = Arc::new(PeerCache::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = format!("10.{}.{}.1", t, i % 50);
                        cache.put(key.clone(), t);
                        assert_eq!(cache.get(&key), Some(t));
                        if i % 3 == 0 {
                            cache.delete(&key);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 8 * 50);
    }

    #[tokio::test]
    async fn test_janitor_sweeps_and_stops() {
        let cache = Arc::new(PeerCache::with_config(
            Duration::from_millis(10),
            Duration::from_millis(30),
        ));
        cache.put("A", 1u32);

        let cancel = CancellationToken::new();
        let janitor = tokio::spawn(Arc::clone(&cache).run_janitor(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        janitor.await.unwrap();
    }
}
