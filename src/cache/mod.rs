//! In-memory TTL response cache.
//!
//! Used by the request executor to short-circuit network calls when a run
//! enables caching. Entries expire lazily: an expired entry is reported as a
//! miss and removed without the reader waiting on the write lock. An optional
//! capacity bound evicts the least recently used entry on insert.

use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::HttpMethod;

/// Request identity used as the cache key.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: HttpMethod,
    pub url: String,
    /// Lowercased names, sorted
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl CacheKey {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_headers<'a>(mut self, headers: impl IntoIterator<Item = &'a (String, String)>) -> Self {
        self.headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        self.headers.sort();
        self
    }

    pub fn with_body(mut self, body: Option<&[u8]>) -> Self {
        self.body = body.map(<[u8]>::to_vec);
        self
    }
}

/// Snapshot of a previously observed response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub protocol: Option<String>,
}

/// Cache for HTTP responses keyed by request identity.
pub type ResponseCache = TtlCache<CacheKey, CachedResponse>;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    insertions: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Thread-safe key/value store with per-entry TTL.
///
/// The internal lock is only held for the duration of a hash map operation.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    capacity: Option<usize>,
    access_clock: AtomicU64,
    counters: CacheCounters,
    fills: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

/// Outcome of [`TtlCache::fill_slot`].
pub enum FillSlot<'a, K: Hash + Eq, V> {
    /// No fetch for this key is in progress; the holder performs it.
    Leader(FillGuard<'a, K, V>),
    /// Another caller is fetching this key.
    Follower(Arc<AsyncMutex<()>>),
}

impl<'a, K: Hash + Eq, V> FillSlot<'a, K, V> {
    /// Wait until any in-progress fetch for the key has finished. Returns the
    /// guard when this caller is the one fetching.
    pub async fn settle(self) -> Option<FillGuard<'a, K, V>> {
        match self {
            FillSlot::Leader(guard) => Some(guard),
            FillSlot::Follower(slot) => {
                drop(slot.lock().await);
                None
            }
        }
    }
}

/// Marks a fetch in progress for one key; followers are released on drop.
pub struct FillGuard<'a, K: Hash + Eq, V> {
    cache: &'a TtlCache<K, V>,
    key: K,
    slot: Arc<AsyncMutex<()>>,
    _held: OwnedMutexGuard<()>,
}

impl<K: Hash + Eq, V> Drop for FillGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut fills = self.cache.fills.lock().unwrap_or_else(PoisonError::into_inner);
        if fills.get(&self.key).is_some_and(|slot| Arc::ptr_eq(slot, &self.slot)) {
            fills.remove(&self.key);
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Unbounded cache; entries leave only through expiry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: None,
            access_clock: AtomicU64::new(0),
            counters: CacheCounters::default(),
            fills: Mutex::new(HashMap::new()),
        }
    }

    /// Cache holding at most `capacity` entries, evicting the least recently used.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            capacity: Some(capacity.max(1)),
            access_clock: AtomicU64::new(0),
            counters: CacheCounters::default(),
            fills: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a live entry. Expired entries count as misses and are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_access.store(self.tick(), Ordering::Relaxed);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.remove_expired_nonblocking(key);
        None
    }

    /// Claim the right to fetch `key` on a miss. Concurrent callers for the
    /// same key become followers and wait for the leader to finish, so only
    /// one of them goes to the network. Only the per-key slot stays locked
    /// while the leader fetches; the cache's own locks are not.
    pub fn fill_slot(&self, key: &K) -> FillSlot<'_, K, V> {
        let mut fills = self.fills.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = fills.get(key) {
            return FillSlot::Follower(slot.clone());
        }

        let slot = Arc::new(AsyncMutex::new(()));
        match slot.clone().try_lock_owned() {
            Ok(held) => {
                fills.insert(key.clone(), slot.clone());
                FillSlot::Leader(FillGuard {
                    cache: self,
                    key: key.clone(),
                    slot,
                    _held: held,
                })
            }
            Err(_) => FillSlot::Follower(slot),
        }
    }

    /// Store or overwrite an entry.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            inserted_at: now,
            ttl,
            last_access: AtomicU64::new(self.tick()),
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(capacity) = self.capacity {
            if !entries.contains_key(&key) && entries.len() >= capacity {
                self.make_room(&mut entries, now);
            }
        }
        entries.insert(key, entry);
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).map(|entry| entry.value)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        self.counters.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of stored entries, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_expired_nonblocking(&self, key: &K) {
        // Contended lock: leave the entry for the next reader or the purge task.
        if let Ok(mut entries) = self.entries.try_write() {
            let now = Instant::now();
            if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
                entries.remove(key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn make_room(&self, entries: &mut HashMap<K, CacheEntry<V>>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let expired = before - entries.len();
        if expired > 0 {
            self.counters.expirations.fetch_add(expired as u64, Ordering::Relaxed);
            return;
        }

        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            entries.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Periodically purge expired entries until `cancel` fires.
    pub fn spawn_purge_task(
        cache: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            info!("🧹 Cache purge task started (interval: {:?})", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!("🗑️ Purged {} expired cache entries", removed);
                        }
                    }
                }
            }

            debug!("Cache purge task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_put_then_get_round_trip() {
        let cache: TtlCache<String, u32> = TtlCache::new();
        cache.put("a".to_string(), 7, TTL);
        assert_eq!(cache.get(&"a".to_string()), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new();
        cache.put("a".to_string(), 7, TTL);

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"a".to_string()), Some(7));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty(), "expired entry should be removed on read");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_overwrites_and_resets_age() {
        let cache: TtlCache<&'static str, &'static str> = TtlCache::new();
        cache.put("k", "old", TTL);
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.put("k", "new", TTL);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(cache.get(&"k"), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let cache: TtlCache<u32, u32> = TtlCache::with_capacity(2);
        cache.put(1, 10, TTL);
        cache.put(2, 20, TTL);
        assert_eq!(cache.get(&1), Some(10));

        cache.put(3, 30, TTL);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_dropping_expired_entries() {
        let cache: TtlCache<u32, u32> = TtlCache::with_capacity(2);
        cache.put(1, 10, Duration::from_secs(1));
        cache.put(2, 20, TTL);
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.put(3, 30, TTL);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache: TtlCache<u32, u32> = TtlCache::new();
        cache.put(1, 1, Duration::from_secs(1));
        cache.put(2, 2, Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_stops_on_cancel() {
        let cache: Arc<TtlCache<u32, u32>> = Arc::new(TtlCache::new());
        cache.put(1, 1, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = TtlCache::spawn_purge_task(cache.clone(), Duration::from_millis(50), cancel.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let cache: Arc<TtlCache<u32, (u64, u64)>> = Arc::new(TtlCache::new());
        let mut handles = Vec::new();

        for writer in 0..4u64 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u64 {
                    let v = writer * 1000 + i;
                    cache.put((i % 8) as u32, (v, v * 2), TTL);
                }
            }));
        }
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    if let Some((a, b)) = cache.get(&(i % 8)) {
                        assert_eq!(b, a * 2);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.stats().insertions, 2000);
    }

    #[tokio::test]
    async fn test_fill_slot_has_single_leader_per_key() {
        let cache: TtlCache<u32, u32> = TtlCache::new();

        let leader = match cache.fill_slot(&1) {
            FillSlot::Leader(guard) => guard,
            FillSlot::Follower(_) => panic!("first caller must lead"),
        };
        assert!(matches!(cache.fill_slot(&1), FillSlot::Follower(_)));
        assert!(matches!(cache.fill_slot(&2), FillSlot::Leader(_)));

        drop(leader);
        assert!(matches!(cache.fill_slot(&1), FillSlot::Leader(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_followers_wait_for_leader_fill() {
        let cache: Arc<TtlCache<u32, u32>> = Arc::new(TtlCache::new());
        let guard = cache.fill_slot(&1).settle().await;
        assert!(guard.is_some());

        let follower = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let slot = cache.fill_slot(&1);
                assert!(matches!(slot, FillSlot::Follower(_)));
                assert!(slot.settle().await.is_none());
                cache.get(&1)
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.put(1, 42, TTL);
        drop(guard);

        assert_eq!(follower.await.unwrap(), Some(42));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats { hits: 3, misses: 1, ..Default::default() };
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
