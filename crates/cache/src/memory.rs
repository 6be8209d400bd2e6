//! In-process shared cache backed by DashMap.

use crate::{CacheError, CacheResult, SharedCache};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry as MapEntry};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Counter(i64),
    Set(BTreeSet<u32>),
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn counter(n: i64, ttl: Duration, now: Instant) -> Self {
        Self {
            value: Value::Counter(n),
            expires_at: Some(now + ttl),
        }
    }

    fn set(members: BTreeSet<u32>, ttl: Duration, now: Instant) -> Self {
        Self {
            value: Value::Set(members),
            expires_at: Some(now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A [`SharedCache`] held in process memory.
///
/// Every mutation goes through DashMap's entry API, so read-modify-write on a
/// single key is atomic with respect to other callers. Expiry is lazy: an
/// expired entry is treated as absent on access and physically removed by
/// [`MemoryCache::purge_expired`].
///
/// Time is measured with `tokio::time::Instant`, so TTLs follow a paused
/// test clock.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired entries. Returns the number evicted.
    ///
    /// Keys are collected first and then removed with `remove_if`, so an
    /// entry refreshed in between is kept.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, entry| entry.is_expired(now))
                    .is_some()
            })
            .count()
    }

    fn live<T>(&self, key: &str, f: impl FnOnce(&Value) -> CacheResult<T>) -> CacheResult<Option<T>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => f(&entry.value).map(Some),
            _ => Ok(None),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str) -> CacheError {
    CacheError::WrongType {
        key: key.to_string(),
        expected,
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(CacheEntry::counter(1, ttl, now));
                Ok(1)
            }
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CacheEntry::counter(1, ttl, now);
                    return Ok(1);
                }
                match &mut entry.value {
                    Value::Counter(n) => {
                        *n += 1;
                        let value = *n;
                        entry.expires_at = Some(now + ttl);
                        Ok(value)
                    }
                    Value::Set(_) => Err(wrong_type(key, "counter")),
                }
            }
        }
    }

    async fn incr_below(&self, key: &str, limit: i64, ttl: Duration) -> CacheResult<Option<i64>> {
        if limit <= 0 {
            return Ok(None);
        }
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(CacheEntry::counter(1, ttl, now));
                Ok(Some(1))
            }
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CacheEntry::counter(1, ttl, now);
                    return Ok(Some(1));
                }
                match &mut entry.value {
                    Value::Counter(n) if *n >= limit => Ok(None),
                    Value::Counter(n) => {
                        *n += 1;
                        let value = *n;
                        entry.expires_at = Some(now + ttl);
                        Ok(Some(value))
                    }
                    Value::Set(_) => Err(wrong_type(key, "counter")),
                }
            }
        }
    }

    async fn decr(&self, key: &str) -> CacheResult<i64> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(_) => Ok(0),
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return Ok(0);
                }
                let value = match &mut occupied.get_mut().value {
                    Value::Counter(n) => {
                        *n = (*n - 1).max(0);
                        *n
                    }
                    Value::Set(_) => return Err(wrong_type(key, "counter")),
                };
                if value == 0 {
                    occupied.remove();
                }
                Ok(value)
            }
        }
    }

    async fn counter(&self, key: &str) -> CacheResult<i64> {
        self.live(key, |value| match value {
            Value::Counter(n) => Ok(*n),
            Value::Set(_) => Err(wrong_type(key, "counter")),
        })
        .map(|n| n.unwrap_or(0))
    }

    async fn set_init(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry::set(BTreeSet::new(), ttl, Instant::now()),
        );
        Ok(())
    }

    async fn set_add(&self, key: &str, member: u32, ttl: Duration) -> CacheResult<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(CacheEntry::set(BTreeSet::from([member]), ttl, now));
                Ok(true)
            }
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = CacheEntry::set(BTreeSet::from([member]), ttl, now);
                    return Ok(true);
                }
                match &mut entry.value {
                    Value::Set(members) => {
                        let added = members.insert(member);
                        entry.expires_at = Some(now + ttl);
                        Ok(added)
                    }
                    Value::Counter(_) => Err(wrong_type(key, "set")),
                }
            }
        }
    }

    async fn set_contains(&self, key: &str, member: u32) -> CacheResult<bool> {
        self.live(key, |value| match value {
            Value::Set(members) => Ok(members.contains(&member)),
            Value::Counter(_) => Err(wrong_type(key, "set")),
        })
        .map(|found| found.unwrap_or(false))
    }

    async fn set_len(&self, key: &str) -> CacheResult<usize> {
        self.live(key, |value| match value {
            Value::Set(members) => Ok(members.len()),
            Value::Counter(_) => Err(wrong_type(key, "set")),
        })
        .map(|len| len.unwrap_or(0))
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<u32>> {
        self.live(key, |value| match value {
            Value::Set(members) => Ok(members.iter().copied().collect()),
            Value::Counter(_) => Err(wrong_type(key, "set")),
        })
        .map(Option::unwrap_or_default)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.live(key, |_| Ok(())).map(|found| found.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }
}

/// Spawn a background task that periodically evicts expired cache entries.
/// Returns a handle that can be used to stop the cleanup task.
pub fn spawn_cleanup_task(
    cache: Arc<MemoryCache>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let evicted = cache.purge_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "Cache cleanup task evicted expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_counter_incr_decr() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("c", TTL).await.unwrap(), 1);
        assert_eq!(cache.incr("c", TTL).await.unwrap(), 2);
        assert_eq!(cache.counter("c").await.unwrap(), 2);
        assert_eq!(cache.decr("c").await.unwrap(), 1);
        assert_eq!(cache.decr("c").await.unwrap(), 0);
        assert!(!cache.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_decr_never_goes_negative() {
        let cache = MemoryCache::new();
        assert_eq!(cache.decr("missing").await.unwrap(), 0);
        assert_eq!(cache.counter("missing").await.unwrap(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_set_operations() {
        let cache = MemoryCache::new();
        cache.set_init("s", TTL).await.unwrap();
        assert!(cache.exists("s").await.unwrap());
        assert_eq!(cache.set_len("s").await.unwrap(), 0);

        assert!(cache.set_add("s", 2, TTL).await.unwrap());
        assert!(cache.set_add("s", 0, TTL).await.unwrap());
        assert!(!cache.set_add("s", 2, TTL).await.unwrap());

        assert!(cache.set_contains("s", 0).await.unwrap());
        assert!(!cache.set_contains("s", 1).await.unwrap());
        assert_eq!(cache.set_members("s").await.unwrap(), vec![0, 2]);

        assert!(cache.delete("s").await.unwrap());
        assert!(!cache.delete("s").await.unwrap());
        assert_eq!(cache.set_len("s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let cache = MemoryCache::new();
        cache.incr("k", TTL).await.unwrap();
        assert!(matches!(
            cache.set_add("k", 1, TTL).await,
            Err(CacheError::WrongType { .. })
        ));

        cache.set_init("s", TTL).await.unwrap();
        assert!(matches!(
            cache.incr("s", TTL).await,
            Err(CacheError::WrongType { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires() {
        let cache = MemoryCache::new();
        cache.incr("c", Duration::from_secs(5)).await.unwrap();
        cache.incr("c", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.counter("c").await.unwrap(), 0);
        assert_eq!(cache.incr("c", Duration::from_secs(5)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_below_stops_at_limit() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_below("c", 2, TTL).await.unwrap(), Some(1));
        assert_eq!(cache.incr_below("c", 2, TTL).await.unwrap(), Some(2));
        assert_eq!(cache.incr_below("c", 2, TTL).await.unwrap(), None);
        assert_eq!(cache.counter("c").await.unwrap(), 2);

        cache.decr("c").await.unwrap();
        assert_eq!(cache.incr_below("c", 2, TTL).await.unwrap(), Some(2));
        assert_eq!(cache.incr_below("other", 0, TTL).await.unwrap(), None);
        assert!(!cache.exists("other").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_incr_below_keeps_expiry() {
        let cache = MemoryCache::new();
        cache.incr_below("c", 1, Duration::from_secs(10)).await.unwrap();

        // Refused attempts keep arriving well inside the TTL.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(3)).await;
            assert_eq!(
                cache.incr_below("c", 1, Duration::from_secs(10)).await.unwrap(),
                None
            );
        }

        // 12s since the only accepted increment.
        assert_eq!(cache.counter("c").await.unwrap(), 0);
        assert_eq!(
            cache.incr_below("c", 1, Duration::from_secs(10)).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_add_refreshes_ttl() {
        let cache = MemoryCache::new();
        cache.set_add("s", 0, Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set_add("s", 1, Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.set_members("s").await.unwrap(), vec![0, 1]);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!cache.exists("s").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = MemoryCache::new();
        cache.incr("short", Duration::from_secs(1)).await.unwrap();
        cache.set_add("long", 1, Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("long").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_evicts() {
        let cache = Arc::new(MemoryCache::new());
        cache.incr("c", Duration::from_secs(1)).await.unwrap();

        let handle = spawn_cleanup_task(cache.clone(), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(cache.is_empty());
        handle.abort();
    }
}
