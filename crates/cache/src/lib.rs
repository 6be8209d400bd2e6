//! Shared cache abstraction for transient upload state.
//!
//! The engine keeps two kinds of short-lived state here: per-upload
//! concurrency counters and per-upload chunk presence sets. Both carry a TTL
//! so that state left behind by a vanished client frees itself.

pub mod error;
pub mod memory;

pub use error::{CacheError, CacheResult};
pub use memory::{MemoryCache, spawn_cleanup_task};

use async_trait::async_trait;
use std::time::Duration;

/// A TTL key-value store with atomic counters and integer sets.
///
/// A key holds either a counter or a set. Using a key with the wrong kind of
/// operation fails with [`CacheError::WrongType`]. Expired keys behave
/// exactly like absent ones.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Atomically increment a counter, creating it at 0 if absent, and
    /// (re)arm its expiry. Returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<i64>;

    /// Atomically increment a counter only if its current value is below
    /// `limit`, (re)arming its expiry. Returns the new value, or `None` when
    /// the counter is already at the limit. A refused increment leaves the
    /// value and the expiry untouched.
    async fn incr_below(&self, key: &str, limit: i64, ttl: Duration) -> CacheResult<Option<i64>>;

    /// Atomically decrement a counter without going below zero. A counter
    /// that reaches zero is removed. Returns the new value.
    async fn decr(&self, key: &str) -> CacheResult<i64>;

    /// Current value of a counter (0 if absent).
    async fn counter(&self, key: &str) -> CacheResult<i64>;

    /// Create an empty set, replacing whatever the key held.
    async fn set_init(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    /// Add a member to a set, creating it if absent, and (re)arm its expiry.
    /// Returns `true` if the member was not present before.
    async fn set_add(&self, key: &str, member: u32, ttl: Duration) -> CacheResult<bool>;

    async fn set_contains(&self, key: &str, member: u32) -> CacheResult<bool>;

    /// Number of members (0 if absent).
    async fn set_len(&self, key: &str) -> CacheResult<usize>;

    /// Members in ascending order (empty if absent).
    async fn set_members(&self, key: &str) -> CacheResult<Vec<u32>>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Remove a key. Returns `true` if a live entry was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Check that the cache is reachable.
    async fn health_check(&self) -> CacheResult<()> {
        Ok(())
    }
}
