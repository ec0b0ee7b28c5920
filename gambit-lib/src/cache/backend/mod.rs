//! Storage behind the [`ResponseCache`](super::ResponseCache).
//!
//! - [`MemoryBackend`]: in-process store with lazy expiry and a sweep
//! - [`RedisBackend`]: networked store shared across processes (feature `redis`)
//! - [`FallbackBackend`]: decorator demoting a failing primary to a secondary

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::Result;

mod fallback;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use fallback::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_REPROBE_AFTER, FallbackBackend};
pub use memory::{CacheRecord, MemoryBackend};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// A key/value store with per-record expiry.
///
/// Patterns passed to [`CacheBackend::keys`] use simple wildcards: `*` matches
/// any run of characters and `?` a single one.
#[async_trait]
pub trait CacheBackend: Send + Sync + Debug {
    /// Short name used in log messages
    fn name(&self) -> &'static str;

    /// Look up a value. Expired records are reported as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any existing record for `key`
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove a record, returning whether one existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live keys matching `pattern`
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remove every record of the cache namespace
    async fn flush(&self) -> Result<()>;
}
