//! Response cache with a TTL policy and wildcard invalidation.
//!
//! # Architecture
//!
//! - [`CacheKey`]: namespaced key derived from method, path and query
//! - [`TtlPolicy`]: resolves a TTL from the request path via [`Category`] rules
//! - [`CacheBackend`]: storage, in-process or networked
//! - [`ResponseCache`]: the front used by handlers and the middleware; it
//!   never fails, backend errors are counted and treated as misses
//! - [`middleware`]: axum middleware memoizing successful GET responses

pub mod backend;
mod key;
pub mod middleware;
mod policy;

pub use backend::{CacheBackend, FallbackBackend, MemoryBackend};
pub use key::{CacheKey, KEY_NAMESPACE};
pub use middleware::{CacheOptions, CacheState, cache_response};
pub use policy::{Category, CategoryTtls, RouteRule, TtlPolicy, default_routes};

use glob::Pattern;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::stats::{Aggregator, Counter};

/// A response as stored in the cache.
///
/// Only the parts needed to replay the response are kept; the status is
/// stored so that a non-200 value can never be written by accident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status of the original response
    pub status: u16,
    /// Value of the original `Content-Type` header
    pub content_type: Option<String>,
    /// Response body
    pub body: String,
}

impl CachedResponse {
    /// Create a cacheable 200 response
    #[must_use]
    pub fn ok(content_type: Option<String>, body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            content_type,
            body: body.into(),
        }
    }

    /// Create a JSON 200 response
    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self::ok(Some(mime_json()), body)
    }

    /// Check whether the response may be stored
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }
}

fn mime_json() -> String {
    "application/json".to_string()
}

/// What [`ResponseCache::set`] did with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The value was written
    Stored,
    /// The value was not written: non-200 status, zero TTL, or a backend failure
    Ignored,
}

/// Front of the response cache.
///
/// All operations degrade instead of failing: a broken backend makes the
/// cache behave like an empty one, and every such failure is logged and
/// counted as [`Counter::CacheError`].
#[derive(Debug, Clone)]
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    policy: Arc<TtlPolicy>,
    stats: Arc<Aggregator>,
}

impl ResponseCache {
    /// Create a new cache on top of `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, policy: TtlPolicy, stats: Arc<Aggregator>) -> Self {
        Self {
            backend,
            policy: Arc::new(policy),
            stats,
        }
    }

    /// The TTL policy used to resolve TTLs from paths
    #[must_use]
    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// The storage backend
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Look up a cached response, counting a hit or a miss
    pub async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let raw = match self.backend.get(key.as_str()).await {
            Ok(raw) => raw,
            Err(e) => {
                self.backend_error("get", key.as_str(), &e);
                None
            }
        };

        let cached = raw.and_then(|raw| match serde_json::from_str::<CachedResponse>(&raw) {
            Ok(cached) => Some(cached),
            Err(e) => {
                self.backend_error("decode", key.as_str(), &e.into());
                None
            }
        });

        let counter = if cached.is_some() {
            Counter::CacheHit
        } else {
            Counter::CacheMiss
        };
        self.stats.increment(counter, None);
        log::trace!("Cache {counter} for {key}");
        cached
    }

    /// Store a response under `key` for `ttl`, replacing any previous value.
    ///
    /// Responses whose status is not 200 and zero TTLs are ignored.
    pub async fn set(&self, key: &CacheKey, response: &CachedResponse, ttl: Duration) -> SetOutcome {
        if !response.is_cacheable() {
            log::debug!(
                "Not caching {key}: status {} is not cacheable",
                response.status
            );
            return SetOutcome::Ignored;
        }
        if ttl.is_zero() {
            log::debug!("Not caching {key}: zero TTL");
            return SetOutcome::Ignored;
        }

        let value = match serde_json::to_string(response) {
            Ok(value) => value,
            Err(e) => {
                self.backend_error("encode", key.as_str(), &e.into());
                return SetOutcome::Ignored;
            }
        };

        match self.backend.set(key.as_str(), value, ttl).await {
            Ok(()) => {
                self.stats.increment(Counter::CacheWrite, None);
                SetOutcome::Stored
            }
            Err(e) => {
                self.backend_error("set", key.as_str(), &e);
                SetOutcome::Ignored
            }
        }
    }

    /// Store a response using the TTL the policy assigns to `path`
    pub async fn set_for_path(
        &self,
        key: &CacheKey,
        path: &str,
        response: &CachedResponse,
    ) -> SetOutcome {
        let ttl = self.policy.resolve(path);
        self.set(key, response, ttl).await
    }

    /// Remove a single record, returning whether it existed
    pub async fn delete(&self, key: &CacheKey) -> bool {
        match self.backend.delete(key.as_str()).await {
            Ok(existed) => {
                if existed {
                    self.stats.increment(Counter::CacheDelete, None);
                }
                existed
            }
            Err(e) => {
                self.backend_error("delete", key.as_str(), &e);
                false
            }
        }
    }

    /// Remove every record whose key matches the wildcard `pattern`, e.g.
    /// `cache:*:/api/players/42*`. Returns the number of removed records.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid wildcard pattern. Backend
    /// failures are not errors; they are counted and reported as zero removals.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        Pattern::new(pattern)?;

        let keys = match self.backend.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                self.backend_error("keys", pattern, &e);
                return Ok(0);
            }
        };

        let mut removed = 0;
        for key in keys {
            match self.backend.delete(&key).await {
                Ok(true) => {
                    self.stats.increment(Counter::CacheDelete, None);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => self.backend_error("delete", &key, &e),
            }
        }
        log::debug!("Invalidated {removed} cache records matching `{pattern}`");
        Ok(removed)
    }

    /// Drop all cached responses
    pub async fn flush(&self) {
        if let Err(e) = self.backend.flush().await {
            self.backend_error("flush", "*", &e);
        }
    }

    fn backend_error(&self, operation: &str, key: &str, error: &crate::ErrorKind) {
        self.stats.increment(Counter::CacheError, None);
        log::warn!(
            "Cache {operation} failed on backend `{}` for `{key}`: {error}",
            self.backend.name()
        );
    }
}
