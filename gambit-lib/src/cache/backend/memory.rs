use async_trait::async_trait;
use dashmap::DashMap;
use glob::Pattern;
use std::time::Duration;
use tokio::time::Instant;

use super::CacheBackend;
use crate::Result;

/// A stored value together with its expiry information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Serialized response
    pub value: String,
    /// How long the record stays valid after insertion
    pub ttl: Duration,
    /// When the record was written
    pub inserted_at: Instant,
}

impl CacheRecord {
    /// Create a record inserted now
    #[must_use]
    pub fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            ttl,
            inserted_at: Instant::now(),
        }
    }

    /// Check whether the record is past its TTL at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// In-process cache backend.
///
/// Expired records are dropped when they are read; [`MemoryBackend::sweep`]
/// removes the ones nobody reads anymore.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<String, CacheRecord>,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all expired records, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            log::debug!("Swept {removed} expired cache records");
        }
        removed
    }

    /// Number of records held, including expired ones not yet swept
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the backend holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.records.get(key) {
            Some(record) if !record.is_expired(now) => return Ok(Some(record.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.records
                .remove_if(key, |_, record| record.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.records
            .insert(key.to_string(), CacheRecord::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.records.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = Pattern::new(pattern)?;
        let now = Instant::now();
        Ok(self
            .records
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}
