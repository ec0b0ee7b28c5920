use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::CacheBackend;
use crate::Result;

/// Default number of consecutive primary failures before demotion
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default time after which a demoted primary is tried again
pub const DEFAULT_REPROBE_AFTER: Duration = Duration::from_secs(30);

/// Routes operations to a primary backend and switches to a secondary while
/// the primary keeps failing.
///
/// After `failure_threshold` consecutive primary failures the primary is
/// demoted. Every `reprobe_after` one operation is sent to the primary again;
/// if it succeeds the primary is promoted back. Operations that fail on the
/// primary are retried once on the secondary, so a flaky primary degrades to
/// the secondary instead of to errors.
///
/// A delete that does not reach the primary leaves records there that may
/// have been invalidated. Before the primary serves anything again, its
/// namespace is flushed.
#[derive(Debug)]
pub struct FallbackBackend {
    primary: Arc<dyn CacheBackend>,
    secondary: Arc<dyn CacheBackend>,
    failure_threshold: u32,
    reprobe_after: Duration,
    consecutive_failures: AtomicU32,
    demoted_at: Mutex<Option<Instant>>,
    /// Set when a delete or flush was served by the secondary only
    missed_deletes: AtomicBool,
}

impl FallbackBackend {
    /// Create a new decorator with the default threshold and reprobe interval
    #[must_use]
    pub fn new(primary: Arc<dyn CacheBackend>, secondary: Arc<dyn CacheBackend>) -> Self {
        Self::with_thresholds(
            primary,
            secondary,
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_REPROBE_AFTER,
        )
    }

    /// Create a new decorator with explicit demotion settings
    #[must_use]
    pub fn with_thresholds(
        primary: Arc<dyn CacheBackend>,
        secondary: Arc<dyn CacheBackend>,
        failure_threshold: u32,
        reprobe_after: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            failure_threshold: failure_threshold.max(1),
            reprobe_after,
            consecutive_failures: AtomicU32::new(0),
            demoted_at: Mutex::new(None),
            missed_deletes: AtomicBool::new(false),
        }
    }

    /// Check whether operations currently go to the secondary
    ///
    /// # Panics
    ///
    /// Panics if the demotion mutex is poisoned
    #[must_use]
    pub fn is_demoted(&self) -> bool {
        self.demoted_at.lock().unwrap().is_some()
    }

    /// Decide whether the next operation goes to the primary
    fn use_primary(&self) -> bool {
        let mut demoted_at = self.demoted_at.lock().unwrap();
        match *demoted_at {
            None => true,
            Some(since) if since.elapsed() >= self.reprobe_after => {
                // Restart the timer so only one caller probes per interval
                *demoted_at = Some(Instant::now());
                true
            }
            Some(_) => false,
        }
    }

    /// Decide whether the next operation goes to the primary, first flushing
    /// it if deletes were missed
    async fn reach_primary(&self) -> bool {
        if !self.use_primary() {
            return false;
        }
        if !self.missed_deletes.load(Ordering::Acquire) {
            return true;
        }
        log::info!(
            "Flushing cache backend `{}`, it missed deletes while failing",
            self.primary.name()
        );
        if self.observe(self.primary.flush().await).is_some() {
            self.missed_deletes.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut demoted_at = self.demoted_at.lock().unwrap();
        if demoted_at.take().is_some() {
            log::info!(
                "Cache backend `{}` recovered, switching back from `{}`",
                self.primary.name(),
                self.secondary.name()
            );
        }
    }

    fn record_failure(&self, error: &crate::ErrorKind) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!(
            "Cache backend `{}` failed ({failures} in a row): {error}",
            self.primary.name()
        );
        if failures >= self.failure_threshold {
            let mut demoted_at = self.demoted_at.lock().unwrap();
            if demoted_at.is_none() {
                log::warn!(
                    "Demoting cache backend `{}` to `{}` for {}s",
                    self.primary.name(),
                    self.secondary.name(),
                    self.reprobe_after.as_secs()
                );
            }
            *demoted_at = Some(Instant::now());
        }
    }

    /// Unwrap the primary's result, recording it; `None` means "use the secondary"
    fn observe<T>(&self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.record_success();
                Some(value)
            }
            Err(e) => {
                self.record_failure(&e);
                None
            }
        }
    }
}

#[async_trait]
impl CacheBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.reach_primary().await
            && let Some(value) = self.observe(self.primary.get(key).await)
        {
            return Ok(value);
        }
        self.secondary.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        if self.reach_primary().await
            && self
                .observe(self.primary.set(key, value.clone(), ttl).await)
                .is_some()
        {
            return Ok(());
        }
        self.secondary.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if self.reach_primary().await
            && let Some(existed) = self.observe(self.primary.delete(key).await)
        {
            return Ok(existed);
        }
        self.missed_deletes.store(true, Ordering::Release);
        self.secondary.delete(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        if self.reach_primary().await
            && let Some(keys) = self.observe(self.primary.keys(pattern).await)
        {
            return Ok(keys);
        }
        self.secondary.keys(pattern).await
    }

    async fn flush(&self) -> Result<()> {
        // Both sides may hold records from before a switch
        let secondary = self.secondary.flush().await;
        let flushed = self.reach_primary().await
            && self.observe(self.primary.flush().await).is_some();
        if !flushed {
            self.missed_deletes.store(true, Ordering::Release);
        }
        secondary
    }
}
