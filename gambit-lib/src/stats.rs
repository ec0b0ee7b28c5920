//! Process-wide counters for the cache, the inbound limiter and the upstream
//! broker.
//!
//! The [`Aggregator`] only counts. Live queue state (pending tasks, pause
//! flag) is owned by the broker and merged into the [`StatsSnapshot`] by the
//! [`Mediator`](crate::Mediator).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use strum::{Display, EnumCount, EnumIter};

/// A named counter tracked by the [`Aggregator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Counter {
    /// A cached response was served
    CacheHit,
    /// No (valid) cached response was found
    CacheMiss,
    /// A response was written to the cache
    CacheWrite,
    /// A cache record was removed explicitly
    CacheDelete,
    /// A cache backend operation failed
    CacheError,
    /// An inbound request was rejected by a limiter
    LimiterBlocked,
    /// An inbound request was admitted by a limiter
    LimiterPassed,
    /// A task was submitted to an upstream queue
    UpstreamQueued,
    /// An upstream task completed successfully
    UpstreamSucceeded,
    /// An upstream task failed (including throttling)
    UpstreamFailed,
}

impl Counter {
    const fn is_upstream(self) -> bool {
        matches!(
            self,
            Counter::UpstreamQueued | Counter::UpstreamSucceeded | Counter::UpstreamFailed
        )
    }
}

#[derive(Debug, Default)]
struct UpstreamCounters {
    queued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Lock-free counters shared by every component of the mediation layer.
///
/// Counting never blocks and never fails. [`Aggregator::reset`] is meant to
/// be called periodically by the host application.
#[derive(Debug)]
pub struct Aggregator {
    started: Instant,
    totals: [AtomicU64; Counter::COUNT],
    upstreams: DashMap<String, UpstreamCounters>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    /// Create an aggregator with all counters at zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
            upstreams: DashMap::new(),
        }
    }

    /// Make an upstream show up in snapshots before it saw any traffic
    pub fn register_upstream(&self, upstream: &str) {
        self.upstreams.entry(upstream.to_string()).or_default();
    }

    /// Increment `counter` by one.
    ///
    /// Upstream counters are additionally tracked per `upstream` when one is
    /// given; for all other counters `upstream` is ignored.
    pub fn increment(&self, counter: Counter, upstream: Option<&str>) {
        self.totals[counter as usize].fetch_add(1, Ordering::Relaxed);

        let Some(upstream) = upstream.filter(|_| counter.is_upstream()) else {
            return;
        };
        let entry = self.upstreams.entry(upstream.to_string()).or_default();
        let slot = match counter {
            Counter::UpstreamQueued => &entry.queued,
            Counter::UpstreamSucceeded => &entry.succeeded,
            _ => &entry.failed,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a total counter
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.totals[counter as usize].load(Ordering::Relaxed)
    }

    /// Zero all counters. Registered upstreams stay registered and the
    /// uptime keeps running.
    pub fn reset(&self) {
        for total in &self.totals {
            total.store(0, Ordering::Relaxed);
        }
        for entry in self.upstreams.iter() {
            entry.queued.store(0, Ordering::Relaxed);
            entry.succeeded.store(0, Ordering::Relaxed);
            entry.failed.store(0, Ordering::Relaxed);
        }
        log::info!("Statistics counters reset");
    }

    /// Take a consistent-enough read of all counters.
    ///
    /// Individual counters are read one after another, so a snapshot taken
    /// under load may mix values from slightly different instants.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.get(Counter::CacheHit);
        let misses = self.get(Counter::CacheMiss);

        let upstreams = self
            .upstreams
            .iter()
            .map(|entry| {
                let counters = entry.value();
                let snapshot = UpstreamSnapshot {
                    queued: counters.queued.load(Ordering::Relaxed),
                    succeeded: counters.succeeded.load(Ordering::Relaxed),
                    failed: counters.failed.load(Ordering::Relaxed),
                    pending: 0,
                    paused: false,
                };
                (entry.key().clone(), snapshot)
            })
            .collect();

        StatsSnapshot {
            hits,
            misses,
            errors: self.get(Counter::CacheError),
            writes: self.get(Counter::CacheWrite),
            deletes: self.get(Counter::CacheDelete),
            hit_rate: hit_rate(hits, misses),
            uptime_seconds: self.started.elapsed().as_secs(),
            limiter: LimiterSnapshot {
                blocked: self.get(Counter::LimiterBlocked),
                passed: self.get(Counter::LimiterPassed),
                queued: self.get(Counter::UpstreamQueued),
            },
            upstreams,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Point-in-time copy of all statistics, in the shape served to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// Cache backend errors
    pub errors: u64,
    /// Cache writes
    pub writes: u64,
    /// Explicit cache deletions (single keys and pattern matches)
    pub deletes: u64,
    /// `hits / (hits + misses)`, 0.0 without any lookups
    pub hit_rate: f64,
    /// Seconds since the aggregator was created
    pub uptime_seconds: u64,
    /// Inbound limiter totals
    pub limiter: LimiterSnapshot,
    /// Per-upstream counters and queue state
    pub upstreams: BTreeMap<String, UpstreamSnapshot>,
}

impl StatsSnapshot {
    /// Fill in the live queue state of an upstream
    pub fn set_queue_state(&mut self, upstream: &str, pending: usize, paused: bool) {
        let entry = self.upstreams.entry(upstream.to_string()).or_default();
        entry.pending = pending;
        entry.paused = paused;
    }
}

/// Totals of the inbound limiters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    /// Requests rejected
    pub blocked: u64,
    /// Requests admitted
    pub passed: u64,
    /// Tasks handed to the upstream broker by admitted requests
    pub queued: u64,
}

/// Counters and queue state of a single upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpstreamSnapshot {
    /// Tasks submitted
    pub queued: u64,
    /// Tasks that succeeded
    pub succeeded: u64,
    /// Tasks that failed
    pub failed: u64,
    /// Tasks waiting for admission right now
    pub pending: usize,
    /// Whether the queue is currently paused
    pub paused: bool,
}
