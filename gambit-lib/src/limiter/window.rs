use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::Decision;
use crate::ClientId;

#[derive(Debug, Clone, Copy)]
struct FixedBucket {
    window_start: Instant,
    count: u32,
}

/// Fixed-window counters per client.
///
/// A client's window starts with its first request and ends `window` later;
/// the next request after that starts a new window.
#[derive(Debug)]
pub(crate) struct FixedWindowTable {
    window: Duration,
    max_requests: u32,
    buckets: DashMap<ClientId, FixedBucket>,
}

impl FixedWindowTable {
    pub(crate) fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            buckets: DashMap::new(),
        }
    }

    pub(crate) fn evaluate(&self, client: &ClientId, now: Instant) -> Decision {
        // The entry guard serializes concurrent requests of one client
        let mut bucket = self
            .buckets
            .entry(client.clone())
            .or_insert(FixedBucket {
                window_start: now,
                count: 0,
            });

        let window_end = bucket.window_start + self.window;
        if now >= window_end {
            *bucket = FixedBucket {
                window_start: now,
                count: 0,
            };
        }

        if bucket.count < self.max_requests {
            bucket.count += 1;
            Decision::Allowed {
                remaining: self.max_requests - bucket.count,
            }
        } else {
            Decision::Rejected {
                retry_after: (bucket.window_start + self.window).saturating_duration_since(now),
            }
        }
    }

    pub(crate) fn purge(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.window_start + self.window > now);
        before.saturating_sub(self.buckets.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }
}

/// Sliding-log counters per client: the admission instants of the trailing
/// window are kept, so a burst at the end of one window cannot be followed
/// by a full burst at the start of the next.
#[derive(Debug)]
pub(crate) struct SlidingWindowTable {
    window: Duration,
    max_requests: u32,
    logs: DashMap<ClientId, VecDeque<Instant>>,
}

impl SlidingWindowTable {
    pub(crate) fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            logs: DashMap::new(),
        }
    }

    pub(crate) fn evaluate(&self, client: &ClientId, now: Instant) -> Decision {
        let mut log = self.logs.entry(client.clone()).or_default();
        while log.front().is_some_and(|&at| at + self.window <= now) {
            log.pop_front();
        }

        #[allow(clippy::cast_possible_truncation)]
        let admitted = log.len() as u32;
        if admitted < self.max_requests {
            log.push_back(now);
            Decision::Allowed {
                remaining: self.max_requests - admitted - 1,
            }
        } else {
            let oldest = log.front().copied().unwrap_or(now);
            Decision::Rejected {
                retry_after: (oldest + self.window).saturating_duration_since(now),
            }
        }
    }

    pub(crate) fn purge(&self, now: Instant) -> usize {
        let before = self.logs.len();
        self.logs
            .retain(|_, log| log.back().is_some_and(|&at| at + self.window > now));
        before.saturating_sub(self.logs.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.logs.len()
    }
}
