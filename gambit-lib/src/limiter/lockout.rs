use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::LockoutConfig;

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    failures: u32,
    last_failure: Instant,
    locked_until: Option<Instant>,
}

/// Whether an identifier may attempt the guarded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutStatus {
    /// Attempts are allowed
    Open,
    /// Attempts are refused for `remaining`
    Locked {
        /// Time left until the lockout ends
        remaining: Duration,
    },
}

impl LockoutStatus {
    /// Check whether attempts are refused
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        matches!(self, LockoutStatus::Locked { .. })
    }
}

/// Counts consecutive failures per identifier and locks it out with
/// exponentially growing durations.
///
/// The `max_attempts`-th consecutive failure locks for `base_lockout`, each
/// further one doubles it up to `lockout_cap`. A success clears the record;
/// so does `reset_after` passing without a failure.
#[derive(Debug)]
pub struct LockoutTracker {
    config: LockoutConfig,
    records: DashMap<String, FailureRecord>,
}

impl LockoutTracker {
    /// Create a tracker with the given settings
    #[must_use]
    pub fn new(config: LockoutConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Current status of `id`
    #[must_use]
    pub fn check(&self, id: &str) -> LockoutStatus {
        let now = Instant::now();
        let expired = match self.records.get(id) {
            None => return LockoutStatus::Open,
            Some(record) if self.is_forgotten(&record, now) => true,
            Some(record) => return Self::status(&record, now),
        };
        if expired {
            self.records
                .remove_if(id, |_, record| self.is_forgotten(record, now));
        }
        LockoutStatus::Open
    }

    /// Record a failed attempt of `id` and return the resulting status
    pub fn record_failure(&self, id: &str) -> LockoutStatus {
        let now = Instant::now();
        let mut record = self.records.entry(id.to_string()).or_insert(FailureRecord {
            failures: 0,
            last_failure: now,
            locked_until: None,
        });
        if self.is_forgotten(&record, now) {
            record.failures = 0;
            record.locked_until = None;
        }

        record.failures = record.failures.saturating_add(1);
        record.last_failure = now;
        if let Some(lockout) = self.lockout_for(record.failures) {
            log::warn!(
                "Locking out `{id}` for {}s after {} failed attempts",
                lockout.as_secs(),
                record.failures
            );
            record.locked_until = Some(now + lockout);
        }
        Self::status(&record, now)
    }

    /// Record a successful attempt of `id`, clearing its failures
    pub fn record_success(&self, id: &str) {
        self.records.remove(id);
    }

    /// Drop records that are neither locked nor recent
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, record| !self.is_forgotten(record, now));
        before.saturating_sub(self.records.len())
    }

    /// Number of identifiers with recorded failures
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check whether no failures are recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Lockout duration after `failures` consecutive failures
    fn lockout_for(&self, failures: u32) -> Option<Duration> {
        let exponent = failures.checked_sub(self.config.max_attempts)?;
        let factor = 2u32.saturating_pow(exponent);
        Some(
            self.config
                .base_lockout
                .saturating_mul(factor)
                .min(self.config.lockout_cap),
        )
    }

    fn is_forgotten(&self, record: &FailureRecord, now: Instant) -> bool {
        let locked = record.locked_until.is_some_and(|until| until > now);
        !locked && record.last_failure + self.config.reset_after <= now
    }

    fn status(record: &FailureRecord, now: Instant) -> LockoutStatus {
        match record.locked_until {
            Some(until) if until > now => LockoutStatus::Locked {
                remaining: until - now,
            },
            _ => LockoutStatus::Open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::advance;

    fn tracker() -> LockoutTracker {
        LockoutTracker::new(LockoutConfig {
            max_attempts: 3,
            base_lockout: Duration::from_secs(10),
            lockout_cap: Duration::from_secs(35),
            reset_after: Duration::from_secs(600),
        })
    }

    fn locked(secs: u64) -> LockoutStatus {
        LockoutStatus::Locked {
            remaining: Duration::from_secs(secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_grows_exponentially_up_to_cap() {
        let tracker = tracker();
        assert_eq!(tracker.record_failure("magnus"), LockoutStatus::Open);
        assert_eq!(tracker.record_failure("magnus"), LockoutStatus::Open);
        assert_eq!(tracker.record_failure("magnus"), locked(10));
        assert_eq!(tracker.record_failure("magnus"), locked(20));
        assert_eq!(tracker.record_failure("magnus"), locked(35));
        assert_eq!(tracker.record_failure("magnus"), locked(35));
        assert_eq!(tracker.check("hikaru"), LockoutStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_expires() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record_failure("magnus");
        }
        assert!(tracker.check("magnus").is_locked());

        advance(Duration::from_secs(4)).await;
        assert_eq!(tracker.check("magnus"), locked(6));

        advance(Duration::from_secs(6)).await;
        assert_eq!(tracker.check("magnus"), LockoutStatus::Open);
        // The failure count survives the lockout itself
        assert_eq!(tracker.record_failure("magnus"), locked(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failures() {
        let tracker = tracker();
        tracker.record_failure("magnus");
        tracker.record_failure("magnus");
        tracker.record_success("magnus");
        assert!(tracker.is_empty());
        assert_eq!(tracker.record_failure("magnus"), LockoutStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reset_after_cool_down() {
        let tracker = tracker();
        tracker.record_failure("magnus");
        tracker.record_failure("magnus");

        advance(Duration::from_secs(600)).await;
        assert_eq!(tracker.record_failure("magnus"), LockoutStatus::Open);
        assert_eq!(tracker.record_failure("magnus"), LockoutStatus::Open);
        assert_eq!(tracker.record_failure("magnus"), locked(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_keeps_locked_and_recent() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record_failure("locked");
        }
        tracker.record_failure("old");
        advance(Duration::from_secs(300)).await;
        tracker.record_failure("recent");
        advance(Duration::from_secs(300)).await;

        assert_eq!(tracker.purge(), 2);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.check("recent"), LockoutStatus::Open);
    }
}
