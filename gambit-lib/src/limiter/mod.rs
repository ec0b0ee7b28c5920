//! Inbound per-client rate limiting and progressive lockout.
//!
//! Every named [`LimiterPolicy`] gets its own [`RateLimiter`] with an
//! independent table of client buckets. Buckets are created on a client's
//! first request and purged once stale, on access and by
//! [`RateLimiter::purge_stale`].

mod config;
mod lockout;
pub mod middleware;
mod token_bucket;
mod window;

pub use config::{LimiterPolicies, LimiterPolicy, LockoutConfig, Strategy, default_policies};
pub use lockout::{LockoutStatus, LockoutTracker};
pub use middleware::{client_id, lockout_response, rate_limit, rejection_response};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::stats::{Aggregator, Counter};
use crate::{ClientId, Result};
use token_bucket::TokenBucketTable;
use window::{FixedWindowTable, SlidingWindowTable};

/// Evaluations between two opportunistic purges of stale buckets
const PURGE_EVERY: u64 = 1024;

/// Outcome of [`RateLimiter::evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allowed {
        /// Requests the client has left in the current window
        remaining: u32,
    },
    /// The request exceeds the client's limit
    Rejected {
        /// Time until the client may retry
        retry_after: Duration,
    },
}

impl Decision {
    /// Check whether the request may proceed
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Whole seconds until a retry, rounded up and at least one
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Rejected { retry_after } => Some(ceil_secs(*retry_after)),
        }
    }
}

/// `duration` in whole seconds, rounded up, at least 1
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

#[derive(Debug)]
enum Buckets {
    Fixed(FixedWindowTable),
    Sliding(SlidingWindowTable),
    Token(TokenBucketTable),
}

/// Admission control for one named policy
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    policy: LimiterPolicy,
    buckets: Buckets,
    evaluations: AtomicU64,
    stats: Arc<Aggregator>,
}

impl RateLimiter {
    /// Create a limiter for `policy`
    ///
    /// # Errors
    ///
    /// Returns an error if the policy admits no requests
    pub fn new(name: impl Into<String>, policy: LimiterPolicy, stats: Arc<Aggregator>) -> Result<Self> {
        let name = name.into();
        policy.validate(&name)?;
        let buckets = match policy.strategy {
            Strategy::FixedWindow => {
                Buckets::Fixed(FixedWindowTable::new(policy.window, policy.max_requests))
            }
            Strategy::SlidingWindow => {
                Buckets::Sliding(SlidingWindowTable::new(policy.window, policy.max_requests))
            }
            Strategy::TokenBucket => {
                Buckets::Token(TokenBucketTable::new(policy.window, policy.max_requests)?)
            }
        };
        Ok(Self {
            name,
            policy,
            buckets,
            evaluations: AtomicU64::new(0),
            stats,
        })
    }

    /// Name of the policy
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The enforced limits
    #[must_use]
    pub const fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    /// Admit or reject one request of `client`, counting the outcome
    pub fn evaluate(&self, client: &ClientId) -> Decision {
        let now = Instant::now();
        let decision = match &self.buckets {
            Buckets::Fixed(table) => table.evaluate(client, now),
            Buckets::Sliding(table) => table.evaluate(client, now),
            Buckets::Token(table) => table.evaluate(client),
        };

        match decision {
            Decision::Allowed { .. } => self.stats.increment(Counter::LimiterPassed, None),
            Decision::Rejected { retry_after } => {
                self.stats.increment(Counter::LimiterBlocked, None);
                log::debug!(
                    "Limiter `{}` rejected {client}, retry in {}ms",
                    self.name,
                    retry_after.as_millis()
                );
            }
        }

        if self.evaluations.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_stale();
        }
        decision
    }

    /// Drop the buckets of clients whose window has passed
    pub fn purge_stale(&self) -> usize {
        let now = Instant::now();
        let purged = match &self.buckets {
            Buckets::Fixed(table) => table.purge(now),
            Buckets::Sliding(table) => table.purge(now),
            Buckets::Token(table) => table.purge(),
        };
        if purged > 0 {
            log::debug!("Limiter `{}` purged {purged} stale client buckets", self.name);
        }
        purged
    }

    /// Number of clients with a bucket
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        match &self.buckets {
            Buckets::Fixed(table) => table.len(),
            Buckets::Sliding(table) => table.len(),
            Buckets::Token(table) => table.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio::time::advance;

    #[rstest]
    #[case(Duration::from_millis(1), 1)]
    #[case(Duration::from_millis(1000), 1)]
    #[case(Duration::from_millis(1001), 2)]
    #[case(Duration::from_secs(59), 59)]
    #[case(Duration::ZERO, 1)]
    fn test_ceil_secs(#[case] duration: Duration, #[case] expected: u64) {
        assert_eq!(ceil_secs(duration), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_of_one_second_with_three_requests() {
        let stats = Arc::new(Aggregator::new());
        let limiter = RateLimiter::new(
            "api",
            LimiterPolicy::new(Duration::from_millis(1000), 3),
            stats.clone(),
        )
        .unwrap();
        let client = ClientId::from("203.0.113.7");

        for _ in 0..3 {
            assert!(limiter.evaluate(&client).is_allowed());
        }
        let rejected = limiter.evaluate(&client);
        assert!(!rejected.is_allowed());
        assert!(rejected.retry_after_secs().unwrap() <= 1);

        advance(Duration::from_millis(1001)).await;
        assert!(limiter.evaluate(&client).is_allowed());

        assert_eq!(stats.get(Counter::LimiterPassed), 4);
        assert_eq!(stats.get(Counter::LimiterBlocked), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_policies_have_independent_buckets() {
        let stats = Arc::new(Aggregator::new());
        let strict =
            RateLimiter::new("strict", LimiterPolicy::new(Duration::from_secs(60), 1), stats.clone())
                .unwrap();
        let general = RateLimiter::new("general", LimiterPolicy::general(), stats).unwrap();
        let client = ClientId::from("203.0.113.7");

        assert!(strict.evaluate(&client).is_allowed());
        assert!(!strict.evaluate(&client).is_allowed());
        assert!(general.evaluate(&client).is_allowed());
        assert_eq!(general.policy().max_requests, 100);
    }

    #[rstest]
    #[case(Strategy::FixedWindow)]
    #[case(Strategy::SlidingWindow)]
    #[case(Strategy::TokenBucket)]
    #[tokio::test(start_paused = true)]
    async fn test_every_strategy_enforces_limit(#[case] strategy: Strategy) {
        let policy = LimiterPolicy::new(Duration::from_secs(60), 2).with_strategy(strategy);
        let limiter = RateLimiter::new("api", policy, Arc::new(Aggregator::new())).unwrap();
        let client = ClientId::from("203.0.113.7");

        assert_eq!(limiter.evaluate(&client), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.evaluate(&client), Decision::Allowed { remaining: 0 });
        assert!(!limiter.evaluate(&client).is_allowed());
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(
            "api",
            LimiterPolicy::new(Duration::from_secs(1), 5),
            Arc::new(Aggregator::new()),
        )
        .unwrap();
        limiter.evaluate(&ClientId::from("a"));
        limiter.evaluate(&ClientId::from("b"));

        advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.purge_stale(), 2);
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
