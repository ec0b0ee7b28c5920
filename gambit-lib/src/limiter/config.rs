use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use strum::{Display, EnumString};

use crate::{ErrorKind, Result};

/// How a policy counts requests
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Strategy {
    /// At most `max_requests` per window; the window restarts with the first
    /// request after it ended
    #[default]
    FixedWindow,
    /// At most `max_requests` in the trailing window, tracked per request
    SlidingWindow,
    /// A bucket of `max_requests` tokens refilled evenly over the window
    TokenBucket,
}

/// Limits of one named inbound policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterPolicy {
    /// Width of the counting window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests admitted per client and window
    pub max_requests: u32,
    /// Counting strategy
    #[serde(default)]
    pub strategy: Strategy,
}

impl LimiterPolicy {
    /// Fixed-window policy
    #[must_use]
    pub const fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            strategy: Strategy::FixedWindow,
        }
    }

    /// Same limits with another strategy
    #[must_use]
    pub const fn with_strategy(self, strategy: Strategy) -> Self {
        Self { strategy, ..self }
    }

    /// Loose policy for the whole site: 100 requests per 15 minutes
    #[must_use]
    pub const fn general() -> Self {
        Self::new(Duration::from_secs(15 * 60), 100)
    }

    /// Policy for expensive operations: 10 requests per minute
    #[must_use]
    pub const fn strict() -> Self {
        Self::new(Duration::from_secs(60), 10)
    }

    /// Policy for the data API: 60 requests per minute
    #[must_use]
    pub const fn api() -> Self {
        Self::new(Duration::from_secs(60), 60)
    }

    /// Check that the policy admits at least one request
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] for a zero window or zero limit
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.window.is_zero() {
            return Err(ErrorKind::invalid_config(format!(
                "limiter policy `{name}`: window must not be zero"
            )));
        }
        if self.max_requests == 0 {
            return Err(ErrorKind::invalid_config(format!(
                "limiter policy `{name}`: max_requests must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Named policies, each with its own client buckets
pub type LimiterPolicies = BTreeMap<String, LimiterPolicy>;

/// The `general`, `strict` and `api` policies
#[must_use]
pub fn default_policies() -> LimiterPolicies {
    LimiterPolicies::from([
        ("general".to_string(), LimiterPolicy::general()),
        ("strict".to_string(), LimiterPolicy::strict()),
        ("api".to_string(), LimiterPolicy::api()),
    ])
}

// Macro for generating default functions to be used by serde
macro_rules! default_function {
    ( $( $name:ident : $T:ty = $e:expr; )* ) => {
        $(
            #[allow(clippy::missing_const_for_fn)]
            fn $name() -> $T {
                $e
            }
        )*
    };
}

default_function! {
    default_max_attempts: u32 = 5;
    default_base_lockout: Duration = Duration::from_secs(30);
    default_lockout_cap: Duration = Duration::from_secs(30 * 60);
    default_reset_after: Duration = Duration::from_secs(15 * 60);
}

/// Progressive lockout after repeated failures (e.g. bad logins)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockoutConfig {
    /// Consecutive failures after which lockouts start
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lockout after the `max_attempts`-th failure; doubles with each further one
    #[serde(default = "default_base_lockout", with = "humantime_serde")]
    pub base_lockout: Duration,
    /// Upper bound for a single lockout
    #[serde(default = "default_lockout_cap", with = "humantime_serde")]
    pub lockout_cap: Duration,
    /// Failures are forgotten after this long without a new one
    #[serde(default = "default_reset_after", with = "humantime_serde")]
    pub reset_after: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_lockout: default_base_lockout(),
            lockout_cap: default_lockout_cap(),
            reset_after: default_reset_after(),
        }
    }
}

impl LockoutConfig {
    /// Check the lockout settings
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] if no failure could ever lock or
    /// the cap is below the base lockout
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ErrorKind::invalid_config(
                "lockout: max_attempts must be at least 1",
            ));
        }
        if self.lockout_cap < self.base_lockout {
            return Err(ErrorKind::invalid_config(
                "lockout: lockout_cap must not be below base_lockout",
            ));
        }
        Ok(())
    }
}
