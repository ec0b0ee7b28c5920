//! Configuration of the whole mediation layer.
//!
//! The configuration is usually read from a TOML file by the host binary:
//!
//! ```toml
//! maintenance_interval = "1m"
//!
//! [cache]
//! backend = "memory"
//! excluded_paths = ["/api/admin"]
//!
//! [cache.ttl]
//! openings = "1h"
//!
//! [upstreams.lichess]
//! max_concurrent = 4
//! interval = "1s"
//! interval_cap = 8
//! base_url = "https://lichess.org/api"
//!
//! [limiters.api]
//! window = "1m"
//! max_requests = 60
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use strum::Display;

use crate::cache::{CategoryTtls, RouteRule, TtlPolicy, default_routes};
use crate::limiter::{LimiterPolicies, LockoutConfig, default_policies};
use crate::upstream::UpstreamConfigs;
use crate::{ErrorKind, Result};

const fn default_failure_threshold() -> u32 {
    crate::cache::backend::DEFAULT_FAILURE_THRESHOLD
}

const fn default_reprobe_after() -> Duration {
    crate::cache::backend::DEFAULT_REPROBE_AFTER
}

const fn default_max_body_size() -> usize {
    crate::cache::middleware::DEFAULT_MAX_BODY_SIZE
}

const fn default_maintenance_interval() -> Duration {
    Duration::from_secs(60)
}

/// Where cached responses are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    /// In-process map, lost on restart
    #[default]
    Memory,
    /// Redis server, falling back to memory while it is unreachable
    Redis,
}

/// Consistency the operator accepts for cached data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Consistency {
    /// Only this process writes the cache
    #[default]
    Strong,
    /// Several processes share the cache and may briefly disagree
    Eventual,
}

/// The `[cache]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Connection URL of the Redis backend, e.g. `redis://127.0.0.1:6379`
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Must be `eventual` for a shared backend
    #[serde(default)]
    pub consistency: Consistency,

    /// TTL per route category
    #[serde(default)]
    pub ttl: CategoryTtls,

    /// Path prefixes mapped to route categories
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRule>,

    /// Path prefixes that are never cached
    #[serde(default)]
    pub excluded_paths: Vec<String>,

    /// Consecutive Redis failures before falling back to memory
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long to stay on the fallback before trying Redis again
    #[serde(default = "default_reprobe_after", with = "humantime_serde")]
    pub reprobe_after: Duration,

    /// Largest response body that is buffered to be cached
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis_url: None,
            consistency: Consistency::default(),
            ttl: CategoryTtls::default(),
            routes: default_routes(),
            excluded_paths: Vec::new(),
            failure_threshold: default_failure_threshold(),
            reprobe_after: default_reprobe_after(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl CacheConfig {
    /// Build the TTL policy described by this table
    ///
    /// # Errors
    ///
    /// Returns an error if a category TTL is zero
    pub fn ttl_policy(&self) -> Result<TtlPolicy> {
        TtlPolicy::new(self.ttl, self.routes.clone())
    }

    fn validate(&self) -> Result<()> {
        self.ttl_policy()?;
        if self.backend == BackendKind::Redis {
            if cfg!(not(feature = "redis")) {
                return Err(ErrorKind::invalid_config(
                    "cache backend `redis` requires building with the `redis` feature",
                ));
            }
            if self.redis_url.is_none() {
                return Err(ErrorKind::invalid_config(
                    "cache backend `redis` requires `redis_url`",
                ));
            }
            if self.consistency != Consistency::Eventual {
                return Err(ErrorKind::invalid_config(
                    "a shared cache backend is eventually consistent; set `consistency = \"eventual\"`",
                ));
            }
        }
        Ok(())
    }
}

/// Complete configuration of the mediation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediatorConfig {
    /// Response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Provider queues, by upstream name
    #[serde(default)]
    pub upstreams: UpstreamConfigs,

    /// Inbound limiter policies, by name
    #[serde(default = "default_policies")]
    pub limiters: LimiterPolicies,

    /// Progressive lockout
    #[serde(default)]
    pub lockout: LockoutConfig,

    /// Interval of the sweep purging expired cache records and stale
    /// limiter state
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            upstreams: UpstreamConfigs::new(),
            limiters: default_policies(),
            lockout: LockoutConfig::default(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl MediatorConfig {
    /// Parse a configuration from TOML
    ///
    /// # Errors
    ///
    /// Returns an error if the input does not match the schema
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).map_err(|e| ErrorKind::ReadConfig(path.to_path_buf(), e))?;
        Self::from_toml(&contents)
    }

    /// Check the configuration as a whole
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] for the first problem found
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        for (upstream, config) in &self.upstreams {
            config.validate(upstream)?;
        }
        for (name, policy) in &self.limiters {
            policy.validate(name)?;
        }
        self.lockout.validate()?;
        if self.maintenance_interval.is_zero() {
            return Err(ErrorKind::invalid_config(
                "maintenance_interval must not be zero",
            ));
        }
        Ok(())
    }
}
