use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::Result;
use crate::cache::{CacheBackend, CacheOptions, CacheState, MemoryBackend, ResponseCache};
use crate::config::{BackendKind, CacheConfig, MediatorConfig};
use crate::limiter::{LockoutTracker, RateLimiter};
use crate::stats::{Aggregator, StatsSnapshot};
use crate::upstream::{Broker, BrokerError, ProviderClient, UpstreamKey, UpstreamStatsMap};

/// The mediation layer of one process.
///
/// Built once at startup from a [`MediatorConfig`] and shared with every
/// handler, typically as axum state. Cloning is cheap; clones share all
/// state.
///
/// # Examples
///
/// ```
/// use gambit_lib::Mediator;
/// use gambit_lib::config::MediatorConfig;
///
/// # #[tokio::main]
/// # async fn main() -> gambit_lib::Result<()> {
/// let config = MediatorConfig::from_toml(
///     r#"
///     [upstreams.lichess]
///     base_url = "https://lichess.org/api"
///     "#,
/// )?;
/// let mediator = Mediator::from_config(&config).await?;
/// assert!(mediator.provider("lichess").is_ok());
/// assert!(mediator.limiter("api").is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Mediator {
    stats: Arc<Aggregator>,
    cache: ResponseCache,
    cache_options: CacheOptions,
    memory: Arc<MemoryBackend>,
    broker: Broker,
    providers: Arc<HashMap<UpstreamKey, ProviderClient>>,
    limiters: Arc<BTreeMap<String, Arc<RateLimiter>>>,
    lockout: Arc<LockoutTracker>,
}

impl Mediator {
    /// Validate `config` and build all components.
    ///
    /// A Redis backend that cannot be reached at startup is not fatal; the
    /// cache then runs on the in-process backend alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a provider client
    /// cannot be built
    pub async fn from_config(config: &MediatorConfig) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(Aggregator::new());

        let memory = Arc::new(MemoryBackend::new());
        let backend = cache_backend(&config.cache, memory.clone()).await;
        log::info!("Response cache uses the {} backend", backend.name());
        let cache = ResponseCache::new(backend, config.cache.ttl_policy()?, stats.clone());
        let cache_options = CacheOptions::builder()
            .excluded_paths(config.cache.excluded_paths.clone())
            .max_body_size(config.cache.max_body_size)
            .build();

        let broker = Broker::new(&config.upstreams, stats.clone())?;
        let mut providers = HashMap::new();
        for (key, upstream) in &config.upstreams {
            if let Some(client) = ProviderClient::from_config(key, upstream)? {
                providers.insert(key.clone(), client);
            }
        }

        let limiters = config
            .limiters
            .iter()
            .map(|(name, policy)| {
                RateLimiter::new(name.clone(), *policy, stats.clone())
                    .map(|limiter| (name.clone(), Arc::new(limiter)))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            stats,
            cache,
            cache_options,
            memory,
            broker,
            providers: Arc::new(providers),
            limiters: Arc::new(limiters),
            lockout: Arc::new(LockoutTracker::new(config.lockout)),
        })
    }

    /// The shared counters
    #[must_use]
    pub fn stats(&self) -> &Arc<Aggregator> {
        &self.stats
    }

    /// The response cache
    #[must_use]
    pub const fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// State for the [`cache_response`](crate::cache::cache_response) middleware
    #[must_use]
    pub fn cache_state(&self) -> CacheState {
        CacheState::new(self.cache.clone(), self.cache_options.clone())
    }

    /// The upstream broker
    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The HTTP client of a provider
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownUpstream`] if no upstream of that name
    /// has a `base_url`
    pub fn provider(&self, upstream: &str) -> std::result::Result<&ProviderClient, BrokerError> {
        let key = UpstreamKey::from(upstream);
        self.providers
            .get(&key)
            .ok_or(BrokerError::UnknownUpstream(key))
    }

    /// The limiter of a named policy
    #[must_use]
    pub fn limiter(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    /// The lockout tracker
    #[must_use]
    pub fn lockout(&self) -> &Arc<LockoutTracker> {
        &self.lockout
    }

    /// Counters merged with the live state of every upstream queue
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        for (upstream, state) in self.broker.queue_states() {
            snapshot.set_queue_state(&upstream, state.pending, state.paused);
        }
        snapshot
    }

    /// Task statistics of every upstream queue
    #[must_use]
    pub fn upstream_stats(&self) -> UpstreamStatsMap {
        self.broker.upstream_stats()
    }

    /// Purge expired cache records, stale limiter buckets and forgotten
    /// lockout records once
    pub fn run_maintenance(&self) {
        let records = self.memory.sweep();
        let buckets: usize = self
            .limiters
            .values()
            .map(|limiter| limiter.purge_stale())
            .sum();
        let lockouts = self.lockout.purge();
        log::debug!(
            "Maintenance removed {records} cache records, {buckets} limiter buckets, {lockouts} lockout records"
        );
    }

    /// Run [`Mediator::run_maintenance`] every `interval` until the returned
    /// handle is aborted
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let mediator = self.clone();
        let mut ticks = interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                ticks.tick().await;
                mediator.run_maintenance();
            }
        })
    }
}

async fn cache_backend(config: &CacheConfig, memory: Arc<MemoryBackend>) -> Arc<dyn CacheBackend> {
    match config.backend {
        BackendKind::Memory => memory,
        BackendKind::Redis => redis_backend(config, memory).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_backend(config: &CacheConfig, memory: Arc<MemoryBackend>) -> Arc<dyn CacheBackend> {
    use crate::cache::FallbackBackend;
    use crate::cache::backend::RedisBackend;

    let Some(url) = config.redis_url.as_deref() else {
        return memory;
    };
    match RedisBackend::connect(url).await {
        Ok(redis) => Arc::new(FallbackBackend::with_thresholds(
            Arc::new(redis),
            memory,
            config.failure_threshold,
            config.reprobe_after,
        )),
        Err(e) => {
            log::warn!("Redis cache unavailable, using in-process cache only: {e}");
            memory
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn redis_backend(_config: &CacheConfig, memory: Arc<MemoryBackend>) -> Arc<dyn CacheBackend> {
    memory
}
