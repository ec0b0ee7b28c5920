use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

use crate::Result;
use crate::stats::Aggregator;
use crate::upstream::{
    BrokerError, QueueState, SubmitError, Throttling, UpstreamConfigs, UpstreamKey, UpstreamQueue,
    UpstreamStatsMap,
};

/// Routes outbound calls to the queue of their upstream.
///
/// All queues are created up front from the configuration; submitting to a
/// name that was not configured fails right away instead of creating a new
/// queue. Queues are independent of each other: no fairness is attempted
/// across upstreams.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use gambit_lib::stats::Aggregator;
/// # use gambit_lib::upstream::{Broker, UpstreamConfig, UpstreamConfigs, UpstreamError};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut configs = UpstreamConfigs::new();
/// configs.insert("lichess".into(), UpstreamConfig::with_limits(4, Duration::from_secs(1), 8));
/// let broker = Broker::new(&configs, Arc::new(Aggregator::new()))?;
///
/// let rating = broker
///     .submit("lichess", async { Ok::<_, UpstreamError>(2850) })
///     .await?;
/// assert_eq!(rating, 2850);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Broker {
    queues: Arc<HashMap<UpstreamKey, Arc<UpstreamQueue>>>,
}

impl Broker {
    /// Create one queue per configured upstream
    ///
    /// # Errors
    ///
    /// Returns an error if any upstream configuration is invalid
    pub fn new(configs: &UpstreamConfigs, aggregator: Arc<Aggregator>) -> Result<Self> {
        let mut queues = HashMap::with_capacity(configs.len());
        for (key, config) in configs {
            config.validate(key)?;
            log::debug!(
                "Upstream {key}: {} concurrent, {} starts per {}ms",
                config.max_concurrent,
                config.interval_cap,
                config.interval.as_millis()
            );
            let queue = UpstreamQueue::new(key.clone(), config.clone(), aggregator.clone());
            queues.insert(key.clone(), Arc::new(queue));
        }
        Ok(Self {
            queues: Arc::new(queues),
        })
    }

    /// The queue for `upstream`
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownUpstream`] if no such upstream is configured
    pub fn queue(&self, upstream: &str) -> std::result::Result<&Arc<UpstreamQueue>, BrokerError> {
        let key = UpstreamKey::from(upstream);
        self.queues
            .get(&key)
            .ok_or(BrokerError::UnknownUpstream(key))
    }

    /// Run `task` on the queue of `upstream` and wait for its result.
    ///
    /// See [`UpstreamQueue::submit`] for the admission rules.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`BrokerError::UnknownUpstream`] for an
    /// unconfigured upstream. Otherwise the errors of [`UpstreamQueue::submit`].
    pub async fn submit<F, T, E>(
        &self,
        upstream: &str,
        task: F,
    ) -> std::result::Result<T, SubmitError<E>>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Throttling + Send + 'static,
    {
        let queue = self.queue(upstream)?;
        queue.submit(task).await
    }

    /// Suspend admissions on `upstream` until `until`
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownUpstream`] for an unconfigured upstream
    pub fn pause(&self, upstream: &str, until: Instant) -> std::result::Result<(), BrokerError> {
        self.queue(upstream)?.pause(until);
        Ok(())
    }

    /// Lift a pause on `upstream`
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownUpstream`] for an unconfigured upstream
    pub fn resume(&self, upstream: &str) -> std::result::Result<(), BrokerError> {
        self.queue(upstream)?.resume();
        Ok(())
    }

    /// Names of all configured upstreams
    pub fn upstreams(&self) -> impl Iterator<Item = &UpstreamKey> {
        self.queues.keys()
    }

    /// Live state of every queue, by upstream name
    #[must_use]
    pub fn queue_states(&self) -> BTreeMap<String, QueueState> {
        self.queues
            .iter()
            .map(|(key, queue)| (key.to_string(), queue.state()))
            .collect()
    }

    /// Task statistics of every queue
    #[must_use]
    pub fn upstream_stats(&self) -> UpstreamStatsMap {
        self.queues
            .iter()
            .map(|(key, queue)| (key.to_string(), queue.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::stats::Counter;
    use crate::upstream::{UpstreamConfig, UpstreamError};
    use std::time::Duration;

    fn broker() -> (Broker, Arc<Aggregator>) {
        let mut configs = UpstreamConfigs::new();
        configs.insert(
            "lichess".into(),
            UpstreamConfig::with_limits(2, Duration::from_secs(1), 10),
        );
        configs.insert(
            "chess.com".into(),
            UpstreamConfig::with_limits(1, Duration::from_secs(1), 10),
        );
        let aggregator = Arc::new(Aggregator::new());
        (Broker::new(&configs, aggregator.clone()).unwrap(), aggregator)
    }

    #[tokio::test]
    async fn test_unknown_upstream_fails_immediately() {
        let (broker, aggregator) = broker();
        let result = broker
            .submit("fide", async { Ok::<_, UpstreamError>(()) })
            .await;
        assert!(matches!(
            result,
            Err(SubmitError::Broker(BrokerError::UnknownUpstream(key))) if key.as_str() == "fide"
        ));
        assert_eq!(aggregator.get(Counter::UpstreamQueued), 0);
        assert!(broker.pause("fide", Instant::now()).is_err());
    }

    #[tokio::test]
    async fn test_submit_counts_per_upstream() {
        let (broker, aggregator) = broker();
        broker
            .submit("Lichess", async { Ok::<_, UpstreamError>(()) })
            .await
            .unwrap();
        let _ = broker
            .submit("chess.com", async {
                Err::<(), _>(UpstreamError::Status(http::StatusCode::BAD_GATEWAY))
            })
            .await;

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.limiter.queued, 2);
        assert_eq!(snapshot.upstreams["lichess"].succeeded, 1);
        assert_eq!(snapshot.upstreams["chess.com"].failed, 1);

        let stats = broker.upstream_stats();
        assert_eq!(stats.get("lichess").unwrap().succeeded, 1);
        assert_eq!(stats.sorted().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_one_upstream_leaves_the_other_active() {
        let (broker, _) = broker();
        let _ = broker
            .submit("lichess", async {
                Err::<(), _>(UpstreamError::RateLimited {
                    retry_after: Some(Duration::from_secs(2)),
                })
            })
            .await;

        let states = broker.queue_states();
        assert!(states["lichess"].paused);
        assert!(!states["chess.com"].paused);

        let before = Instant::now();
        broker
            .submit("chess.com", async { Ok::<_, UpstreamError>(()) })
            .await
            .unwrap();
        assert_eq!(Instant::now(), before);

        broker.resume("lichess").unwrap();
        assert!(!broker.queue_states()["lichess"].paused);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut configs = UpstreamConfigs::new();
        configs.insert(
            "lichess".into(),
            UpstreamConfig::with_limits(0, Duration::from_secs(1), 1),
        );
        let result = Broker::new(&configs, Arc::new(Aggregator::new()));
        assert!(matches!(result, Err(ErrorKind::InvalidConfig(_))));
    }
}
