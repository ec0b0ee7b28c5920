use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep_until};

use super::key::UpstreamKey;
use super::stats::UpstreamStats;
use crate::stats::{Aggregator, Counter};
use crate::upstream::window::Window;
use crate::upstream::{BrokerError, SubmitError, Throttling, UpstreamConfig};

/// Live state of an [`UpstreamQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    /// Tasks waiting for admission
    pub pending: usize,
    /// Admitted tasks that did not finish yet
    pub in_flight: usize,
    /// Whether admissions are currently suspended
    pub paused: bool,
    /// When a pause ends, if one is active
    pub resume_at: Option<Instant>,
}

/// Bounded, interval-capped FIFO queue for the calls to one provider.
///
/// A task is admitted only when
/// - fewer than `max_concurrent` tasks are in flight,
/// - fewer than `interval_cap` tasks started within the trailing `interval`,
/// - the queue is not paused.
///
/// Waiting tasks are admitted strictly in submission order. Admitted tasks run
/// on their own tokio task, so a caller that stops waiting does not abort the
/// call, and the queue still sees its outcome.
#[derive(Debug)]
pub struct UpstreamQueue {
    /// The upstream this queue serves
    pub key: UpstreamKey,

    config: UpstreamConfig,

    /// Held by the task at the head of the queue while it waits for admission
    gate: AsyncMutex<()>,

    /// Admission slots for concurrently running tasks
    slots: Arc<Semaphore>,

    /// Start instants within the trailing interval
    starts: Mutex<Window<Instant>>,

    /// End of the current pause
    resume_at: Mutex<Option<Instant>>,

    /// Wakes the head of the queue when a pause is lifted early
    resumed: Notify,

    pending: AtomicUsize,
    in_flight: AtomicUsize,

    stats: Mutex<UpstreamStats>,
    aggregator: Arc<Aggregator>,
}

/// Decrements the pending count when a waiting submission is admitted or
/// dropped
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An admitted task. Dropping it ends the in-flight accounting and releases
/// the slot, so this also happens when the task panics.
struct Admitted {
    queue: Arc<UpstreamQueue>,
    started: Instant,
    completed: bool,
    _permit: OwnedSemaphorePermit,
}

impl Admitted {
    fn complete<T, E: Throttling>(&mut self, result: &Result<T, E>) {
        self.completed = true;
        self.queue.complete(result, self.started.elapsed());
    }
}

impl Drop for Admitted {
    fn drop(&mut self) {
        let queue = &self.queue;
        queue.in_flight.fetch_sub(1, Ordering::AcqRel);
        if !self.completed {
            // Unwinding; a poisoned lock must not cause a second panic
            if let Ok(mut stats) = queue.stats.lock() {
                stats.record_failure(self.started.elapsed(), false);
            }
            queue
                .aggregator
                .increment(Counter::UpstreamFailed, Some(queue.key.as_str()));
        }
    }
}

impl UpstreamQueue {
    /// Create a queue for `key`. The config is expected to be validated.
    #[must_use]
    pub fn new(key: UpstreamKey, config: UpstreamConfig, aggregator: Arc<Aggregator>) -> Self {
        aggregator.register_upstream(key.as_str());
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            starts: Mutex::new(Window::new(config.interval_cap)),
            key,
            config,
            gate: AsyncMutex::new(()),
            resume_at: Mutex::new(None),
            resumed: Notify::new(),
            pending: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            stats: Mutex::new(UpstreamStats::default()),
            aggregator,
        }
    }

    /// The admission limits of this queue
    #[must_use]
    pub const fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Run `task` once it is admitted and return its result.
    ///
    /// Failures of the task are returned unmodified as [`SubmitError::Task`].
    /// A failure carrying a throttling signal additionally pauses the queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueFull`] if `max_pending` tasks are already
    /// waiting, [`BrokerError::TaskAborted`] if the task panicked, or the
    /// task's own error.
    pub async fn submit<F, T, E>(self: &Arc<Self>, task: F) -> Result<T, SubmitError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Throttling + Send + 'static,
    {
        let guard = self.enqueue()?;
        self.aggregator
            .increment(Counter::UpstreamQueued, Some(self.key.as_str()));

        let permit = self.admit().await;
        drop(guard);
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let mut admitted = Admitted {
            queue: Arc::clone(self),
            started: Instant::now(),
            completed: false,
            _permit: permit,
        };
        let handle = tokio::spawn(async move {
            let result = task.await;
            admitted.complete(&result);
            drop(admitted);
            result
        });

        match handle.await {
            Ok(result) => result.map_err(SubmitError::Task),
            Err(source) => Err(BrokerError::TaskAborted {
                upstream: self.key.clone(),
                source,
            }
            .into()),
        }
    }

    fn enqueue(&self) -> Result<PendingGuard<'_>, BrokerError> {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(&self.pending);
        if let Some(max_pending) = self.config.max_pending
            && pending >= max_pending
        {
            log::warn!("Upstream {} rejects task: {pending} already waiting", self.key);
            return Err(BrokerError::QueueFull {
                upstream: self.key.clone(),
                max_pending,
            });
        }
        Ok(guard)
    }

    /// Wait until the head of the queue may start.
    ///
    /// The gate is held for the whole wait, so later submissions queue up
    /// behind it in order. Pause and window state are re-read after every
    /// wake-up.
    async fn admit(&self) -> OwnedSemaphorePermit {
        let _gate = self.gate.lock().await;
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            // SAFETY: this should not panic as we never close the semaphore
            .expect("Semaphore was closed unexpectedly");

        loop {
            let resumed = self.resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();

            let now = Instant::now();
            if let Some(until) = self.paused_until(now) {
                log::debug!(
                    "Upstream {} paused, holding queue for {}ms",
                    self.key,
                    (until - now).as_millis()
                );
                tokio::select! {
                    () = sleep_until(until) => {}
                    () = &mut resumed => {}
                }
                continue;
            }

            let next_free = {
                let interval = self.config.interval;
                let mut starts = self.starts.lock().unwrap();
                starts.drain_while(|&start| start + interval <= now);
                if starts.is_full() {
                    starts.oldest().map(|&oldest| oldest + interval)
                } else {
                    starts.push(now);
                    None
                }
            };
            match next_free {
                Some(at) => sleep_until(at).await,
                None => return permit,
            }
        }
    }

    fn complete<T, E: Throttling>(&self, result: &Result<T, E>, elapsed: Duration) {
        let upstream = Some(self.key.as_str());

        match result {
            Ok(_) => {
                self.stats.lock().unwrap().record_success(elapsed);
                self.aggregator.increment(Counter::UpstreamSucceeded, upstream);
            }
            Err(e) => {
                let throttled = e.throttled();
                self.stats
                    .lock()
                    .unwrap()
                    .record_failure(elapsed, throttled.is_some());
                self.aggregator.increment(Counter::UpstreamFailed, upstream);

                if let Some(throttled) = throttled {
                    let delay = throttled
                        .retry_after
                        .unwrap_or(self.config.default_resume_delay);
                    self.throttle(delay);
                }
            }
        }
    }

    /// Pause after the provider throttled us. An existing pause that ends
    /// later than `now + delay` is kept.
    fn throttle(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut resume_at = self.resume_at.lock().unwrap();
        match *resume_at {
            Some(current) if current >= until => {
                log::debug!(
                    "Upstream {} throttled again, keeping the longer pause",
                    self.key
                );
            }
            _ => {
                log::warn!(
                    "Upstream {} throttled the request, pausing for {}ms",
                    self.key,
                    delay.as_millis()
                );
                *resume_at = Some(until);
            }
        }
    }

    /// Suspend admissions until `until`, replacing any current pause
    ///
    /// # Panics
    ///
    /// Panics if the pause mutex is poisoned
    pub fn pause(&self, until: Instant) {
        log::info!("Upstream {} paused by request", self.key);
        *self.resume_at.lock().unwrap() = Some(until);
        // A shorter pause must wake the head of the queue early
        self.resumed.notify_waiters();
    }

    /// Lift the current pause, if any
    ///
    /// # Panics
    ///
    /// Panics if the pause mutex is poisoned
    pub fn resume(&self) {
        if self.resume_at.lock().unwrap().take().is_some() {
            log::info!("Upstream {} resumed", self.key);
        }
        self.resumed.notify_waiters();
    }

    /// End of the pause active at `now`
    fn paused_until(&self, now: Instant) -> Option<Instant> {
        self.resume_at
            .lock()
            .unwrap()
            .filter(|&resume_at| resume_at > now)
    }

    /// Check whether admissions are suspended right now
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_until(Instant::now()).is_some()
    }

    /// Current queue depth and pause state
    #[must_use]
    pub fn state(&self) -> QueueState {
        let resume_at = self.paused_until(Instant::now());
        QueueState {
            pending: self.pending.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            paused: resume_at.is_some(),
            resume_at,
        }
    }

    /// Get a copy of the task statistics
    ///
    /// # Panics
    ///
    /// Panics if the statistics mutex is poisoned
    #[must_use]
    pub fn stats(&self) -> UpstreamStats {
        self.stats.lock().unwrap().clone()
    }
}
