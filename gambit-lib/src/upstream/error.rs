use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::upstream::UpstreamKey;

/// The provider refused a call because of its own rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Throttled {
    /// How long the provider asked to wait, if it said so
    pub retry_after: Option<Duration>,
}

/// Failures of upstream tasks that may carry a provider throttling signal.
///
/// The broker pauses a queue whenever a task fails with an error for which
/// [`Throttling::throttled`] returns `Some`.
pub trait Throttling {
    /// The throttling signal carried by this failure, if any
    fn throttled(&self) -> Option<Throttled>;
}

impl Throttling for std::convert::Infallible {
    fn throttled(&self) -> Option<Throttled> {
        None
    }
}

/// Errors raised by the broker itself, before or around running a task
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No queue is configured for this upstream name
    #[error("No upstream named `{0}` is configured")]
    UnknownUpstream(UpstreamKey),

    /// The upstream already has `max_pending` tasks waiting for admission
    #[error("Upstream `{upstream}` has {max_pending} tasks waiting, rejecting new ones")]
    QueueFull {
        /// The saturated upstream
        upstream: UpstreamKey,
        /// The configured bound
        max_pending: usize,
    },

    /// The task panicked or its runtime shut down before it finished
    #[error("Task for upstream `{upstream}` did not complete")]
    TaskAborted {
        /// The upstream the task was submitted to
        upstream: UpstreamKey,
        /// The reason reported by the runtime
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Outcome of [`Broker::submit`](crate::upstream::Broker::submit) when the
/// result is not a success
#[derive(Error, Debug)]
pub enum SubmitError<E> {
    /// The broker could not run the task
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The task ran and failed. The error is passed through unmodified.
    #[error(transparent)]
    Task(E),
}

impl<E: Throttling> SubmitError<E> {
    /// The throttling signal of a failed task, if any
    pub fn throttled(&self) -> Option<Throttled> {
        match self {
            SubmitError::Task(e) => e.throttled(),
            SubmitError::Broker(_) => None,
        }
    }
}

/// Failure of a call to a provider made by the
/// [`ProviderClient`](crate::upstream::ProviderClient)
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The provider answered 429 Too Many Requests
    #[error("Provider rate limit reached")]
    RateLimited {
        /// Delay parsed from the `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// The provider answered with a non-success status other than 429
    #[error("Provider responded with status {0}")]
    Status(StatusCode),

    /// The request could not be sent or timed out
    #[error("Request to provider failed")]
    Network(#[source] reqwest::Error),

    /// The response body could not be read
    #[error("Cannot read provider response body")]
    Body(#[source] reqwest::Error),
}

impl Throttling for UpstreamError {
    fn throttled(&self) -> Option<Throttled> {
        match self {
            UpstreamError::RateLimited { retry_after } => Some(Throttled {
                retry_after: *retry_after,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rate_limited_is_throttled() {
        let limited = UpstreamError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            limited.throttled(),
            Some(Throttled {
                retry_after: Some(Duration::from_secs(2))
            })
        );
        assert_eq!(
            UpstreamError::Status(StatusCode::BAD_GATEWAY).throttled(),
            None
        );
    }

    #[test]
    fn test_submit_error_delegates_throttled() {
        let error: SubmitError<UpstreamError> =
            SubmitError::Task(UpstreamError::RateLimited { retry_after: None });
        assert_eq!(error.throttled(), Some(Throttled::default()));

        let error: SubmitError<UpstreamError> =
            BrokerError::UnknownUpstream(UpstreamKey::from("fide")).into();
        assert_eq!(error.throttled(), None);
        assert_eq!(error.to_string(), "No upstream named `fide` is configured");
    }
}
