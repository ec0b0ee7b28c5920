//! Per-provider request brokering with concurrency and interval caps.
//!
//! Every outbound call to a provider goes through that provider's queue,
//! which bounds how many calls run at once and how many start per interval.
//! When the provider signals that it is throttling us, the queue pauses
//! itself and resumes once the requested delay has passed.
//!
//! # Architecture
//!
//! - [`UpstreamKey`]: name of a provider queue
//! - [`UpstreamConfig`]: admission limits and provider connection settings
//! - [`UpstreamQueue`]: FIFO admission, pause state and task statistics of one provider
//! - [`Broker`]: routes submissions to the queue of their upstream
//! - [`ProviderClient`]: builds reqwest tasks that report throttling via [`UpstreamError`]
//! - [`UpstreamStats`]: outcome and latency statistics per queue

mod broker;
mod config;
mod error;
mod headers;
mod provider;
mod queue;
mod window;

pub use broker::Broker;
pub use config::{DEFAULT_USER_AGENT, UpstreamConfig, UpstreamConfigs};
pub use error::{BrokerError, SubmitError, Throttled, Throttling, UpstreamError};
pub use provider::{ProviderClient, ProviderResponse};
pub use queue::{QueueState, UpstreamKey, UpstreamQueue, UpstreamStats, UpstreamStatsMap};
pub use window::Window;
