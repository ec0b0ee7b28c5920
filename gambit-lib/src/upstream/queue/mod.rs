#![allow(clippy::module_inception)]

mod key;
mod queue;
mod stats;

pub use key::UpstreamKey;
pub use queue::{QueueState, UpstreamQueue};
pub use stats::{UpstreamStats, UpstreamStatsMap};
