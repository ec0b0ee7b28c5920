//! `gambit-lib` is the upstream mediation layer of a chess statistics
//! dashboard. It sits between inbound client requests and the external chess
//! data providers and offers
//!
//! - a response [`cache`] with a per-route TTL policy and wildcard invalidation,
//! - an [`upstream`] broker running provider calls through bounded,
//!   interval-capped FIFO queues that pause themselves when throttled,
//! - inbound per-client rate [`limiter`]s with progressive lockout,
//! - a statistics aggregator ([`stats`]) all of the above report into.
//!
//! Everything is wired together by the [`Mediator`], built once from a
//! [`MediatorConfig`](config::MediatorConfig):
//!
//! ```
//! use gambit_lib::{Mediator, Result};
//! use gambit_lib::config::MediatorConfig;
//! use gambit_lib::upstream::UpstreamError;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = MediatorConfig::from_toml(r#"
//!         [upstreams.lichess]
//!         max_concurrent = 4
//!         interval = "1s"
//!         interval_cap = 8
//!     "#)?;
//!     let mediator = Mediator::from_config(&config).await?;
//!
//!     let games = mediator
//!         .broker()
//!         .submit("lichess", async { Ok::<_, UpstreamError>(vec!["e4 e5"]) })
//!         .await;
//!     assert_eq!(games.unwrap().len(), 1);
//!     assert_eq!(mediator.snapshot().upstreams["lichess"].succeeded, 1);
//!     Ok(())
//! }
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod mediator;
mod types;

pub mod cache;
pub mod config;
pub mod limiter;
pub mod stats;
pub mod upstream;

pub use mediator::Mediator;
pub use types::{ClientId, ErrorKind, Result};
