//! `gambit` serves chess statistics from Lichess, Chess.com and other
//! providers through one mediation layer: responses are cached, clients are
//! rate limited, and outbound calls are queued per provider so that the
//! providers' own limits are respected.
//!
//! Start it with a configuration file:
//!
//! ```sh
//! gambit --config gambit.toml
//! ```
//!
//! Print the configuration it would run with:
//!
//! ```sh
//! gambit --dump-config
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

use anyhow::{Context, Result};
use clap::crate_version;
use gambit_lib::Mediator;
use log::{error, info};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

mod logging;
mod options;
mod server;
mod verbosity;

use logging::init_logging;
use options::GambitOptions;

/// Exit codes of the `gambit` binary
#[derive(Debug, Clone, Copy)]
#[repr(i32)]
enum ExitCode {
    Success = 0,
    UnexpectedFailure = 1,
    ConfigFile = 3,
}

fn main() -> Result<()> {
    // std::process::exit skips destructors, so all work happens in run_main
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

fn run_main() -> Result<i32> {
    let opts = match GambitOptions::load() {
        Ok(opts) => opts,
        Err(e) => {
            // Logging is not set up yet
            eprintln!("Error while loading config: {e:#}");
            return Ok(ExitCode::ConfigFile as i32);
        }
    };
    init_logging(&opts.config.verbose);

    if opts.dump_config {
        let toml = toml::to_string_pretty(&opts.config).context("Cannot serialize configuration")?;
        print!("{toml}");
        return Ok(ExitCode::Success as i32);
    }

    if let Err(e) = opts.config.mediator.validate() {
        error!("{e}");
        return Ok(ExitCode::ConfigFile as i32);
    }
    if opts.config.stats_reset_interval.is_zero() || opts.config.upstream_deadline.is_zero() {
        error!("stats_reset_interval and upstream_deadline must not be zero");
        return Ok(ExitCode::ConfigFile as i32);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(run(&opts)) {
        Ok(()) => Ok(ExitCode::Success as i32),
        Err(e) => {
            error!("{e:#}");
            Ok(ExitCode::UnexpectedFailure as i32)
        }
    }
}

async fn run(opts: &GambitOptions) -> Result<()> {
    let config = &opts.config;
    let mediator = Mediator::from_config(&config.mediator)
        .await
        .context("Cannot set up the mediation layer")?;

    let maintenance = mediator.spawn_maintenance(config.mediator.maintenance_interval);
    let resets = spawn_stats_reset(&mediator, config.stats_reset_interval);
    let app = server::router(mediator, &config.api_policy, config.upstream_deadline)?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Cannot listen on {}", config.listen))?;
    info!(
        "gambit {} listening on {}",
        crate_version!(),
        listener.local_addr()?
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    maintenance.abort();
    resets.abort();
    info!("Shut down");
    Ok(())
}

/// Zero the statistics counters every `interval`
fn spawn_stats_reset(mediator: &Mediator, interval: Duration) -> JoinHandle<()> {
    let stats = mediator.stats().clone();
    let mut ticks = interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            ticks.tick().await;
            stats.reset();
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
