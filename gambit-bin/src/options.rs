use anyhow::{Context, Result};
use clap::Parser;
use const_format::{concatcp, formatcp};
use gambit_lib::config::MediatorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::verbosity::Verbosity;

pub(crate) const GAMBIT_CONFIG_FILE: &str = "gambit.toml";

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_STATS_RESET_INTERVAL: &str = "1h";
const DEFAULT_UPSTREAM_DEADLINE: &str = "30s";
const DEFAULT_API_POLICY: &str = "api";

// clap wants `&str` defaults, serde owned values
const LISTEN_STR: &str = concatcp!("127.0.0.1:", DEFAULT_PORT);
const HELP_MSG_CONFIG_FILE: &str =
    formatcp!("Configuration file to use\n\n[default: {}]", GAMBIT_CONFIG_FILE);

/// Caching, rate limiting proxy in front of chess data providers
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct GambitOptions {
    #[arg(short, long = "config", env = "GAMBIT_CONFIG", help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub(crate) dump_config: bool,

    #[clap(flatten)]
    pub(crate) config: Config,
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
    listen: SocketAddr = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT));
    stats_reset_interval: Duration = Duration::from_secs(60 * 60);
    upstream_deadline: Duration = Duration::from_secs(30);
    api_policy: String = DEFAULT_API_POLICY.to_string();
}

// Take a value from the config file wherever the command line kept the default
macro_rules! fold_in {
    ($cli:ident , $toml:ident ; $ty:ident { $(..$ignore:ident,)* $( $key:ident : $default:expr, )* } ) => {
        if (false) {
            #[allow(dead_code, unused, clippy::diverging_sub_expression)]
            let _check_fold_in_exhaustivity = $ty {
                $($key: unreachable!(), )*
                $($ignore: unreachable!(), )*
            };
        };
        $(
            if $cli.$key == $default && $toml.$key != $default {
                $cli.$key = $toml.$key;
            }
        )*
    };
}

/// Settings given on the command line or in the configuration file.
///
/// Everything the mediation layer itself needs lives in the flattened
/// [`MediatorConfig`], which can only be set in the file.
#[derive(Parser, Debug, Deserialize, Serialize, Clone)]
pub(crate) struct Config {
    #[clap(flatten)]
    #[serde(default, skip_serializing)]
    pub(crate) verbose: Verbosity,

    /// Address to listen on
    #[arg(long, default_value = LISTEN_STR)]
    #[serde(default = "listen")]
    pub(crate) listen: SocketAddr,

    /// How often the statistics counters are reset
    #[arg(long, value_parser = humantime::parse_duration, default_value = DEFAULT_STATS_RESET_INTERVAL)]
    #[serde(default = "stats_reset_interval", with = "humantime_serde")]
    pub(crate) stats_reset_interval: Duration,

    /// How long a request waits for a provider before giving up with 504
    #[arg(long, value_parser = humantime::parse_duration, default_value = DEFAULT_UPSTREAM_DEADLINE)]
    #[serde(default = "upstream_deadline", with = "humantime_serde")]
    pub(crate) upstream_deadline: Duration,

    /// Limiter policy applied to the provider routes
    #[arg(long, default_value = DEFAULT_API_POLICY)]
    #[serde(default = "api_policy")]
    pub(crate) api_policy: String,

    #[arg(skip)]
    #[serde(flatten)]
    pub(crate) mediator: MediatorConfig,
}

impl Config {
    /// Load configuration from a file
    pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Cannot read `{}`", path.display()))?;
        toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
    }

    /// Merge the configuration from TOML into the CLI configuration
    pub(crate) fn merge(&mut self, toml: Config) {
        // The mediation layer is only configurable in TOML
        self.mediator = toml.mediator;

        fold_in! {
            self, toml;

            Config {
                ..mediator,

                verbose: Verbosity::default(),
                listen: listen(),
                stats_reset_interval: stats_reset_interval(),
                upstream_deadline: upstream_deadline(),
                api_policy: api_policy(),
            }
        }
    }
}

impl GambitOptions {
    /// Parse the command line and merge the configuration file into it.
    ///
    /// An explicitly given file must exist. `gambit.toml` in the working
    /// directory is used if present.
    pub(crate) fn load() -> Result<Self> {
        let mut opts = Self::parse();
        let (path, explicit) = match &opts.config_file {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(GAMBIT_CONFIG_FILE), false),
        };
        if explicit || path.is_file() {
            let toml = Config::load_from_file(&path).with_context(|| {
                format!("Cannot load configuration file `{}`", path.display())
            })?;
            opts.config.merge(toml);
        }
        Ok(opts)
    }
}
