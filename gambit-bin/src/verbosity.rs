//! `-v`/`-q` flags controlling how much the server logs.
//!
//! Without flags the server logs at `info`. Each `-v` raises the level by
//! one step up to `trace`, each `-q` lowers it down to `error`.

use log::LevelFilter;
use serde::Deserialize;
use std::fmt;

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];

/// Index of [`LevelFilter::Info`] in [`LEVELS`]
const DEFAULT_LEVEL: usize = 2;

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Verbosity {
    /// More log output per occurrence (`-vv` for trace)
    #[arg(
        long,
        short = 'v',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "quiet"
    )]
    verbose: u8,

    /// Less log output per occurrence (`-qq` for errors only)
    #[arg(
        long,
        short = 'q',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "verbose"
    )]
    quiet: u8,
}

impl Verbosity {
    /// The level our own crates log at
    pub(crate) fn log_level_filter(&self) -> LevelFilter {
        let index = (DEFAULT_LEVEL + usize::from(self.verbose))
            .saturating_sub(usize::from(self.quiet))
            .min(LEVELS.len() - 1);
        LEVELS[index]
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_level(level: LevelFilter) -> Self {
        let index = LEVELS
            .iter()
            .position(|candidate| *candidate == level)
            .unwrap_or(DEFAULT_LEVEL);
        if index >= DEFAULT_LEVEL {
            Self {
                verbose: (index - DEFAULT_LEVEL) as u8,
                quiet: 0,
            }
        } else {
            Self {
                verbose: 0,
                quiet: (DEFAULT_LEVEL - index) as u8,
            }
        }
    }
}

/// Deserialized from a level name such as `"debug"` or `"Warning"`
impl<'de> Deserialize<'de> for Verbosity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        let level = match name.to_lowercase().as_str() {
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "invalid log level `{other}`"
                )));
            }
        };
        Ok(Self::from_level(level))
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.log_level_filter())
    }
}
