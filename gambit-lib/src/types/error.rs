use std::path::PathBuf;
use thiserror::Error;

/// Possible errors when setting up or operating the mediation layer
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The configuration file could not be read
    #[error("Cannot read configuration file `{}`", .0.display())]
    ReadConfig(PathBuf, #[source] std::io::Error),

    /// The configuration file is not valid TOML or does not match the schema
    #[error("Cannot parse configuration: {0}")]
    ParseConfig(#[from] toml::de::Error),

    /// The configuration parsed, but describes an impossible setup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The given wildcard pattern is not valid
    #[error("Wildcard pattern is invalid: {0}")]
    InvalidGlobPattern(#[from] glob::PatternError),

    /// A cache backend operation failed
    #[error("Cache backend failure: {0}")]
    CacheBackend(String),

    /// The networked cache backend reported an error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A cached response could not be encoded or decoded
    #[error("Cannot (de)serialize cached response")]
    CacheSerialization(#[from] serde_json::Error),

    /// The HTTP client for a provider could not be created
    #[error("Failed to build HTTP client for provider `{0}`")]
    BuildProviderClient(String, #[source] reqwest::Error),

    /// A provider base URL could not be parsed or joined
    #[error("Invalid provider URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A requested path would leave the provider's base URL
    #[error("Path `{0}` does not stay below the provider base URL")]
    PathOutsideBase(String),
}

impl ErrorKind {
    /// Shorthand for an [`ErrorKind::InvalidConfig`]
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
