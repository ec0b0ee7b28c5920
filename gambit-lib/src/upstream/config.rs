use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::upstream::UpstreamKey;
use crate::{ErrorKind, Result};

/// Default number of tasks in flight per upstream
const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Default width of the rolling admission window
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of task starts per admission window
const DEFAULT_INTERVAL_CAP: usize = 2;

/// Default pause after a throttling failure without a `Retry-After` hint
const DEFAULT_RESUME_DELAY: Duration = Duration::from_secs(60);

/// Default timeout for a single provider request
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default `User-Agent` sent to providers
pub const DEFAULT_USER_AGENT: &str = concat!("gambit/", env!("CARGO_PKG_VERSION"));

const fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

const fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

const fn default_interval_cap() -> usize {
    DEFAULT_INTERVAL_CAP
}

const fn default_resume_delay() -> Duration {
    DEFAULT_RESUME_DELAY
}

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

/// Configuration per upstream name
pub type UpstreamConfigs = HashMap<UpstreamKey, UpstreamConfig>;

/// Admission limits of one upstream queue and how to reach the provider
/// behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Maximum number of tasks in flight at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Width of the rolling window in which at most `interval_cap` tasks start
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum number of task starts within one `interval`
    #[serde(default = "default_interval_cap")]
    pub interval_cap: usize,

    /// Pause applied when the provider throttles without saying for how long
    #[serde(default = "default_resume_delay", with = "humantime_serde")]
    pub default_resume_delay: Duration,

    /// Maximum number of tasks waiting for admission; unbounded if unset
    #[serde(default)]
    pub max_pending: Option<usize>,

    /// Base URL of the provider. Without it the upstream only runs tasks
    /// submitted by the host application.
    #[serde(default)]
    pub base_url: Option<Url>,

    /// Timeout of a single provider request
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// `User-Agent` sent to the provider
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra headers sent with every provider request
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_headers")]
    #[serde(serialize_with = "serialize_headers")]
    pub headers: HeaderMap,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            interval: DEFAULT_INTERVAL,
            interval_cap: DEFAULT_INTERVAL_CAP,
            default_resume_delay: DEFAULT_RESUME_DELAY,
            max_pending: None,
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: default_user_agent(),
            headers: HeaderMap::new(),
        }
    }
}

impl UpstreamConfig {
    /// Config with the given admission limits and defaults for everything else
    #[must_use]
    pub fn with_limits(max_concurrent: usize, interval: Duration, interval_cap: usize) -> Self {
        Self {
            max_concurrent,
            interval,
            interval_cap,
            ..Self::default()
        }
    }

    /// Check that the limits admit at least one task
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] naming the offending field
    pub fn validate(&self, upstream: &UpstreamKey) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(ErrorKind::invalid_config(format!(
                "upstream `{upstream}`: max_concurrent must be at least 1"
            )));
        }
        if self.interval_cap == 0 {
            return Err(ErrorKind::invalid_config(format!(
                "upstream `{upstream}`: interval_cap must be at least 1"
            )));
        }
        if self.interval.is_zero() {
            return Err(ErrorKind::invalid_config(format!(
                "upstream `{upstream}`: interval must not be zero"
            )));
        }
        if self.max_pending == Some(0) {
            return Err(ErrorKind::invalid_config(format!(
                "upstream `{upstream}`: max_pending must be at least 1 when set"
            )));
        }
        Ok(())
    }
}

/// Custom deserializer for headers from TOML config format
fn deserialize_headers<'de, D>(deserializer: D) -> std::result::Result<HeaderMap, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let map = HashMap::<String, String>::deserialize(deserializer)?;
    let mut header_map = HeaderMap::new();

    for (name, value) in map {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("Invalid header name '{name}': {e}")))?;
        let header_value = HeaderValue::from_str(&value).map_err(|e| {
            serde::de::Error::custom(format!("Invalid header value '{value}': {e}"))
        })?;
        header_map.insert(header_name, header_value);
    }

    Ok(header_map)
}

/// Custom serializer for headers to TOML config format
fn serialize_headers<S>(headers: &HeaderMap, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let map: HashMap<String, String> = headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
        .collect();
    map.serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_table() {
        let config: UpstreamConfig = toml::from_str("").unwrap();
        assert_eq!(config, UpstreamConfig::default());
        assert_eq!(config.max_pending, None);
        assert_eq!(config.default_resume_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_upstream_table() {
        let configs: UpstreamConfigs = toml::from_str(
            r#"
            [Lichess]
            max_concurrent = 4
            interval = "500ms"
            interval_cap = 3
            default_resume_delay = "2m"
            max_pending = 100
            base_url = "https://lichess.org"

            [Lichess.headers]
            Authorization = "Bearer lip_token"
            "#,
        )
        .unwrap();

        let lichess = &configs[&UpstreamKey::from("lichess")];
        assert_eq!(lichess.max_concurrent, 4);
        assert_eq!(lichess.interval, Duration::from_millis(500));
        assert_eq!(lichess.interval_cap, 3);
        assert_eq!(lichess.default_resume_delay, Duration::from_secs(120));
        assert_eq!(lichess.max_pending, Some(100));
        assert_eq!(lichess.base_url.as_ref().unwrap().host_str(), Some("lichess.org"));
        assert_eq!(lichess.headers["authorization"], "Bearer lip_token");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result: std::result::Result<UpstreamConfig, _> = toml::from_str("concurrency = 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let key = UpstreamKey::from("lichess");
        assert!(UpstreamConfig::default().validate(&key).is_ok());
        assert!(
            UpstreamConfig::with_limits(0, DEFAULT_INTERVAL, 1)
                .validate(&key)
                .is_err()
        );
        assert!(
            UpstreamConfig::with_limits(1, DEFAULT_INTERVAL, 0)
                .validate(&key)
                .is_err()
        );
        assert!(
            UpstreamConfig::with_limits(1, Duration::ZERO, 1)
                .validate(&key)
                .is_err()
        );
        let zero_pending = UpstreamConfig {
            max_pending: Some(0),
            ..UpstreamConfig::default()
        };
        assert!(zero_pending.validate(&key).is_err());
    }
}
