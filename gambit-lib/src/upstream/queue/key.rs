use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of an upstream provider, e.g. `lichess` or `chess.com`.
///
/// Names are compared case-insensitively, so `Lichess` and `lichess`
/// address the same queue.
///
/// # Examples
///
/// ```
/// use gambit_lib::upstream::UpstreamKey;
///
/// let key = UpstreamKey::from("Chess.com");
/// assert_eq!(key.as_str(), "chess.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct UpstreamKey(String);

impl UpstreamKey {
    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the name as an owned String
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UpstreamKey {
    fn from(name: String) -> Self {
        UpstreamKey(name.to_lowercase())
    }
}

impl From<&str> for UpstreamKey {
    fn from(name: &str) -> Self {
        UpstreamKey(name.to_lowercase())
    }
}
