use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

use crate::{ErrorKind, Result};

/// Kind of data behind a route, used to pick how long responses stay cached
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    /// Player profiles and ratings
    Player,
    /// Individual games and game lists
    Games,
    /// Aggregated statistics
    Stats,
    /// Opening explorer data
    Openings,
    /// Tournament standings and pairings
    Tournaments,
    /// Search results
    Search,
    /// Anything not matched by a route rule
    Default,
}

// Macro for generating default functions to be used by serde
macro_rules! default_ttl {
    ( $( $name:ident = $secs:expr; )* ) => {
        $(
            const fn $name() -> Duration {
                Duration::from_secs($secs)
            }
        )*
    };
}

default_ttl! {
    default_player_ttl = 300;
    default_games_ttl = 600;
    default_stats_ttl = 900;
    default_openings_ttl = 3600;
    default_tournaments_ttl = 1800;
    default_search_ttl = 120;
    default_default_ttl = 300;
}

/// TTL per [`Category`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryTtls {
    /// TTL for [`Category::Player`]
    #[serde(default = "default_player_ttl", with = "humantime_serde")]
    pub player: Duration,
    /// TTL for [`Category::Games`]
    #[serde(default = "default_games_ttl", with = "humantime_serde")]
    pub games: Duration,
    /// TTL for [`Category::Stats`]
    #[serde(default = "default_stats_ttl", with = "humantime_serde")]
    pub stats: Duration,
    /// TTL for [`Category::Openings`]
    #[serde(default = "default_openings_ttl", with = "humantime_serde")]
    pub openings: Duration,
    /// TTL for [`Category::Tournaments`]
    #[serde(default = "default_tournaments_ttl", with = "humantime_serde")]
    pub tournaments: Duration,
    /// TTL for [`Category::Search`]
    #[serde(default = "default_search_ttl", with = "humantime_serde")]
    pub search: Duration,
    /// TTL for [`Category::Default`]
    #[serde(default = "default_default_ttl", with = "humantime_serde")]
    pub default: Duration,
}

impl Default for CategoryTtls {
    fn default() -> Self {
        Self {
            player: default_player_ttl(),
            games: default_games_ttl(),
            stats: default_stats_ttl(),
            openings: default_openings_ttl(),
            tournaments: default_tournaments_ttl(),
            search: default_search_ttl(),
            default: default_default_ttl(),
        }
    }
}

impl CategoryTtls {
    /// TTL configured for `category`
    #[must_use]
    pub const fn get(&self, category: Category) -> Duration {
        match category {
            Category::Player => self.player,
            Category::Games => self.games,
            Category::Stats => self.stats,
            Category::Openings => self.openings,
            Category::Tournaments => self.tournaments,
            Category::Search => self.search,
            Category::Default => self.default,
        }
    }
}

/// Maps a path prefix onto a [`Category`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRule {
    /// Path prefix, matched on segment boundaries
    pub prefix: String,
    /// Category of everything below `prefix`
    pub category: Category,
}

impl RouteRule {
    /// Create a new rule
    #[must_use]
    pub fn new(prefix: impl Into<String>, category: Category) -> Self {
        Self {
            prefix: prefix.into(),
            category,
        }
    }

    /// `/api/players` matches `/api/players`, `/api/players/42` and
    /// `/api/players?id=42`, but not `/api/playersearch`.
    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    }
}

/// The route rules used unless configured otherwise
#[must_use]
pub fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/api/players", Category::Player),
        RouteRule::new("/api/games", Category::Games),
        RouteRule::new("/api/stats", Category::Stats),
        RouteRule::new("/api/openings", Category::Openings),
        RouteRule::new("/api/tournaments", Category::Tournaments),
        RouteRule::new("/api/search", Category::Search),
    ]
}

/// Resolves the TTL of a response from its request path.
///
/// The longest matching route prefix wins; paths no rule matches fall into
/// [`Category::Default`].
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    ttls: CategoryTtls,
    routes: Vec<RouteRule>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            ttls: CategoryTtls::default(),
            routes: default_routes(),
        }
    }
}

impl TtlPolicy {
    /// Create a policy from explicit TTLs and route rules
    ///
    /// # Errors
    ///
    /// Returns an error if any category TTL is zero, since a record that
    /// expires on insertion can never be served.
    pub fn new(ttls: CategoryTtls, routes: Vec<RouteRule>) -> Result<Self> {
        for category in <Category as strum::IntoEnumIterator>::iter() {
            if ttls.get(category).is_zero() {
                return Err(ErrorKind::invalid_config(format!(
                    "TTL for category `{category}` must be greater than zero"
                )));
            }
        }
        Ok(Self { ttls, routes })
    }

    /// Category of the most specific route rule matching `path`
    #[must_use]
    pub fn category(&self, path: &str) -> Category {
        self.routes
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.prefix.trim_end_matches('/').len())
            .map_or(Category::Default, |rule| rule.category)
    }

    /// TTL for a response to `path`
    #[must_use]
    pub fn resolve(&self, path: &str) -> Duration {
        self.ttls.get(self.category(path))
    }

    /// The configured TTLs
    #[must_use]
    pub const fn ttls(&self) -> &CategoryTtls {
        &self.ttls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/api/players/42", Category::Player)]
    #[case("/api/players", Category::Player)]
    #[case("/api/players?username=hikaru", Category::Player)]
    #[case("/api/openings/popular", Category::Openings)]
    #[case("/api/games/123", Category::Games)]
    #[case("/api/tournaments/arena/abc", Category::Tournaments)]
    #[case("/api/search?q=caro-kann", Category::Search)]
    #[case("/api/playersearch", Category::Default)]
    #[case("/health", Category::Default)]
    fn test_default_categories(#[case] path: &str, #[case] category: Category) {
        assert_eq!(TtlPolicy::default().category(path), category);
    }

    #[test]
    fn test_categories_resolve_to_distinct_configurable_ttls() {
        let ttls = CategoryTtls {
            player: Duration::from_secs(60),
            openings: Duration::from_secs(7200),
            ..CategoryTtls::default()
        };
        let policy = TtlPolicy::new(ttls, default_routes()).unwrap();

        assert_eq!(
            policy.resolve("/api/openings/popular"),
            Duration::from_secs(7200)
        );
        assert_eq!(policy.resolve("/api/players/42"), Duration::from_secs(60));
        assert_eq!(policy.resolve("/elsewhere"), default_default_ttl());
        assert_ne!(policy.resolve("/api/players/42"), policy.resolve("/elsewhere"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut routes = default_routes();
        routes.push(RouteRule::new("/api/players/top/", Category::Stats));
        let policy = TtlPolicy::new(CategoryTtls::default(), routes).unwrap();

        assert_eq!(policy.category("/api/players/top/blitz"), Category::Stats);
        assert_eq!(policy.category("/api/players/topaz"), Category::Player);
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let ttls = CategoryTtls {
            search: Duration::ZERO,
            ..CategoryTtls::default()
        };
        assert!(TtlPolicy::new(ttls, default_routes()).is_err());
    }

    #[test]
    fn test_deserialize_ttls_with_defaults() {
        let ttls: CategoryTtls = toml::from_str(r#"openings = "2h""#).unwrap();
        assert_eq!(ttls.openings, Duration::from_secs(7200));
        assert_eq!(ttls.player, default_player_ttl());
    }
}
