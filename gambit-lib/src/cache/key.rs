use std::fmt;

use http::{Method, Request, request::Parts};

/// Namespace shared by every key the response cache writes
pub const KEY_NAMESPACE: &str = "cache";

/// Key of a cached response: `cache:<METHOD>:<path+query>`.
///
/// The path and query are taken verbatim. Requests that only differ in the
/// order of their query parameters therefore map to different keys.
///
/// # Examples
///
/// ```
/// use gambit_lib::cache::CacheKey;
/// use http::Method;
///
/// let key = CacheKey::new(&Method::GET, "/api/players/42?perf=blitz");
/// assert_eq!(key.as_str(), "cache:GET:/api/players/42?perf=blitz");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for a method and a path that may include a query string
    #[must_use]
    pub fn new(method: &Method, path_and_query: &str) -> Self {
        CacheKey(format!("{KEY_NAMESPACE}:{method}:{path_and_query}"))
    }

    /// Build the key for an incoming request
    #[must_use]
    pub fn for_request<B>(request: &Request<B>) -> Self {
        Self::from_uri(request.method(), request.uri())
    }

    /// Build the key from already split request parts
    #[must_use]
    pub fn for_parts(parts: &Parts) -> Self {
        Self::from_uri(&parts.method, &parts.uri)
    }

    fn from_uri(method: &Method, uri: &http::Uri) -> Self {
        let path_and_query = uri
            .path_and_query()
            .map_or_else(|| uri.path(), http::uri::PathAndQuery::as_str);
        Self::new(method, path_and_query)
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_request_includes_query() {
        let request = Request::get("/api/games/123?moves=true").body(()).unwrap();
        assert_eq!(
            CacheKey::for_request(&request).as_str(),
            "cache:GET:/api/games/123?moves=true"
        );
    }

    #[test]
    fn test_key_without_query() {
        let request = Request::get("/api/openings/popular").body(()).unwrap();
        assert_eq!(
            CacheKey::for_request(&request).as_str(),
            "cache:GET:/api/openings/popular"
        );
    }

    #[test]
    fn test_query_order_is_significant() {
        let a = CacheKey::new(&Method::GET, "/api/search?q=carlsen&page=2");
        let b = CacheKey::new(&Method::GET, "/api/search?page=2&q=carlsen");
        assert_ne!(a, b);
    }

    #[test]
    fn test_method_is_part_of_key() {
        let get = CacheKey::new(&Method::GET, "/api/stats");
        let head = CacheKey::new(&Method::HEAD, "/api/stats");
        assert_ne!(get, head);
        assert_eq!(head.to_string(), "cache:HEAD:/api/stats");
    }
}
