//! Axum middleware memoizing successful GET responses.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use axum::{Router, middleware::from_fn_with_state, routing::get};
//! # use gambit_lib::cache::{CacheOptions, CacheState, MemoryBackend, ResponseCache, TtlPolicy, cache_response};
//! # use gambit_lib::stats::Aggregator;
//! let cache = ResponseCache::new(
//!     Arc::new(MemoryBackend::new()),
//!     TtlPolicy::default(),
//!     Arc::new(Aggregator::new()),
//! );
//! let state = CacheState::new(cache, CacheOptions::builder().build());
//! let app: Router = Router::new()
//!     .route("/api/players/{id}", get(|| async { "{}" }))
//!     .layer(from_fn_with_state(state, cache_response));
//! ```

use axum::body::{Body, HttpBody, to_bytes};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use typed_builder::TypedBuilder;

use super::{CacheKey, CachedResponse, ResponseCache};

/// Response header telling whether the response came from the cache
pub const X_CACHE: &str = "x-cache";

/// Default upper bound for bodies buffered to be stored (2 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Decides per request whether the cache applies
pub type CachePredicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Options of the caching middleware
#[derive(Clone, TypedBuilder)]
pub struct CacheOptions {
    /// Path prefixes that are never cached
    #[builder(default, setter(into))]
    pub excluded_paths: Vec<String>,

    /// TTL used for every stored response instead of the [`TtlPolicy`](super::TtlPolicy)
    #[builder(default, setter(strip_option))]
    pub ttl: Option<Duration>,

    /// Requests for which this returns `false` bypass the cache
    #[builder(default, setter(strip_option))]
    pub predicate: Option<CachePredicate>,

    /// Responses with a larger (or unknown) body size are passed through
    #[builder(default = DEFAULT_MAX_BODY_SIZE)]
    pub max_body_size: usize,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("excluded_paths", &self.excluded_paths)
            .field("ttl", &self.ttl)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("max_body_size", &self.max_body_size)
            .finish()
    }
}

impl CacheOptions {
    fn applies_to(&self, request: &Request) -> bool {
        if request.method() != Method::GET {
            return false;
        }
        let path = request.uri().path();
        if self
            .excluded_paths
            .iter()
            .any(|excluded| path.starts_with(excluded.as_str()))
        {
            return false;
        }
        self.predicate
            .as_ref()
            .is_none_or(|predicate| predicate(request))
    }
}

/// State handed to [`cache_response`] via `from_fn_with_state`
#[derive(Debug, Clone)]
pub struct CacheState {
    cache: ResponseCache,
    options: Arc<CacheOptions>,
}

impl CacheState {
    /// Bundle a cache with its middleware options
    #[must_use]
    pub fn new(cache: ResponseCache, options: CacheOptions) -> Self {
        Self {
            cache,
            options: Arc::new(options),
        }
    }
}

/// Serve GET requests from the cache and store successful responses.
///
/// A hit replays the stored body with `X-Cache: HIT` without running the
/// handler. A miss runs the handler, marks the response `X-Cache: MISS` and,
/// if the status is 200, stores the body in a background task.
pub async fn cache_response(
    State(state): State<CacheState>,
    request: Request,
    next: Next,
) -> Response {
    let CacheState { cache, options } = state;
    if !options.applies_to(&request) {
        return next.run(request).await;
    }

    let key = CacheKey::for_request(&request);
    if let Some(cached) = cache.get(&key).await {
        return replay(cached);
    }

    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return mark(response, "MISS");
    }

    let fits = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= options.max_body_size as u64);
    if !fits {
        log::debug!("Not caching {key}: body size unknown or above limit");
        return mark(response, "MISS");
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, options.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => return unbuffered(&key, &e),
    };

    match std::str::from_utf8(&bytes) {
        Ok(text) => {
            let content_type = parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string);
            let cached = CachedResponse::ok(content_type, text);
            let ttl = options.ttl;
            tokio::spawn(async move {
                match ttl {
                    Some(ttl) => cache.set(&key, &cached, ttl).await,
                    None => cache.set_for_path(&key, &path, &cached).await,
                };
            });
        }
        Err(_) => log::debug!("Not caching {key}: body is not UTF-8"),
    }

    mark(Response::from_parts(parts, Body::from(bytes)), "MISS")
}

/// The handler's body broke off while it was being buffered. Its headers are
/// already gone, so all that is left is an error.
fn unbuffered(key: &CacheKey, error: &axum::Error) -> Response {
    log::warn!("Failed to buffer response for {key}, answering 500: {error}");
    mark(StatusCode::INTERNAL_SERVER_ERROR.into_response(), "MISS")
}

fn replay(cached: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = StatusCode::OK;
    if let Some(content_type) = cached
        .content_type
        .and_then(|value| HeaderValue::from_str(&value).ok())
    {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    mark(response, "HIT")
}

fn mark(mut response: Response, value: &'static str) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(value));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, TtlPolicy};
    use crate::stats::Aggregator;
    use axum::Router;
    use axum::middleware::from_fn_with_state;
    use axum::routing::{get, post};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        calls: Arc<AtomicUsize>,
        backend: Arc<MemoryBackend>,
        stats: Arc<Aggregator>,
    }

    fn fixture(options: CacheOptions) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(MemoryBackend::new());
        let stats = Arc::new(Aggregator::new());
        let cache = ResponseCache::new(backend.clone(), TtlPolicy::default(), stats.clone());

        let counting = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    axum::Json(serde_json::json!({ "call": n }))
                }
            }
        };

        let app = Router::new()
            .route("/api/players/{id}", get(counting.clone()))
            .route("/api/admin/health", get(counting.clone()))
            .route("/api/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/api/games", post(counting))
            .layer(from_fn_with_state(
                CacheState::new(cache, options),
                cache_response,
            ));

        Fixture {
            app,
            calls,
            backend,
            stats,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_buffering_failure_is_marked_as_miss() {
        let key = CacheKey::new(&Method::GET, "/api/players/42");
        let error = axum::Error::new(std::io::Error::other("connection reset"));
        let response = unbuffered(&key, &error);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[X_CACHE], "MISS");
    }

    async fn wait_for_records(backend: &MemoryBackend, n: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.len() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_second_get_is_served_from_cache() {
        let f = fixture(CacheOptions::builder().build());

        let first = send(&f.app, Method::GET, "/api/players/42").await;
        assert_eq!(first.headers()[X_CACHE], "MISS");
        let first_body = body_string(first).await;
        wait_for_records(&f.backend, 1).await;

        let second = send(&f.app, Method::GET, "/api/players/42").await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[X_CACHE], "HIT");
        assert_eq!(second.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(body_string(second).await, first_body);

        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        let snapshot = f.stats.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.writes, 1);
    }

    #[tokio::test]
    async fn test_query_string_is_part_of_key() {
        let f = fixture(CacheOptions::builder().build());

        send(&f.app, Method::GET, "/api/players/42?perf=blitz").await;
        wait_for_records(&f.backend, 1).await;
        let other = send(&f.app, Method::GET, "/api/players/42?perf=rapid").await;

        assert_eq!(other.headers()[X_CACHE], "MISS");
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_200_is_not_stored() {
        let f = fixture(CacheOptions::builder().build());

        let response = send(&f.app, Method::GET, "/api/missing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[X_CACHE], "MISS");
        tokio::task::yield_now().await;
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn test_only_get_is_cached() {
        let f = fixture(CacheOptions::builder().build());

        let response = send(&f.app, Method::POST, "/api/games").await;
        assert!(response.headers().get(X_CACHE).is_none());
        send(&f.app, Method::POST, "/api/games").await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_excluded_paths_and_predicate_bypass_cache() {
        let predicate: CachePredicate =
            Arc::new(|request: &Request| request.headers().get("authorization").is_none());
        let f = fixture(
            CacheOptions::builder()
                .excluded_paths(vec!["/api/admin".to_string()])
                .predicate(predicate)
                .build(),
        );

        let response = send(&f.app, Method::GET, "/api/admin/health").await;
        assert!(response.headers().get(X_CACHE).is_none());

        let request = Request::get("/api/players/1")
            .header("authorization", "Bearer x")
            .body(Body::empty())
            .unwrap();
        let response = f.app.clone().oneshot(request).await.unwrap();
        assert!(response.headers().get(X_CACHE).is_none());

        tokio::task::yield_now().await;
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_passes_through() {
        let f = fixture(CacheOptions::builder().max_body_size(4).build());

        let response = send(&f.app, Method::GET, "/api/players/42").await;
        assert_eq!(response.headers()[X_CACHE], "MISS");
        assert_eq!(body_string(response).await, r#"{"call":0}"#);
        tokio::task::yield_now().await;
        assert!(f.backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_policy_ttl_without_override() {
        let f = fixture(CacheOptions::builder().build());

        send(&f.app, Method::GET, "/api/players/42").await;
        wait_for_records(&f.backend, 1).await;
        tokio::time::advance(Duration::from_secs(299)).await;
        let response = send(&f.app, Method::GET, "/api/players/42").await;
        assert_eq!(response.headers()[X_CACHE], "HIT");

        tokio::time::advance(Duration::from_secs(1)).await;
        let response = send(&f.app, Method::GET, "/api/players/42").await;
        assert_eq!(response.headers()[X_CACHE], "MISS");
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_override() {
        let f = fixture(CacheOptions::builder().ttl(Duration::from_secs(1)).build());

        send(&f.app, Method::GET, "/api/players/42").await;
        wait_for_records(&f.backend, 1).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let response = send(&f.app, Method::GET, "/api/players/42").await;
        assert_eq!(response.headers()[X_CACHE], "MISS");
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }
}
