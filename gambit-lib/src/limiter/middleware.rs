//! Axum middleware applying a [`RateLimiter`] to inbound requests.

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::{HeaderValue, RETRY_AFTER};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{Decision, RateLimiter, ceil_secs};
use crate::ClientId;

/// Response header carrying the request limit of the policy
pub const RATELIMIT_LIMIT: &str = "ratelimit-limit";

/// Response header carrying the requests left in the current window
pub const RATELIMIT_REMAINING: &str = "ratelimit-remaining";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    error: &'static str,
    message: String,
    retry_after: u64,
}

/// Resolve the client a request is accounted to: a [`ClientId`] extension
/// inserted by an earlier layer, else the peer address, else
/// [`ClientId::UNKNOWN`].
#[must_use]
pub fn client_id(request: &Request) -> ClientId {
    if let Some(id) = request.extensions().get::<ClientId>() {
        return id.clone();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(ClientId::unknown, |ConnectInfo(addr)| ClientId::from(*addr))
}

/// Reject requests over the limit with `429 Too Many Requests`.
///
/// Use with `axum::middleware::from_fn_with_state`. Admitted responses get
/// `RateLimit-Limit` and `RateLimit-Remaining` headers.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(&request);
    match limiter.evaluate(&client) {
        Decision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(
                RATELIMIT_LIMIT,
                HeaderValue::from(limiter.policy().max_requests),
            );
            headers.insert(RATELIMIT_REMAINING, HeaderValue::from(remaining));
            response
        }
        Decision::Rejected { retry_after } => rejection_response(retry_after),
    }
}

/// The `429` sent to a client over its limit
#[must_use]
pub fn rejection_response(retry_after: Duration) -> Response {
    too_many_requests(
        "Too many requests",
        "Rate limit exceeded, please slow down".to_string(),
        retry_after,
    )
}

/// The `429` sent while an identifier is locked out
#[must_use]
pub fn lockout_response(remaining: Duration) -> Response {
    too_many_requests(
        "Too many failed attempts",
        format!(
            "Locked out, try again in {} seconds",
            ceil_secs(remaining)
        ),
        remaining,
    )
}

fn too_many_requests(error: &'static str, message: String, retry: Duration) -> Response {
    let retry_after = ceil_secs(retry);
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    let body = RejectionBody {
        error,
        message,
        retry_after,
    };
    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LimiterPolicy;
    use crate::stats::Aggregator;
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app(max_requests: u32) -> Router {
        let limiter = RateLimiter::new(
            "api",
            LimiterPolicy::new(Duration::from_millis(1000), max_requests),
            Arc::new(Aggregator::new()),
        )
        .unwrap();
        Router::new()
            .route("/api/players/42", get(|| async { "{}" }))
            .layer(from_fn_with_state(Arc::new(limiter), rate_limit))
    }

    fn request(client: &str) -> Request {
        let mut request = Request::builder()
            .uri("/api/players/42")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ClientId::from(client));
        request
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_requests_carry_limit_headers() {
        let app = app(3);
        let response = app.oneshot(request("magnus")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RATELIMIT_LIMIT], "3");
        assert_eq!(response.headers()[RATELIMIT_REMAINING], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_structured() {
        let app = app(1);
        let first = app.clone().oneshot(request("magnus")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let rejected = app.clone().oneshot(request("magnus")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.headers()[RETRY_AFTER], "1");

        let body = to_bytes(rejected.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({
                "error": "Too many requests",
                "message": "Rate limit exceeded, please slow down",
                "retryAfter": 1,
            })
        );

        // Another client is not affected
        let other = app.oneshot(request("hikaru")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[test]
    fn test_client_id_resolution() {
        let with_extension = request("magnus");
        assert_eq!(client_id(&with_extension), ClientId::from("magnus"));

        let mut with_peer = Request::new(Body::empty());
        with_peer
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 7], 51000))));
        assert_eq!(client_id(&with_peer), ClientId::from("203.0.113.7"));

        assert_eq!(client_id(&Request::new(Body::empty())), ClientId::unknown());
    }

    #[tokio::test]
    async fn test_lockout_response() {
        let response = lockout_response(Duration::from_millis(29_500));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "30");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["retryAfter"], 30);
        assert_eq!(body["message"], "Locked out, try again in 30 seconds");
    }
}
