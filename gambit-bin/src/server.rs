//! HTTP surface of the proxy.
//!
//! - `GET /api/stats`: counters and queue state
//! - `GET /api/stats/upstreams`: task latency and outcomes per provider
//! - `DELETE /api/cache?pattern=<glob>`: drop cached responses
//! - `GET /api/{category}/{provider}/{*path}`: `path` fetched from `provider`
//!   through its queue, rate limited and cached. `category` only selects the
//!   cache TTL.

use anyhow::{Result, anyhow};
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use gambit_lib::Mediator;
use gambit_lib::cache::{KEY_NAMESPACE, cache_response};
use gambit_lib::limiter::rate_limit;
use gambit_lib::upstream::{BrokerError, SubmitError, UpstreamError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fallback wait when a throttled provider gave no `Retry-After`
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct AppState {
    mediator: Mediator,
    deadline: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

fn error_response(status: StatusCode, error: &'static str, message: String) -> Response {
    let body = ErrorBody {
        error,
        message,
        retry_after: None,
    };
    (status, Json(body)).into_response()
}

fn unavailable(message: String, retry_after: u64) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    let body = ErrorBody {
        error: "Provider unavailable",
        message,
        retry_after: Some(retry_after),
    };
    (StatusCode::SERVICE_UNAVAILABLE, headers, Json(body)).into_response()
}

/// Build the application router.
///
/// Provider routes are limited by the `api_policy` limiter, then served from
/// the cache where possible.
pub(crate) fn router(mediator: Mediator, api_policy: &str, deadline: Duration) -> Result<Router> {
    let limiter = mediator
        .limiter(api_policy)
        .ok_or_else(|| anyhow!("No limiter policy named `{api_policy}` is configured"))?;

    let state = AppState {
        mediator: mediator.clone(),
        deadline,
    };
    let providers = Router::new()
        .route("/api/{category}/{provider}/{*path}", get(proxy))
        .layer(from_fn_with_state(mediator.cache_state(), cache_response))
        .layer(from_fn_with_state(limiter, rate_limit));

    Ok(Router::new()
        .route("/api/stats", get(stats))
        .route("/api/stats/upstreams", get(upstream_stats))
        .route("/api/cache", delete(invalidate))
        .merge(providers)
        .with_state(state))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.mediator.snapshot())
}

async fn upstream_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.mediator.upstream_stats())
}

#[derive(Debug, Deserialize)]
struct InvalidateParams {
    pattern: Option<String>,
}

#[derive(Debug, Serialize)]
struct InvalidateBody {
    removed: usize,
}

async fn invalidate(
    State(state): State<AppState>,
    Query(params): Query<InvalidateParams>,
) -> Response {
    let pattern = params
        .pattern
        .unwrap_or_else(|| format!("{KEY_NAMESPACE}:*"));
    match state.mediator.cache().invalidate_pattern(&pattern).await {
        Ok(removed) => {
            log::info!("Invalidated {removed} cache records matching `{pattern}`");
            Json(InvalidateBody { removed }).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, "Invalid pattern", e.to_string()),
    }
}

async fn proxy(
    State(state): State<AppState>,
    Path((_category, provider, path)): Path<(String, String, String)>,
    uri: Uri,
) -> Response {
    let client = match state.mediator.provider(&provider) {
        Ok(client) => client,
        Err(e) => {
            log::debug!("{e}");
            return error_response(
                StatusCode::NOT_FOUND,
                "Unknown provider",
                format!("No provider named `{provider}`"),
            );
        }
    };

    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let task = match client.fetch(&path_and_query) {
        Ok(task) => task,
        Err(e) => {
            log::debug!("Cannot build provider URL for `{path_and_query}`: {e}");
            return error_response(
                StatusCode::BAD_REQUEST,
                "Invalid path",
                "The requested path is not valid".to_string(),
            );
        }
    };

    let submitted = state.mediator.broker().submit(&provider, task);
    let result = match tokio::time::timeout(state.deadline, submitted).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Request to {provider} exceeded {}s", state.deadline.as_secs());
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Provider timeout",
                format!("{provider} did not answer in time"),
            );
        }
    };

    match result {
        Ok(response) => {
            let mut headers = HeaderMap::new();
            if let Some(content_type) = response
                .content_type
                .and_then(|value| HeaderValue::from_str(&value).ok())
            {
                headers.insert(CONTENT_TYPE, content_type);
            }
            (response.status, headers, response.body).into_response()
        }
        Err(e) => upstream_failure(&provider, &e),
    }
}

fn upstream_failure(provider: &str, error: &SubmitError<UpstreamError>) -> Response {
    log::warn!("Request to {provider} failed: {error}");
    if let Some(throttled) = error.throttled() {
        let retry_after = throttled
            .retry_after
            .map_or(DEFAULT_RETRY_AFTER_SECS, |delay| delay.as_secs().max(1));
        return unavailable(format!("{provider} is rate limiting us"), retry_after);
    }
    match error {
        SubmitError::Broker(BrokerError::QueueFull { .. }) => {
            unavailable(format!("Too many requests queued for {provider}"), 1)
        }
        SubmitError::Task(UpstreamError::Status(status)) if *status == StatusCode::NOT_FOUND => {
            error_response(
                StatusCode::NOT_FOUND,
                "Not found",
                format!("{provider} has no such resource"),
            )
        }
        _ => error_response(
            StatusCode::BAD_GATEWAY,
            "Provider error",
            format!("{provider} request failed"),
        ),
    }
}
